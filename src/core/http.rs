use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::chrono::prelude::*;
use crate::core::cookie::{parse_cookie_header, Cookie, SESSION_COOKIE};
use crate::core::error::HandlerError;
use crate::core::session::Session;
use crate::hashbrown::HashMap;
use crate::support::common::{flush_buffer, parse_query, write_to_buff, LineBreakUtil};

lazy_static! {
    static ref STATUS_REASONS: HashMap<u16, &'static str> = {
        let mut reasons = HashMap::new();
        reasons.insert(100, "Continue");
        reasons.insert(200, "OK");
        reasons.insert(201, "Created");
        reasons.insert(202, "Accepted");
        reasons.insert(204, "No Content");
        reasons.insert(206, "Partial Content");
        reasons.insert(301, "Moved Permanently");
        reasons.insert(302, "Found");
        reasons.insert(303, "See Other");
        reasons.insert(304, "Not Modified");
        reasons.insert(307, "Temporary Redirect");
        reasons.insert(400, "Bad Request");
        reasons.insert(401, "Unauthorized");
        reasons.insert(403, "Forbidden");
        reasons.insert(404, "Not Found");
        reasons.insert(405, "Method Not Allowed");
        reasons.insert(408, "Request Timeout");
        reasons.insert(411, "Length Required");
        reasons.insert(413, "Payload Too Large");
        reasons.insert(500, "Internal Server Error");
        reasons.insert(501, "Not Implemented");
        reasons.insert(503, "Service Unavailable");
        reasons.insert(505, "HTTP Version Not Supported");
        reasons
    };
}

pub fn status_reason(status: u16) -> &'static str {
    STATUS_REASONS.get(&status).copied().unwrap_or("Unknown")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http09,
    Http10,
    Http11,
}

impl Protocol {
    pub fn parse(raw: &str) -> Option<Protocol> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "" | "HTTP/0.9" => Some(Protocol::Http09),
            "HTTP/1.0" => Some(Protocol::Http10),
            "HTTP/1.1" => Some(Protocol::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http09 => "HTTP/0.9",
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http11
    }
}

/// Decide whether the connection closes once this response is out.
///
/// HTTP/0.x always closes. Without a `Connection` header in either direction, HTTP/1.0 closes and
/// HTTP/1.1 closes only when the body length is unknown. An explicit header (the response's wins
/// over the request's) closes on `close` or on an unknown body length.
pub fn close_after_request(
    protocol: Protocol,
    request_connection: Option<&str>,
    response_connection: Option<&str>,
    has_content_length: bool,
) -> bool {
    if protocol == Protocol::Http09 {
        return true;
    }

    match (response_connection, request_connection) {
        (None, None) => protocol == Protocol::Http10 || !has_content_length,
        (Some(value), _) | (None, Some(value)) => {
            value.trim().eq_ignore_ascii_case("close") || !has_content_length
        }
    }
}

pub type AttributeValue = Arc<dyn Any + Send + Sync>;

/// Path view captured when a forward or include starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathAttributes {
    pub request_uri: String,
    pub context_path: String,
    pub servlet_path: String,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
}

/// What an error page gets to see about the failure it renders.
#[derive(Debug, Clone)]
pub struct ErrorAttributes {
    pub status: u16,
    pub message: String,
    pub handler_name: Option<String>,
    pub cause: Option<HandlerError>,
    pub request_uri: String,
}

#[derive(Debug, Clone)]
struct IncludeFrame {
    query_string: Option<String>,
    attributes: Option<PathAttributes>,
}

#[derive(Default)]
pub struct Request {
    method: String,
    request_uri: String,
    query_string: Option<String>,
    protocol: Protocol,
    headers: HashMap<String, Vec<String>>,
    cookies: HashMap<String, String>,
    body: Vec<u8>,
    remote_addr: Option<SocketAddr>,

    context_path: String,
    servlet_path: String,
    path_info: Option<String>,

    attributes: HashMap<String, AttributeValue>,
    forward_attributes: Option<PathAttributes>,
    error_attributes: Option<ErrorAttributes>,
    include_stack: Vec<IncludeFrame>,

    requested_session_id: Option<String>,
    requested_session_missing: bool,
    session: Option<Arc<Session>>,
    used_sessions: Vec<Arc<Session>>,
}

impl Request {
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The undecoded path of the request line, without the query string.
    #[inline]
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    #[inline]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn header_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.headers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    #[inline]
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    #[inline]
    pub fn servlet_path(&self) -> &str {
        &self.servlet_path
    }

    #[inline]
    pub fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    /// Path inside the application: servlet path followed by path info.
    pub fn full_path(&self) -> String {
        match self.path_info.as_deref() {
            Some(info) => [self.servlet_path.as_str(), info].concat(),
            None => self.servlet_path.clone(),
        }
    }

    /// First value of a query parameter. An active include's query string shadows the request's.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.parameters(name).into_iter().next()
    }

    pub fn parameters(&self, name: &str) -> Vec<String> {
        let mut values = Vec::new();
        let include_query = self
            .include_stack
            .last()
            .and_then(|frame| frame.query_string.as_deref());

        for query in include_query.into_iter().chain(self.query_string.as_deref()) {
            values.extend(
                parse_query(query)
                    .into_iter()
                    .filter(|(key, _)| key == name)
                    .map(|(_, value)| value),
            );
        }

        values
    }

    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.attributes
            .get(name)
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn set_attribute<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        self.attributes.insert(name.to_owned(), Arc::new(value));
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Path view of the original request, set by the first forward.
    #[inline]
    pub fn forward_attributes(&self) -> Option<&PathAttributes> {
        self.forward_attributes.as_ref()
    }

    /// Path view of the innermost active include.
    pub fn include_attributes(&self) -> Option<&PathAttributes> {
        self.include_stack
            .last()
            .and_then(|frame| frame.attributes.as_ref())
    }

    #[inline]
    pub fn include_depth(&self) -> usize {
        self.include_stack.len()
    }

    #[inline]
    pub fn error_attributes(&self) -> Option<&ErrorAttributes> {
        self.error_attributes.as_ref()
    }

    #[inline]
    pub fn requested_session_id(&self) -> Option<&str> {
        self.requested_session_id.as_deref()
    }

    /// The client sent a session id that no longer resolves to a session.
    #[inline]
    pub fn is_requested_session_missing(&self) -> bool {
        self.requested_session_missing
    }

    #[inline]
    pub fn current_session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref().filter(|session| session.is_valid())
    }

    pub(crate) fn set_request_line(
        &mut self,
        method: &str,
        request_uri: &str,
        query_string: Option<&str>,
        protocol: Protocol,
    ) {
        self.method = method.to_ascii_uppercase();
        self.request_uri = request_uri.to_owned();
        self.query_string = query_string.map(str::to_owned);
        self.protocol = protocol;
    }

    pub(crate) fn add_header(&mut self, name: &str, value: &str) {
        let key = name.trim().to_ascii_lowercase();
        let value = value.trim();

        if key == "cookie" {
            parse_cookie_header(value, &mut self.cookies);
            if self.requested_session_id.is_none() {
                self.requested_session_id = self.cookies.get(SESSION_COOKIE).cloned();
            }
        }

        self.headers
            .entry(key)
            .or_insert_with(Vec::new)
            .push(value.to_owned());
    }

    #[inline]
    pub(crate) fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    #[inline]
    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    #[inline]
    pub(crate) fn set_context_path(&mut self, context_path: &str) {
        self.context_path = context_path.to_owned();
    }

    pub(crate) fn set_paths(&mut self, servlet_path: &str, path_info: Option<&str>) {
        self.servlet_path = servlet_path.to_owned();
        self.path_info = path_info.map(str::to_owned);
    }

    pub(crate) fn current_path_attributes(&self) -> PathAttributes {
        PathAttributes {
            request_uri: self.request_uri.clone(),
            context_path: self.context_path.clone(),
            servlet_path: self.servlet_path.clone(),
            path_info: self.path_info.clone(),
            query_string: self.query_string.clone(),
        }
    }

    /// Only the first forward records the original view.
    pub(crate) fn capture_forward_attributes(&mut self) {
        if self.forward_attributes.is_none() {
            self.forward_attributes = Some(self.current_path_attributes());
        }
    }

    #[inline]
    pub(crate) fn set_error_attributes(&mut self, error: ErrorAttributes) {
        self.error_attributes = Some(error);
    }

    /// Re-point the request at a forward target. Parameters of the target's query string take
    /// precedence over the original ones.
    pub(crate) fn apply_forward(
        &mut self,
        request_uri: &str,
        servlet_path: &str,
        path_info: Option<&str>,
        query_string: Option<&str>,
    ) {
        self.request_uri = [self.context_path.as_str(), request_uri].concat();
        self.set_paths(servlet_path, path_info);

        if let Some(query) = query_string.filter(|q| !q.is_empty()) {
            self.query_string = match self.query_string.take() {
                Some(existing) if !existing.is_empty() => Some(format!("{}&{}", query, existing)),
                _ => Some(query.to_owned()),
            };
        }
    }

    pub(crate) fn push_include(
        &mut self,
        query_string: Option<&str>,
        attributes: Option<PathAttributes>,
    ) {
        self.include_stack.push(IncludeFrame {
            query_string: query_string.map(str::to_owned),
            attributes,
        });
    }

    pub(crate) fn pop_include(&mut self) {
        self.include_stack.pop();
    }

    #[inline]
    pub(crate) fn clear_include_stack(&mut self) {
        self.include_stack.clear();
    }

    pub(crate) fn mark_requested_session_missing(&mut self) {
        self.requested_session_missing = true;
    }

    /// Make `session` the request's current session. The session arrives already claimed for
    /// this request; a second claim on a session the request holds is handed back.
    pub(crate) fn attach_session(&mut self, session: Arc<Session>) {
        if self
            .used_sessions
            .iter()
            .any(|used| Arc::ptr_eq(used, &session))
        {
            session.release_claim();
        } else {
            self.used_sessions.push(Arc::clone(&session));
        }

        self.requested_session_missing = false;
        self.session = Some(session);
    }

    /// Release every session this request touched.
    pub(crate) fn finish_sessions(&mut self) {
        for session in self.used_sessions.drain(..) {
            session.request_finished();
        }

        self.session = None;
    }

    /// Back to the freshly constructed state.
    pub(crate) fn reset(&mut self) {
        self.finish_sessions();
        *self = Request::default();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("request_uri", &self.request_uri)
            .field("query_string", &self.query_string)
            .field("protocol", &self.protocol)
            .field("servlet_path", &self.servlet_path)
            .field("path_info", &self.path_info)
            .field("include_depth", &self.include_stack.len())
            .finish()
    }
}

const DEFAULT_BUFFER_SIZE: usize = 8192;

pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    content_length: Option<usize>,
    server_name: String,

    protocol: Protocol,
    request_connection: Option<String>,
    head_only: bool,

    buffer: Vec<u8>,
    buffer_size: usize,
    include_stack: Vec<Vec<u8>>,
    writer: Option<Box<dyn Write + Send>>,

    committed: bool,
    closed: bool,
    close_after: bool,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            content_length: None,
            server_name: String::new(),
            protocol: Protocol::Http11,
            request_connection: None,
            head_only: false,
            buffer: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            include_stack: Vec::new(),
            writer: None,
            committed: false,
            closed: false,
            close_after: false,
        }
    }
}

impl Response {
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Ignored while an include is writing, or once the headers are out.
    pub fn set_status(&mut self, status: u16) {
        if self.is_including() || self.committed {
            return;
        }

        self.status = status;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace every header called `name`.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.is_including() || self.committed {
            return;
        }

        if name.eq_ignore_ascii_case("content-length") {
            self.content_length = value.trim().parse::<usize>().ok();
            return;
        }

        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.is_including() || self.committed {
            return;
        }

        self.headers.push((name.to_owned(), value.to_owned()));
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("Content-Type", content_type);
    }

    #[inline]
    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn set_content_length(&mut self, length: usize) {
        if self.is_including() || self.committed {
            return;
        }

        self.content_length = Some(length);
    }

    pub(crate) fn clear_content_length(&mut self) {
        if !self.committed {
            self.content_length = None;
        }
    }

    pub fn add_cookie(&mut self, cookie: Cookie) {
        if self.is_including() || self.committed || !cookie.is_valid() {
            return;
        }

        self.cookies.push(cookie);
    }

    #[inline]
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn is_including(&self) -> bool {
        !self.include_stack.is_empty()
    }

    /// Bytes written but not yet sent. Inside an include this is the include's own buffer.
    pub fn buffered(&self) -> &[u8] {
        match self.include_stack.last() {
            Some(top) => top,
            None => &self.buffer,
        }
    }

    /// Drop buffered body bytes. Fails once the headers are on the wire.
    pub fn reset_buffer(&mut self) -> Result<(), HandlerError> {
        if self.committed {
            return Err(HandlerError::IllegalState(
                "cannot reset the buffer of a committed response".to_owned(),
            ));
        }

        self.buffer.clear();
        Ok(())
    }

    /// Drop buffered body, status and headers.
    pub fn reset(&mut self) -> Result<(), HandlerError> {
        self.reset_buffer()?;
        self.status = 200;
        self.headers.clear();
        self.cookies.clear();
        self.content_length = None;
        Ok(())
    }

    pub fn send_redirect(&mut self, location: &str) -> Result<(), HandlerError> {
        if self.committed {
            return Err(HandlerError::IllegalState(
                "cannot redirect after the response has been committed".to_owned(),
            ));
        }

        self.reset()?;
        self.status = 302;
        self.set_header("Location", location);
        self.set_content_type("text/html; charset=utf-8");
        let body = format!(
            "<html><body>Moved to <a href=\"{0}\">{0}</a></body></html>",
            crate::support::common::html_escape(location)
        );
        self.buffer.extend_from_slice(body.as_bytes());
        Ok(())
    }

    /// Set by the connection at allocation time.
    pub(crate) fn prepare(
        &mut self,
        server_name: &str,
        buffer_size: usize,
        writer: Box<dyn Write + Send>,
    ) {
        self.server_name = server_name.to_owned();
        self.buffer_size = buffer_size;
        self.writer = Some(writer);
    }

    pub(crate) fn bind_request(&mut self, request: &Request) {
        self.protocol = request.protocol();
        self.request_connection = request.header("connection").map(str::to_owned);
        self.head_only = request.method() == "HEAD";
    }

    /// The keep-alive decision taken when the headers were committed.
    #[inline]
    pub(crate) fn close_after(&self) -> bool {
        self.close_after
    }

    pub(crate) fn start_include_buffer(&mut self) {
        self.include_stack.push(Vec::new());
    }

    /// Pop the innermost include buffer into whatever encloses it.
    pub(crate) fn finish_include_buffer(&mut self) -> io::Result<()> {
        let bytes = match self.include_stack.pop() {
            Some(bytes) => bytes,
            None => return Ok(()),
        };

        match self.include_stack.last_mut() {
            Some(parent) => {
                parent.extend_from_slice(&bytes);
                Ok(())
            }
            None => self.write_all(&bytes),
        }
    }

    #[inline]
    pub(crate) fn clear_include_stack(&mut self) {
        self.include_stack.clear();
    }

    fn commit(&mut self) -> io::Result<()> {
        if self.committed {
            return Ok(());
        }

        self.committed = true;
        self.close_after = close_after_request(
            self.protocol,
            self.request_connection.as_deref(),
            self.header("connection"),
            self.content_length.is_some(),
        );

        if self.protocol == Protocol::Http09 {
            return Ok(());
        }

        if self.header("connection").is_none() {
            if self.close_after {
                self.headers.push(("Connection".to_owned(), "close".to_owned()));
            } else if self.protocol == Protocol::Http10 {
                self.headers.push(("Connection".to_owned(), "Keep-Alive".to_owned()));
            }
        }

        let mut head = String::with_capacity(256);
        head.push_str(&format!(
            "{} {} {}",
            self.protocol.as_str(),
            self.status,
            status_reason(self.status)
        ));
        head.append_line_break();

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        head.push_str(&format!("Date: {}", date));
        head.append_line_break();

        if !self.server_name.is_empty() && self.header("server").is_none() {
            head.push_str(&format!("Server: {}", self.server_name));
            head.append_line_break();
        }

        if let Some(length) = self.content_length {
            head.push_str(&format!("Content-Length: {}", length));
            head.append_line_break();
        }

        for (key, value) in self.headers.iter() {
            head.push_str(&format!("{}: {}", key, value));
            head.append_line_break();
        }

        for cookie in self.cookies.iter() {
            head.push_str(&format!("Set-Cookie: {}", cookie.to_header_value()));
            head.append_line_break();
        }

        head.append_line_break();

        match self.writer.as_mut() {
            Some(writer) => write_to_buff(writer.as_mut(), head.as_bytes()),
            None => Ok(()),
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        self.commit()?;

        let body = std::mem::take(&mut self.buffer);
        if let Some(writer) = self.writer.as_mut() {
            if !self.head_only && !body.is_empty() {
                write_to_buff(writer.as_mut(), &body)?;
            }

            flush_buffer(writer.as_mut())?;
        }

        Ok(())
    }

    /// Send everything that is left and stop accepting body bytes. An uncommitted response gets
    /// an exact `Content-Length`.
    pub(crate) fn finish(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }

        while self.is_including() {
            self.finish_include_buffer()?;
        }

        if !self.committed && self.content_length.is_none() {
            self.content_length = Some(self.buffer.len());
        }

        let result = self.flush_buffer();
        self.closed = true;
        result
    }

    pub(crate) fn reset_for_pool(&mut self) {
        *self = Response::default();
    }
}

impl Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(buf.len());
        }

        if let Some(top) = self.include_stack.last_mut() {
            top.extend_from_slice(buf);
            return Ok(buf.len());
        }

        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= self.buffer_size {
            self.flush_buffer()?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed || self.is_including() {
            return Ok(());
        }

        self.flush_buffer()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .field("buffered", &self.buffer.len())
            .field("include_depth", &self.include_stack.len())
            .field("committed", &self.committed)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Shared in-memory sink, handy wherever a response needs somewhere to write.
#[derive(Clone, Default)]
pub struct CaptureBuffer(Arc<crate::parking_lot::Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
