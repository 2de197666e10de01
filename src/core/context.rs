//! One mounted application: its handlers, mappings, filters, error pages and sessions.
//!
//! Everything here is built once from an [`AppDescriptor`] and only read afterwards, apart from
//! the filter-match cache, which has its own lock, and the handler init slots inside the registry.

use std::cmp::Ordering;
use std::io::Write;
use std::sync::Arc;

use crate::core::cookie::{Cookie, SESSION_COOKIE};
use crate::core::descriptor::{
    AppDescriptor, Authenticator, ContextListener, ErrorPageKey, FilterTarget, RequestListener,
    StaticContent,
};
use crate::core::dispatch::{DispatchType, FilterKey, RequestDispatcher};
use crate::core::error::{class_is_a, ConfigError, HandlerError};
use crate::core::http::{status_reason, AttributeValue, ErrorAttributes, Request, Response};
use crate::core::registry::{
    Factories, FilterRegistration, Handler, HandlerConfig, HandlerRegistration, HandlerRegistry,
};
use crate::core::router::{Mapping, MappingKind, UrlMap};
use crate::core::session::{JsonCodec, Session, SessionCodec, SessionStore};
use crate::hashbrown::HashMap;
use crate::parking_lot::{Mutex, RwLock};
use crate::support::common::{decode_component, html_escape};
use crate::support::debug::{self, InfoLevel};

const ERROR_PAGE_HANDLER: &str = "error-page";
const ALL_DISPATCH_TYPES: [DispatchType; 4] = [
    DispatchType::Request,
    DispatchType::Forward,
    DispatchType::Include,
    DispatchType::Error,
];

type FilterChain = Arc<Vec<Arc<FilterRegistration>>>;

type FilterCacheKey = (DispatchType, FilterKey, String);

pub struct AppContext {
    name: String,
    context_path: String,
    init_params: Vec<(String, String)>,
    attributes: RwLock<HashMap<String, AttributeValue>>,

    registry: HandlerRegistry,
    url_map: UrlMap<HandlerRegistration>,
    filter_mappings: HashMap<DispatchType, Vec<(Mapping, Arc<FilterRegistration>)>>,
    filter_cache: Mutex<HashMap<FilterCacheKey, FilterChain>>,
    error_handler: Arc<HandlerRegistration>,

    status_pages: HashMap<u16, String>,
    class_pages: Vec<(String, String)>,
    welcome_files: Vec<String>,

    sessions: SessionStore,
    distributable: bool,
    descriptor: AppDescriptor,

    startup_error: RwLock<Option<HandlerError>>,
}

impl AppContext {
    /// Compile `descriptor`. Every configuration problem surfaces here.
    pub fn build(descriptor: &AppDescriptor, factories: &Factories) -> Result<AppContext, ConfigError> {
        let mut registry = HandlerRegistry::new();

        for def in descriptor.handlers.iter() {
            let factory = factories.handler_factory(&def.target);
            if factory.is_none() {
                debug::print(
                    &format!("No factory registered for handler {} ({})", def.name, def.target),
                    InfoLevel::Warning,
                );
            }

            registry.add_handler(HandlerRegistration::new(
                HandlerConfig::new(&def.name, def.init_params.clone()),
                &def.target,
                def.load_on_startup,
                def.single_threaded,
                factory,
            ))?;
        }

        for def in descriptor.filters.iter() {
            registry.add_filter(FilterRegistration::new(
                HandlerConfig::new(&def.name, def.init_params.clone()),
                &def.target,
                factories.filter_factory(&def.target),
            ))?;
        }

        let mut mappings = Vec::with_capacity(descriptor.mappings.len());
        for (pattern, handler) in descriptor.mappings.iter() {
            mappings.push(Mapping::url(pattern, handler)?);
        }

        let url_map = UrlMap::build(mappings, |name| registry.registered_handler(name))?;
        let filter_mappings = compile_filter_mappings(descriptor, &registry)?;

        let mut status_pages = HashMap::new();
        let mut class_pages = Vec::new();
        for (key, location) in descriptor.error_pages.iter() {
            match key {
                ErrorPageKey::Status(status) => {
                    status_pages.insert(*status, location.clone());
                }
                ErrorPageKey::Class(class) => class_pages.push((class.clone(), location.clone())),
            }
        }

        // deepest class first, so the most specific ancestor wins
        class_pages.sort_by_key(|(class, _)| std::cmp::Reverse(class.split('.').count()));

        let codec: Arc<dyn SessionCodec> = match descriptor.session_codec.as_ref() {
            Some(codec) => Arc::clone(codec),
            None => Arc::new(JsonCodec),
        };

        let cluster = if descriptor.distributable {
            descriptor.cluster.clone()
        } else {
            None
        };

        let sessions = SessionStore::new(
            &descriptor.name,
            descriptor.session_timeout_minutes,
            descriptor.session_listeners.clone(),
            cluster,
            codec,
        );

        Ok(AppContext {
            name: descriptor.name.clone(),
            context_path: descriptor.normalized_context_path(),
            init_params: descriptor.init_params.clone(),
            attributes: RwLock::new(HashMap::new()),
            registry,
            url_map,
            filter_mappings,
            filter_cache: Mutex::new(HashMap::new()),
            error_handler: Arc::new(builtin_error_handler()),
            status_pages,
            class_pages,
            welcome_files: descriptor.welcome_files.clone(),
            sessions,
            distributable: descriptor.distributable,
            descriptor: descriptor.clone(),
            startup_error: RwLock::new(None),
        })
    }

    /// Restore persisted sessions, run context listeners, then eager handlers. A failing context
    /// listener leaves the application answering 500 to everything.
    pub fn start(&self) {
        if let Some(dir) = self.descriptor.session_dir.as_ref() {
            match self.sessions.load(dir) {
                Ok(count) if count > 0 => debug::print(
                    &format!("Restored {} sessions for {}", count, self.name),
                    InfoLevel::Info,
                ),
                Ok(_) => {}
                Err(err) => debug::print(
                    &format!("Unable to restore sessions for {}: {}", self.name, err),
                    InfoLevel::Warning,
                ),
            }
        }

        for listener in self.context_listeners() {
            if let Err(err) = listener.context_initialized(self) {
                debug::print(
                    &format!("Application {} failed to start: {}", self.name, err),
                    InfoLevel::Error,
                );
                *self.startup_error.write() = Some(err);
                return;
            }
        }

        self.registry.init_on_startup();
    }

    /// Tear down in reverse: filters, handlers, sessions, then context listeners.
    pub fn destroy(&self) {
        self.filter_cache.lock().clear();
        self.registry.destroy_all();

        match self.descriptor.session_dir.as_ref() {
            Some(dir) => {
                if let Err(err) = self.sessions.persist(dir) {
                    debug::print(
                        &format!("Unable to persist sessions for {}: {}", self.name, err),
                        InfoLevel::Error,
                    );
                    self.sessions.invalidate_all();
                }
            }
            None => self.sessions.invalidate_all(),
        }

        for listener in self.context_listeners().iter().rev() {
            listener.context_destroyed(self);
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    #[inline]
    pub fn descriptor(&self) -> &AppDescriptor {
        &self.descriptor
    }

    pub fn init_parameter(&self, key: &str) -> Option<&str> {
        self.init_params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes.read().get(name).cloned()
    }

    pub fn set_attribute<T: std::any::Any + Send + Sync>(&self, name: &str, value: T) {
        self.attributes
            .write()
            .insert(name.to_owned(), Arc::new(value));
    }

    #[inline]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    #[inline]
    pub fn url_map(&self) -> &UrlMap<HandlerRegistration> {
        &self.url_map
    }

    #[inline]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn startup_error(&self) -> Option<HandlerError> {
        self.startup_error.read().clone()
    }

    pub(crate) fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.descriptor.authenticator.as_ref()
    }

    fn static_content(&self) -> Option<&Arc<dyn StaticContent>> {
        self.descriptor.static_content.as_ref()
    }

    fn context_listeners(&self) -> &[Arc<dyn ContextListener>] {
        &self.descriptor.context_listeners
    }

    fn request_listeners(&self) -> &[Arc<dyn RequestListener>] {
        &self.descriptor.request_listeners
    }

    /// Run one request through the application. Failures become error pages; nothing propagates.
    pub(crate) fn process(&self, req: &mut Request, resp: &mut Response) {
        req.set_context_path(&self.context_path);

        for listener in self.request_listeners() {
            listener.request_initialized(self, req);
        }

        let mut target = None;
        if let Err(err) = self.serve(req, resp, &mut target) {
            self.handle_failure(req, resp, err, target.as_deref());
        }

        for listener in self.request_listeners().iter().rev() {
            listener.request_destroyed(self, req);
        }

        req.finish_sessions();
    }

    /// `target` receives the name of the handler the request resolved to.
    fn serve(
        &self,
        req: &mut Request,
        resp: &mut Response,
        target: &mut Option<String>,
    ) -> Result<(), HandlerError> {
        if let Some(err) = self.startup_error() {
            return self.send_error(req, resp, 500, Some(&err.summary()));
        }

        self.check_requested_session(req, resp);

        match self.initial_dispatcher(req, resp)? {
            Some(mut dispatcher) => {
                *target = Some(dispatcher.target_name().to_owned());
                dispatcher.forward(self, req, resp)
            }
            None => Ok(()),
        }
    }

    fn handle_failure(
        &self,
        req: &mut Request,
        resp: &mut Response,
        err: HandlerError,
        handler: Option<&str>,
    ) {
        debug::print(
            &format!("Request {} failed: {}", req.request_uri(), err),
            InfoLevel::Error,
        );

        if resp.is_committed() {
            return;
        }

        if req.error_attributes().is_some() {
            let status = if err.is_unavailable() { 503 } else { 500 };
            self.render_fallback(req, resp, status, &err.summary());
            return;
        }

        let mut dispatcher = self.error_dispatcher_by_cause(req, &err, handler);
        if let Err(err) = self.run_error_dispatch(&mut dispatcher, req, resp) {
            debug::print(
                &format!("Error dispatch for {} failed: {}", req.request_uri(), err),
                InfoLevel::Error,
            );
        }
    }

    /// The path below the context root, percent-decoded.
    fn path_within(&self, request_uri: &str) -> String {
        let rest = request_uri
            .get(self.context_path.len()..)
            .unwrap_or_default();
        decode_component(rest, false)
    }

    /// Resolve the request to its dispatcher, or answer it directly (redirects, 400, 404) and
    /// return `None`.
    pub(crate) fn initial_dispatcher(
        &self,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<Option<RequestDispatcher>, HandlerError> {
        let path = self.path_within(req.request_uri());

        if path.is_empty() {
            let location = self.with_query(&format!("{}/", self.context_path), req);
            resp.send_redirect(&location)?;
            return Ok(None);
        }

        if !path.starts_with('/') {
            self.send_error(req, resp, 400, Some("request path must start with '/'"))?;
            return Ok(None);
        }

        let resolution = match self.url_map.resolve(&path) {
            Some(resolution) => resolution,
            None => {
                self.send_error(req, resp, 404, None)?;
                return Ok(None);
            }
        };

        if resolution.kind == MappingKind::Default {
            if let Some(location) = self.directory_redirect(&path) {
                let location = self.with_query(&location, req);
                resp.send_redirect(&location)?;
                return Ok(None);
            }
        }

        let dispatcher = RequestDispatcher::named(resolution.target, Some(DispatchType::Request))
            .with_path(
                &path,
                &resolution.servlet_path,
                resolution.path_info.as_deref(),
                None,
            );

        Ok(Some(dispatcher))
    }

    fn directory_redirect(&self, path: &str) -> Option<String> {
        if path.ends_with('/') {
            return self.welcome_files.iter().find_map(|file| {
                let candidate = format!("{}{}", path, file);
                let mapped = self
                    .url_map
                    .resolve(&candidate)
                    .map_or(false, |hit| hit.kind != MappingKind::Default);
                let exists = self
                    .static_content()
                    .map_or(false, |content| content.exists(&candidate));

                if mapped || exists {
                    Some(format!("{}{}", self.context_path, candidate))
                } else {
                    None
                }
            });
        }

        match self.static_content() {
            Some(content) if content.is_directory(path) => {
                Some(format!("{}{}/", self.context_path, path))
            }
            _ => None,
        }
    }

    fn with_query(&self, location: &str, req: &Request) -> String {
        match req.query_string() {
            Some(query) if !query.is_empty() => format!("{}?{}", location, query),
            _ => location.to_owned(),
        }
    }

    /// A dispatcher for a path inside this application, optionally carrying `?query`.
    pub fn request_dispatcher(&self, path: &str) -> Option<RequestDispatcher> {
        if !path.starts_with('/') {
            debug::print(
                &format!("Dispatch path {} does not start with '/'", path),
                InfoLevel::Warning,
            );
            return None;
        }

        let (raw_path, query) = match path.find('?') {
            Some(pos) => (&path[..pos], Some(&path[pos + 1..])),
            None => (path, None),
        };

        let decoded = decode_component(raw_path, false);
        let resolution = self.url_map.resolve(&decoded)?;

        Some(RequestDispatcher::named(resolution.target, None).with_path(
            &decoded,
            &resolution.servlet_path,
            resolution.path_info.as_deref(),
            query,
        ))
    }

    /// A dispatcher for a live handler by name. Request paths stay as they are.
    pub fn named_dispatcher(&self, name: &str) -> Option<RequestDispatcher> {
        self.registry
            .handler(name)
            .map(|target| RequestDispatcher::named(target, None))
    }

    /// Error dispatch for a status code: the page registered for it, or the built-in page.
    pub fn error_dispatcher_by_code(
        &self,
        req: &Request,
        status: u16,
        message: Option<&str>,
    ) -> RequestDispatcher {
        let location = self.status_pages.get(&status).cloned();
        let error = ErrorAttributes {
            status,
            message: message.unwrap_or_else(|| status_reason(status)).to_owned(),
            handler_name: None,
            cause: None,
            request_uri: req.request_uri().to_owned(),
        };

        self.error_dispatcher(location.as_deref(), error)
    }

    /// Error dispatch for a failure. Each class along the cause chain, outermost first, is
    /// checked against the class pages, most specific first; without a hit the status page for
    /// 503 (unavailable) or 500 applies.
    pub fn error_dispatcher_by_cause(
        &self,
        req: &Request,
        cause: &HandlerError,
        handler_name: Option<&str>,
    ) -> RequestDispatcher {
        let status = if cause.is_unavailable() { 503 } else { 500 };

        let location = cause
            .class_chain()
            .into_iter()
            .find_map(|class| {
                self.class_pages
                    .iter()
                    .find(|(ancestor, _)| class_is_a(class, ancestor))
                    .map(|(_, location)| location.clone())
            })
            .or_else(|| self.status_pages.get(&status).cloned());

        let error = ErrorAttributes {
            status,
            message: cause.summary(),
            handler_name: handler_name.map(str::to_owned),
            cause: Some(cause.clone()),
            request_uri: req.request_uri().to_owned(),
        };

        self.error_dispatcher(location.as_deref(), error)
    }

    fn error_dispatcher(&self, location: Option<&str>, error: ErrorAttributes) -> RequestDispatcher {
        let routed = location.and_then(|location| {
            let (raw_path, query) = match location.find('?') {
                Some(pos) => (&location[..pos], Some(&location[pos + 1..])),
                None => (location, None),
            };

            self.url_map.resolve(raw_path).map(|hit| {
                RequestDispatcher::named(hit.target, Some(DispatchType::Error)).with_path(
                    raw_path,
                    &hit.servlet_path,
                    hit.path_info.as_deref(),
                    query,
                )
            })
        });

        routed
            .unwrap_or_else(|| {
                RequestDispatcher::named(Arc::clone(&self.error_handler), Some(DispatchType::Error))
            })
            .with_error(error)
    }

    /// Run an error dispatch. If the error page itself fails, the built-in page answers.
    pub(crate) fn run_error_dispatch(
        &self,
        dispatcher: &mut RequestDispatcher,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError> {
        if resp.is_committed() {
            debug::print(
                &format!("Response for {} already committed, dropping error page", req.request_uri()),
                InfoLevel::Warning,
            );
            return Ok(());
        }

        let (status, message) = dispatcher
            .pending_error()
            .unwrap_or((500, status_reason(500).to_owned()));

        if let Err(err) = dispatcher.forward(self, req, resp) {
            debug::print(
                &format!("Error page for {} failed: {}", req.request_uri(), err),
                InfoLevel::Error,
            );
            self.render_fallback(req, resp, status, &message);
        }

        Ok(())
    }

    /// Answer with an error status. Ignored inside an include.
    pub fn send_error(
        &self,
        req: &mut Request,
        resp: &mut Response,
        status: u16,
        message: Option<&str>,
    ) -> Result<(), HandlerError> {
        if resp.is_including() {
            return Ok(());
        }

        if resp.is_committed() {
            return Err(HandlerError::IllegalState(
                "cannot send an error after the response has been committed".to_owned(),
            ));
        }

        if req.error_attributes().is_some() {
            self.render_fallback(req, resp, status, message.unwrap_or_else(|| status_reason(status)));
            return Ok(());
        }

        let mut dispatcher = self.error_dispatcher_by_code(req, status, message);
        self.run_error_dispatch(&mut dispatcher, req, resp)
    }

    /// Write the built-in page directly, bypassing dispatch.
    fn render_fallback(&self, req: &Request, resp: &mut Response, status: u16, message: &str) {
        if resp.is_committed() {
            return;
        }

        resp.clear_include_stack();
        let _ = resp.reset();
        resp.set_status(status);

        let cause = req.error_attributes().and_then(|error| error.cause.as_ref());
        let page = render_error_page(status, message, cause, req.request_uri());
        write_error_page(resp, &page);

        if let Err(err) = resp.finish() {
            debug::print(&format!("Unable to write error page: {}", err), InfoLevel::Warning);
        }
    }

    /// Filters for a dispatch, memoized per dispatch type, path or handler name, and the handler
    /// the path resolved to. The path alone is not enough: name-linked filters follow the handler.
    pub(crate) fn matching_filters(
        &self,
        kind: DispatchType,
        key: &FilterKey,
        target_name: &str,
    ) -> FilterChain {
        let cache_key = (kind, key.clone(), target_name.to_owned());
        if let Some(chain) = self.filter_cache.lock().get(&cache_key) {
            return Arc::clone(chain);
        }

        let chain: Vec<Arc<FilterRegistration>> = self
            .filter_mappings
            .get(&kind)
            .map(|mappings| {
                mappings
                    .iter()
                    .filter(|(mapping, _)| match key {
                        FilterKey::Path(path) => {
                            mapping.matches_path(path) || mapping.matches_name(target_name)
                        }
                        FilterKey::Name(name) => mapping.matches_name(name),
                    })
                    .map(|(_, filter)| Arc::clone(filter))
                    .collect()
            })
            .unwrap_or_default();

        let chain = Arc::new(chain);
        self.filter_cache
            .lock()
            .entry(cache_key)
            .or_insert_with(|| Arc::clone(&chain));

        chain
    }

    /// Check the session id the client sent. An id that no longer resolves gets an expiring
    /// cookie so the client drops it.
    fn check_requested_session(&self, req: &mut Request, resp: &mut Response) {
        let requested = match req.requested_session_id() {
            Some(id) => id.to_owned(),
            None => return,
        };

        match self.sessions.claim(&requested, !self.distributable) {
            Some(session) => req.attach_session(session),
            None => {
                req.mark_requested_session_missing();
                resp.add_cookie(Cookie::expired(SESSION_COOKIE, self.cookie_path()));
            }
        }
    }

    fn cookie_path(&self) -> &str {
        if self.context_path.is_empty() {
            "/"
        } else {
            &self.context_path
        }
    }

    /// The request's session. With `create`, a missing session is created and its cookie set;
    /// that fails once the response is committed.
    pub fn session(
        &self,
        req: &mut Request,
        resp: &mut Response,
        create: bool,
    ) -> Result<Option<Arc<Session>>, HandlerError> {
        if let Some(current) = req.current_session().filter(|session| session.is_valid()) {
            return Ok(Some(Arc::clone(current)));
        }

        if let Some(id) = req.requested_session_id().map(str::to_owned) {
            if !req.is_requested_session_missing() {
                if let Some(session) = self.sessions.claim(&id, !self.distributable) {
                    req.attach_session(Arc::clone(&session));
                    return Ok(Some(session));
                }
                req.mark_requested_session_missing();
            }
        }

        if !create {
            return Ok(None);
        }

        if resp.is_committed() {
            return Err(HandlerError::IllegalState(
                "cannot create a session after the response has been committed".to_owned(),
            ));
        }

        let session = self.sessions.create_claimed();
        let mut cookie = Cookie::new(SESSION_COOKIE, session.id());
        cookie.set_path(self.cookie_path());
        cookie.set_http_only_attr(true);
        resp.add_cookie(cookie);

        req.attach_session(Arc::clone(&session));
        Ok(Some(session))
    }
}

fn compile_filter_mappings(
    descriptor: &AppDescriptor,
    registry: &HandlerRegistry,
) -> Result<HashMap<DispatchType, Vec<(Mapping, Arc<FilterRegistration>)>>, ConfigError> {
    let mut compiled: HashMap<DispatchType, Vec<(Mapping, Arc<FilterRegistration>)>> =
        HashMap::new();

    for def in descriptor.filter_mappings.iter() {
        let filter = registry.filter(&def.filter).ok_or_else(|| ConfigError::UnknownTarget {
            pattern: match &def.target {
                FilterTarget::Url(pattern) => pattern.clone(),
                FilterTarget::Handler(name) => name.clone(),
            },
            target: def.filter.clone(),
        })?;

        let mapping = match &def.target {
            FilterTarget::Url(pattern) => Mapping::url(pattern, &def.filter)?,
            FilterTarget::Handler(name) => Mapping::name_link(name, &def.filter),
        };

        let dispatches: &[DispatchType] = if def.dispatches.is_empty() {
            &ALL_DISPATCH_TYPES[..1]
        } else {
            &def.dispatches
        };

        for kind in dispatches {
            compiled
                .entry(*kind)
                .or_default()
                .push((mapping.clone(), Arc::clone(&filter)));
        }
    }

    // stable, so filters on the same pattern keep their declaration order
    for mappings in compiled.values_mut() {
        mappings.sort_by(|(a, _), (b, _)| filter_precedence(a, b));
    }

    Ok(compiled)
}

fn filter_precedence(a: &Mapping, b: &Mapping) -> Ordering {
    if a.kind() == MappingKind::NameLink && b.kind() == MappingKind::NameLink {
        return a.key().cmp(b.key());
    }

    a.kind()
        .cmp(&b.kind())
        .then_with(|| b.key().len().cmp(&a.key().len()))
        .then_with(|| a.pattern().cmp(b.pattern()))
}

/// Renders error attributes as a small HTML page. Never fails.
struct ErrorPageHandler;

impl Handler for ErrorPageHandler {
    fn service(
        &self,
        _ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError> {
        let (status, message, cause) = match req.error_attributes() {
            Some(error) => (error.status, error.message.clone(), error.cause.clone()),
            None => (resp.status(), status_reason(resp.status()).to_owned(), None),
        };

        let page = render_error_page(status, &message, cause.as_ref(), req.request_uri());
        write_error_page(resp, &page);
        Ok(())
    }
}

fn builtin_error_handler() -> HandlerRegistration {
    HandlerRegistration::new(
        HandlerConfig::new(ERROR_PAGE_HANDLER, Vec::new()),
        ERROR_PAGE_HANDLER,
        None,
        false,
        Some(Arc::new(|| Ok(Arc::new(ErrorPageHandler) as Arc<dyn Handler>))),
    )
}

pub(crate) fn write_error_page(resp: &mut Response, page: &str) {
    resp.set_content_type("text/html; charset=utf-8");
    resp.set_content_length(page.len());

    if let Err(err) = resp.write_all(page.as_bytes()) {
        debug::print(&format!("Unable to write error page: {}", err), InfoLevel::Warning);
    }
}

pub(crate) fn render_error_page(
    status: u16,
    message: &str,
    cause: Option<&HandlerError>,
    request_uri: &str,
) -> String {
    let mut page = format!(
        "<html><head><title>{0} {1}</title></head><body><h1>{0} {1}</h1><p>{2}</p><p>Request: {3}</p>",
        status,
        status_reason(status),
        html_escape(message),
        html_escape(request_uri)
    );

    if let Some(cause) = cause {
        page.push_str("<ul>");
        for class in cause.class_chain() {
            page.push_str("<li>");
            page.push_str(&html_escape(class));
            page.push_str("</li>");
        }
        page.push_str("</ul>");
    }

    page.push_str("</body></html>");
    page
}
