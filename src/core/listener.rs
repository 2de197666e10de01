//! The wire-protocol seam. The connection loop only talks to a [`Listener`], so another protocol
//! can reuse the same dispatch core by implementing it.

use crate::core::config::ServerConfig;
use crate::core::error::ConnError;
use crate::core::http::{Protocol, Request, Response};
use crate::core::stream::Stream;
use crate::support::debug::{self, InfoLevel};

pub(crate) trait Listener: Send + Sync {
    /// Wire a fresh request/response pair to the socket.
    fn allocate(&self, stream: &mut Stream, req: &mut Request, resp: &mut Response) -> Result<(), ConnError>;

    /// `Ok(false)` means there is no further request and the connection should close quietly.
    fn parse_request_line(&self, stream: &mut Stream, req: &mut Request, first: bool) -> Result<bool, ConnError>;

    fn parse_headers(&self, stream: &mut Stream, req: &mut Request) -> Result<(), ConnError>;

    fn deallocate(&self, req: &mut Request, resp: &mut Response);

    fn release_socket(&self, stream: Stream);

    /// Whether the connection carries another request after this one.
    fn process_keep_alive(&self, req: &Request, resp: &Response) -> bool;
}

pub(crate) struct HttpListener {
    config: ServerConfig,
}

impl HttpListener {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        HttpListener {
            config: config.clone(),
        }
    }
}

impl Listener for HttpListener {
    fn allocate(&self, stream: &mut Stream, req: &mut Request, resp: &mut Response) -> Result<(), ConnError> {
        let writer = stream.writer()?;
        req.set_remote_addr(stream.peer_addr());
        resp.prepare(
            self.config.get_server_name(),
            self.config.get_buffer_size(),
            writer,
        );
        Ok(())
    }

    fn parse_request_line(&self, stream: &mut Stream, req: &mut Request, first: bool) -> Result<bool, ConnError> {
        let timeout = if first {
            self.config.get_connection_timeout()
        } else {
            self.config.get_keep_alive_timeout()
        };
        stream.set_read_timeout(timeout)?;

        let line = loop {
            match stream.read_line() {
                // tolerate stray line breaks between requests
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => break line,
                Err(ConnError::Closed) => return Ok(false),
                Err(ConnError::Timeout) if !first => return Ok(false),
                Err(err) => return Err(err),
            }
        };

        // the rest of the request gets the full connection timeout
        stream.set_read_timeout(self.config.get_connection_timeout())?;

        let (method, uri, protocol) = split_request_line(&line)?;
        let (path, query) = match uri.find('?') {
            Some(pos) => (&uri[..pos], Some(&uri[pos + 1..])),
            None => (uri.as_str(), None),
        };

        req.set_request_line(&method, path, query, protocol);
        Ok(true)
    }

    fn parse_headers(&self, stream: &mut Stream, req: &mut Request) -> Result<(), ConnError> {
        if req.protocol() == Protocol::Http09 {
            return Ok(());
        }

        let mut count = 0;
        loop {
            let line = match stream.read_line() {
                Ok(line) => line,
                Err(ConnError::Closed) => {
                    return Err(ConnError::Malformed("connection closed inside headers".to_owned()))
                }
                Err(err) => return Err(err),
            };

            if line.is_empty() {
                break;
            }

            count += 1;
            if count > self.config.get_max_header_lines() {
                return Err(ConnError::Malformed("too many header lines".to_owned()));
            }

            let colon = line
                .find(':')
                .ok_or_else(|| ConnError::Malformed(format!("header line without a colon: {}", line)))?;
            req.add_header(&line[..colon], &line[colon + 1..]);
        }

        let length = match req.header("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ConnError::Malformed(format!("bad content length: {}", raw)))?,
            None => 0,
        };

        if length > self.config.get_max_body_bytes() {
            return Err(ConnError::Malformed(format!("body of {} bytes is too large", length)));
        }

        if length > 0 {
            let body = stream.read_body(length)?;
            req.set_body(body);
        }

        Ok(())
    }

    fn deallocate(&self, req: &mut Request, resp: &mut Response) {
        if !resp.is_closed() {
            if let Err(err) = resp.finish() {
                debug::print(
                    &format!("Unable to finish the response for {}: {}", req.request_uri(), err),
                    InfoLevel::Warning,
                );
            }
        }

        req.finish_sessions();
    }

    fn release_socket(&self, stream: Stream) {
        stream.shutdown();
    }

    fn process_keep_alive(&self, req: &Request, resp: &Response) -> bool {
        req.protocol() != Protocol::Http09 && !resp.close_after()
    }
}

/// Method, path-and-query, protocol. Absolute-form URIs lose their `scheme://host` part.
fn split_request_line(line: &str) -> Result<(String, String, Protocol), ConnError> {
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ConnError::Malformed("empty request line".to_owned()))?;
    let uri = parts
        .next()
        .ok_or_else(|| ConnError::Malformed(format!("request line without a uri: {}", line)))?;
    let protocol = Protocol::parse(parts.next().unwrap_or_default())
        .ok_or_else(|| ConnError::Malformed(format!("unsupported protocol in: {}", line)))?;

    if parts.next().is_some() {
        return Err(ConnError::Malformed(format!("trailing garbage in: {}", line)));
    }

    let uri = match uri.find("://") {
        Some(scheme_end) => {
            let rest = &uri[scheme_end + 3..];
            match rest.find('/') {
                Some(slash) => rest[slash..].to_owned(),
                None => String::from("/"),
            }
        }
        None => uri.to_owned(),
    };

    Ok((method.to_ascii_uppercase(), uri, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines_split_into_parts() {
        let (method, uri, protocol) = split_request_line("get /a/b?x=1 HTTP/1.0").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(uri, "/a/b?x=1");
        assert_eq!(protocol, Protocol::Http10);
    }

    #[test]
    fn missing_protocol_means_http_09() {
        let (_, _, protocol) = split_request_line("GET /index.html").unwrap();
        assert_eq!(protocol, Protocol::Http09);
    }

    #[test]
    fn absolute_uris_lose_scheme_and_host() {
        let (_, uri, _) = split_request_line("GET http://example.com:8080/shop/cart?id=3 HTTP/1.1").unwrap();
        assert_eq!(uri, "/shop/cart?id=3");

        let (_, uri, _) = split_request_line("GET http://example.com HTTP/1.1").unwrap();
        assert_eq!(uri, "/");
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(split_request_line("GET"), Err(ConnError::Malformed(_))));
        assert!(matches!(split_request_line("GET / HTTP/9.9"), Err(ConnError::Malformed(_))));
        assert!(matches!(split_request_line("GET / HTTP/1.1 extra"), Err(ConnError::Malformed(_))));
    }
}
