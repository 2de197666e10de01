//! Shared helpers for the integration tests: a small blocking HTTP client over loopback and
//! ready-made handlers.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use rusty_appserver::prelude::*;

/// A config for tests: ephemeral port, few workers, short timeouts.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::new();
    config.set_http_port(0);
    config.set_max_workers(8);
    config.set_startup_workers(2);
    config.set_worker_retry(Duration::from_millis(100));
    config.set_keep_alive_timeout(Duration::from_millis(500));
    config.set_connection_timeout(Duration::from_secs(5));
    config
}

pub fn start(config: ServerConfig, factories: Factories, apps: Vec<AppDescriptor>) -> ServerHandle {
    let mut server = HttpServer::new(config, factories);
    for app in apps {
        server = server.mount(app).unwrap();
    }

    server.start().unwrap()
}

#[derive(Debug)]
pub struct Reply {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Reply {
    pub fn status(&self) -> u16 {
        self.status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The `name=value` part of the first `Set-Cookie` for `name`.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, value)| value.split(';').next())
            .find(|pair| pair.starts_with(&format!("{}=", name)))
            .map(str::to_owned)
    }
}

/// One client connection, kept open across requests.
pub struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Client {
            reader: BufReader::new(stream),
        }
    }

    pub fn send(&mut self, raw: &str) {
        self.reader.get_mut().write_all(raw.as_bytes()).unwrap();
    }

    /// Read one response. Without `Content-Length` the body runs to end of stream.
    pub fn read_reply(&mut self) -> Reply {
        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }

            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_owned(), value.trim().to_owned()));
            }
        }

        let length = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok());

        let body = match length {
            Some(length) => {
                let mut body = vec![0u8; length];
                self.reader.read_exact(&mut body).unwrap();
                body
            }
            None => {
                let mut body = Vec::new();
                let _ = self.reader.read_to_end(&mut body);
                body
            }
        };

        Reply {
            status_line: status_line.trim_end().to_owned(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        }
    }

    pub fn request(&mut self, raw: &str) -> Reply {
        self.send(raw);
        self.read_reply()
    }

    /// Whether the server has closed its side.
    pub fn is_closed(&mut self) -> bool {
        let mut rest = Vec::new();
        match self.reader.read_to_end(&mut rest) {
            Ok(_) => rest.is_empty(),
            Err(_) => true,
        }
    }

    /// Everything the server sends until it closes. Errors such as a reset read as nothing.
    pub fn read_all(&mut self) -> String {
        let mut raw = Vec::new();
        let _ = self.reader.read_to_end(&mut raw);
        String::from_utf8_lossy(&raw).into_owned()
    }
}

pub fn get(path: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path)
}

pub fn get_closing(path: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path)
}

pub fn get_with_cookie(path: &str, cookie: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: localhost\r\nCookie: {}\r\n\r\n", path, cookie)
}

/// Writes a fixed body.
pub struct Text(pub &'static str);

impl Handler for Text {
    fn service(&self, _: &AppContext, _: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        resp.set_content_type("text/plain");
        resp.write_all(self.0.as_bytes())?;
        Ok(())
    }
}

pub fn text(body: &'static str) -> impl Fn() -> Result<Arc<dyn Handler>, HandlerError> + Send + Sync + 'static {
    move || Ok(Arc::new(Text(body)) as Arc<dyn Handler>)
}
