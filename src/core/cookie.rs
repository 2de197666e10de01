use std::time::{SystemTime, UNIX_EPOCH};

use crate::chrono::prelude::*;
use crate::hashbrown::HashMap;

/// Name of the cookie that carries the session id.
pub const SESSION_COOKIE: &str = "SESSIONID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    key: String,
    value: String,
    expires: Option<SystemTime>,
    max_age: Option<i64>,
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
}

impl Cookie {
    pub fn new(key: &str, value: &str) -> Self {
        Cookie {
            key: key.to_owned(),
            value: value.to_owned(),
            expires: None,
            max_age: None,
            domain: String::new(),
            path: String::new(),
            secure: false,
            http_only: false,
        }
    }

    /// A cookie telling the client to drop `key` right away.
    pub fn expired(key: &str, path: &str) -> Self {
        let mut cookie = Cookie::new(key, "expired");
        cookie.set_max_age(Some(0));
        cookie.set_expires(Some(UNIX_EPOCH));
        cookie.set_path(path);
        cookie
    }

    #[inline]
    pub fn set_expires(&mut self, expires_at: Option<SystemTime>) {
        self.expires = expires_at;
    }

    #[inline]
    pub fn set_max_age(&mut self, max_age: Option<i64>) {
        self.max_age = max_age;
    }

    /// Paths must be absolute; anything else leaves the path unset.
    pub fn set_path(&mut self, path: &str) -> bool {
        if path.is_empty() || !path.starts_with('/') {
            self.path.clear();
            return false;
        }

        self.path = path.to_owned();
        true
    }

    #[inline]
    pub fn set_domain(&mut self, domain: &str) {
        self.domain = domain.to_owned();
    }

    #[inline]
    pub fn set_secure_attr(&mut self, is_secure: bool) {
        self.secure = is_secure;
    }

    #[inline]
    pub fn set_http_only_attr(&mut self, http_only: bool) {
        self.http_only = http_only;
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
    }

    #[inline]
    pub fn get_cookie_key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn get_cookie_value(&self) -> &str {
        &self.value
    }

    #[inline]
    pub fn get_max_age(&self) -> Option<i64> {
        self.max_age
    }

    /// Render the value of a `Set-Cookie` header.
    pub fn to_header_value(&self) -> String {
        if self.key.is_empty() {
            return String::new();
        }

        let mut cookie = [&self.key[..], "=", &self.value[..]].join("");

        if let Some(time) = self.expires {
            let dt = system_to_utc(time)
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string();

            cookie.push_str("; Expires=");
            cookie.push_str(&dt);
        }

        if let Some(age) = self.max_age {
            cookie.push_str("; Max-Age=");
            cookie.push_str(&age.max(0).to_string());
        }

        if !self.domain.is_empty() {
            cookie.push_str("; Domain=");
            cookie.push_str(&self.domain);
        }

        if !self.path.is_empty() {
            cookie.push_str("; Path=");
            cookie.push_str(&self.path);
        }

        if self.secure {
            cookie.push_str("; Secure");
        }

        if self.http_only {
            cookie.push_str("; HttpOnly");
        }

        cookie
    }
}

/// Split a request `Cookie` header into name/value pairs. Later duplicates do not override
/// earlier ones.
pub fn parse_cookie_header(raw: &str, cookies: &mut HashMap<String, String>) {
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let (key, value) = match pair.find('=') {
            Some(pos) => (pair[..pos].trim(), pair[pos + 1..].trim()),
            None => continue,
        };

        if key.is_empty() {
            continue;
        }

        cookies
            .entry(key.to_owned())
            .or_insert_with(|| value.trim_matches('"').to_owned());
    }
}

fn system_to_utc(t: SystemTime) -> DateTime<Utc> {
    let secs = match t.duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };

    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
