//! Programmatic description of one web application: what a descriptor loader would produce.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::context::AppContext;
use crate::core::dispatch::DispatchType;
use crate::core::error::HandlerError;
use crate::core::http::{Request, Response};
use crate::core::session::{Cluster, SessionCodec, SessionListener};

const DEFAULT_SESSION_TIMEOUT_MINUTES: i64 = 60;

/// Consulted once per initial request, before the request filters run. Returning `false` means
/// the authenticator already wrote the response, e.g. a challenge.
pub trait Authenticator: Send + Sync {
    fn check_access(
        &self,
        req: &mut Request,
        resp: &mut Response,
        path: &str,
    ) -> Result<bool, HandlerError>;
}

/// Answers directory and existence questions for welcome-file handling.
pub trait StaticContent: Send + Sync {
    fn is_directory(&self, path: &str) -> bool;
    fn exists(&self, path: &str) -> bool;
}

pub trait ContextListener: Send + Sync {
    fn context_initialized(&self, _ctx: &AppContext) -> Result<(), HandlerError> {
        Ok(())
    }

    fn context_destroyed(&self, _ctx: &AppContext) {}
}

pub trait RequestListener: Send + Sync {
    fn request_initialized(&self, _ctx: &AppContext, _req: &Request) {}
    fn request_destroyed(&self, _ctx: &AppContext, _req: &Request) {}
}

#[derive(Debug, Clone)]
pub struct HandlerDef {
    pub name: String,
    pub target: String,
    pub init_params: Vec<(String, String)>,
    pub load_on_startup: Option<i32>,
    pub single_threaded: bool,
}

impl HandlerDef {
    pub fn new(name: &str, target: &str) -> Self {
        HandlerDef {
            name: name.to_owned(),
            target: target.to_owned(),
            init_params: Vec::new(),
            load_on_startup: None,
            single_threaded: false,
        }
    }

    pub fn init_param(mut self, key: &str, value: &str) -> Self {
        self.init_params.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn load_on_startup(mut self, priority: i32) -> Self {
        self.load_on_startup = Some(priority);
        self
    }

    pub fn single_threaded(mut self) -> Self {
        self.single_threaded = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FilterDef {
    pub name: String,
    pub target: String,
    pub init_params: Vec<(String, String)>,
}

impl FilterDef {
    pub fn new(name: &str, target: &str) -> Self {
        FilterDef {
            name: name.to_owned(),
            target: target.to_owned(),
            init_params: Vec::new(),
        }
    }

    pub fn init_param(mut self, key: &str, value: &str) -> Self {
        self.init_params.push((key.to_owned(), value.to_owned()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterTarget {
    Url(String),
    Handler(String),
}

#[derive(Debug, Clone)]
pub struct FilterMappingDef {
    pub filter: String,
    pub target: FilterTarget,
    pub dispatches: Vec<DispatchType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPageKey {
    Status(u16),
    Class(String),
}

#[derive(Clone)]
pub struct AppDescriptor {
    pub name: String,
    pub context_path: String,
    pub init_params: Vec<(String, String)>,
    pub handlers: Vec<HandlerDef>,
    pub mappings: Vec<(String, String)>,
    pub filters: Vec<FilterDef>,
    pub filter_mappings: Vec<FilterMappingDef>,
    pub error_pages: Vec<(ErrorPageKey, String)>,
    pub welcome_files: Vec<String>,
    pub session_timeout_minutes: Option<i64>,
    pub distributable: bool,
    pub session_dir: Option<PathBuf>,

    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub cluster: Option<Arc<dyn Cluster>>,
    pub static_content: Option<Arc<dyn StaticContent>>,
    pub session_codec: Option<Arc<dyn SessionCodec>>,
    pub session_listeners: Vec<Arc<dyn SessionListener>>,
    pub context_listeners: Vec<Arc<dyn ContextListener>>,
    pub request_listeners: Vec<Arc<dyn RequestListener>>,
}

impl AppDescriptor {
    pub fn new(name: &str, context_path: &str) -> Self {
        AppDescriptor {
            name: name.to_owned(),
            context_path: context_path.to_owned(),
            init_params: Vec::new(),
            handlers: Vec::new(),
            mappings: Vec::new(),
            filters: Vec::new(),
            filter_mappings: Vec::new(),
            error_pages: Vec::new(),
            welcome_files: Vec::new(),
            session_timeout_minutes: Some(DEFAULT_SESSION_TIMEOUT_MINUTES),
            distributable: false,
            session_dir: None,
            authenticator: None,
            cluster: None,
            static_content: None,
            session_codec: None,
            session_listeners: Vec::new(),
            context_listeners: Vec::new(),
            request_listeners: Vec::new(),
        }
    }

    pub fn init_param(mut self, key: &str, value: &str) -> Self {
        self.init_params.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn handler(mut self, def: HandlerDef) -> Self {
        self.handlers.push(def);
        self
    }

    /// Map a URL pattern to a handler name.
    pub fn map(mut self, pattern: &str, handler: &str) -> Self {
        self.mappings.push((pattern.to_owned(), handler.to_owned()));
        self
    }

    pub fn filter(mut self, def: FilterDef) -> Self {
        self.filters.push(def);
        self
    }

    /// An empty `dispatches` list means request dispatches only.
    pub fn filter_url(mut self, filter: &str, pattern: &str, dispatches: &[DispatchType]) -> Self {
        self.filter_mappings.push(FilterMappingDef {
            filter: filter.to_owned(),
            target: FilterTarget::Url(pattern.to_owned()),
            dispatches: dispatches.to_vec(),
        });
        self
    }

    pub fn filter_handler(mut self, filter: &str, handler: &str, dispatches: &[DispatchType]) -> Self {
        self.filter_mappings.push(FilterMappingDef {
            filter: filter.to_owned(),
            target: FilterTarget::Handler(handler.to_owned()),
            dispatches: dispatches.to_vec(),
        });
        self
    }

    pub fn error_page(mut self, key: ErrorPageKey, location: &str) -> Self {
        self.error_pages.push((key, location.to_owned()));
        self
    }

    pub fn welcome_file(mut self, file: &str) -> Self {
        self.welcome_files.push(file.to_owned());
        self
    }

    /// `None` or a non-positive value keeps sessions forever.
    pub fn session_timeout(mut self, minutes: Option<i64>) -> Self {
        self.session_timeout_minutes = minutes.filter(|m| *m > 0);
        self
    }

    pub fn distributable(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.distributable = true;
        self.cluster = Some(cluster);
        self
    }

    pub fn session_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.session_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(auth);
        self
    }

    pub fn static_content(mut self, content: Arc<dyn StaticContent>) -> Self {
        self.static_content = Some(content);
        self
    }

    pub fn session_codec(mut self, codec: Arc<dyn SessionCodec>) -> Self {
        self.session_codec = Some(codec);
        self
    }

    pub fn session_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.session_listeners.push(listener);
        self
    }

    pub fn context_listener(mut self, listener: Arc<dyn ContextListener>) -> Self {
        self.context_listeners.push(listener);
        self
    }

    pub fn request_listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
        self.request_listeners.push(listener);
        self
    }

    /// `""` for the root application, otherwise `/name` without a trailing slash.
    pub fn normalized_context_path(&self) -> String {
        let trimmed = self.context_path.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else if trimmed.starts_with('/') {
            trimmed.to_owned()
        } else {
            format!("/{}", trimmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_paths_normalize() {
        assert_eq!(AppDescriptor::new("a", "/").normalized_context_path(), "");
        assert_eq!(AppDescriptor::new("a", "").normalized_context_path(), "");
        assert_eq!(AppDescriptor::new("a", "shop/").normalized_context_path(), "/shop");
        assert_eq!(AppDescriptor::new("a", "/shop").normalized_context_path(), "/shop");
    }

    #[test]
    fn non_positive_timeouts_disable_expiry() {
        assert_eq!(AppDescriptor::new("a", "").session_timeout(Some(0)).session_timeout_minutes, None);
        assert_eq!(AppDescriptor::new("a", "").session_timeout(Some(5)).session_timeout_minutes, Some(5));
    }
}
