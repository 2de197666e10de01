//! An embeddable HTTP application server.
//!
//! Applications are described by an [`AppDescriptor`](core::descriptor::AppDescriptor): named
//! handlers built from [`Factories`](core::registry::Factories), URL mappings, filter chains,
//! error pages and session settings. An [`HttpServer`](core::server::HttpServer) mounts any number
//! of them under distinct context paths and serves them from a bounded pool of request handler
//! threads, one connection per thread, with HTTP/1.1 keep-alive.

#[macro_use]
extern crate lazy_static;

extern crate chrono;
extern crate crossbeam_channel as channel;
extern crate hashbrown;
extern crate num_cpus;
extern crate parking_lot;
extern crate rand;

pub mod core;
pub mod support;

pub mod prelude {
    pub use crate::core::config::ServerConfig;
    pub use crate::core::context::AppContext;
    pub use crate::core::cookie::{Cookie, SESSION_COOKIE};
    pub use crate::core::descriptor::{
        AppDescriptor, Authenticator, ContextListener, ErrorPageKey, FilterDef, FilterMappingDef,
        FilterTarget, HandlerDef, RequestListener, StaticContent,
    };
    pub use crate::core::dispatch::{DispatchState, DispatchType, RequestDispatcher};
    pub use crate::core::error::{
        ConfigError, Fault, HandlerError, PoolError, ServerError, SessionError,
    };
    pub use crate::core::http::{
        CaptureBuffer, ErrorAttributes, PathAttributes, Protocol, Request, Response,
    };
    pub use crate::core::registry::{
        Factories, Filter, FilterConfig, Handler, HandlerConfig,
    };
    pub use crate::core::server::{HttpServer, ServerHandle};
    pub use crate::core::session::{
        Cluster, JsonCodec, Session, SessionCodec, SessionListener, SessionSnapshot, SessionStore,
    };
    pub use crate::core::states::{AsyncController, ControlMessage};
}
