pub mod config;
pub mod context;
pub mod cookie;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod states;

pub(crate) mod conn;
pub(crate) mod listener;
pub(crate) mod stream;
pub(crate) mod syncpool;
