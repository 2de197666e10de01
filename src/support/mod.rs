pub mod debug;

pub(crate) mod common;
pub(crate) mod scheduler;
