//! Serving-edge services bound into the pingora server.

pub mod http;
pub mod proxy;
