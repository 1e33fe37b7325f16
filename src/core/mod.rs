//! Core data model shared by every subsystem: the error taxonomy, the
//! request/response types, and per-request classification state.

pub mod context;
pub mod error;
pub mod http;

pub use context::{Classification, Timing, Vars};
pub use error::{ErrorContext, XyPrissError, XyResult};
pub use http::{Body, CookieRecord, Request, Response};
