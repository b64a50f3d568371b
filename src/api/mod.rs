//! HTTP API
//!
//! REST surface for inserts, status queries and maintenance operations.

mod http;

pub use http::ApiServer;
