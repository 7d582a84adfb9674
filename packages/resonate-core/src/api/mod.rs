//! HTTP surface: the WebSocket upgrade route.

mod ws;

pub use ws::{router, serve, ServeError};
