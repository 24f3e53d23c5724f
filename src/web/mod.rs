//! The HTTP surface of the plotter host.

pub mod api;
pub mod middleware;
pub mod rate_limiter;

pub use api::{create_router, AppState, AppStateInner};
