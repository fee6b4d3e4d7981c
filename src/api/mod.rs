//! HTTP surface: submission, status, cancellation, and review decisions.

mod routes;
mod server;

pub use routes::{ApiError, AppState, build_router};
pub use server::run_server;
