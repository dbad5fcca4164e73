pub mod auth;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod jobs;
pub mod provider;
pub mod refresh;
pub mod render;
pub mod session;
pub mod storage;
pub mod telemetry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod websocket;

pub use handlers::{build_router, AppState};
