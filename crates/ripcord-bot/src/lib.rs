//! Service binary: configuration, wiring and lifecycle for the exit
//! execution stack.

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
