pub mod config;
pub mod file_logging;
pub mod routes;
pub mod state;

pub use state::AppState;
