//! HTTP server for the Vitrine image platform.
//!
//! `main.rs` owns process concerns (CLI, config file, exit codes); this
//! library owns the wiring and the router so integration tests can drive
//! the same surface over in-memory repositories.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod startup;
pub mod state;

pub use config::Config;
pub use routes::build_router;
pub use startup::build_state;
pub use state::AppState;
