//! The Control API process: resolves config, connects to Postgres, and
//! serves the HTTP surface worker agents and the merge/deploy gate drive
//! the control plane through.

pub mod api_types;
pub mod routes;
pub mod state;

pub use state::AppState;
