//! Relay between browser clients and the agent gateway, with a small HTTP
//! surface for health, stats and event injection.

pub mod config;
pub mod error;
pub mod logging;
pub mod routes;
pub mod server;
pub mod session;

pub use config::RelayConfig;
pub use routes::router;
pub use server::serve;
pub use session::RelaySession;
