//! Client side of the agent activity monitor: a reconnecting socket
//! connection with a bounded event log, and the tracker that folds what it
//! delivers into an activity store.

pub mod config;
pub mod error;
pub mod machine;
pub mod manager;
pub mod socket;
pub mod tracker;

pub use config::{ClientConfig, MockConfig};
pub use error::ConnectionError;
pub use machine::{ConnectionMachine, ConnectionState, ConnectionStatus, OutboundMessage};
pub use manager::ConnectionManager;
pub use tracker::{ActivitySnapshot, ActivityTracker};
