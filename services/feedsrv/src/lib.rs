//! Feeder Service (`feedsrv`)
//!
//! Drives pet-feeder hardware over raw TCP. Feeders dial in, identify
//! themselves and then receive commands (feed now, default quantity, meal
//! plan) that they acknowledge on the same socket.
//!
//! - [`protocol`]: validated values, frame codec and stream reassembly
//! - [`session`] / [`registry`]: per-feeder connection state and
//!   command/acknowledgement correlation
//! - [`engine`]: TCP listener, frame dispatch and the operations used by the
//!   external API layer
//! - [`database`]: persistence collaborator contract

pub mod bootstrap;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;

pub use config::FeedSrvConfig;
pub use database::{FeederDatabase, InMemoryFeederDatabase};
pub use engine::{BoundEngine, EngineConfig, ProtocolEngine};
pub use error::{FeedSrvError, Result};
pub use registry::ConnectionRegistry;
pub use session::FeederStatus;
