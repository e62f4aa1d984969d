//! Multicast service discovery
//!
//! Services announce themselves (name, address, port, messaging style, brief)
//! on a UDP multicast group. A [`Registry`] keeps the directory of announced
//! services keyed by endpoint and rebroadcasts every new entry so that all
//! [`Announcer`]s converge on the same view of who is reachable.
pub mod core;
pub mod network;
pub mod protocol;

// Re-export commonly used items
pub use crate::core::{Config, Error, ErrorCode, Protocol, Result, ServiceConfig};
pub use crate::network::{Announcer, AnnouncerState, Registry};
pub use crate::protocol::{Message, ServiceAnnouncement, ServiceSignoff};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
