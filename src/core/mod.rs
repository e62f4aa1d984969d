//! Core types and constants for service discovery
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

use std::time::Duration;

pub use self::error::{Error, ErrorCode, Result};
pub use self::types::{Config, Protocol, ServiceConfig};

/// Port announcements are sent to and the registry listens on
pub const REGISTRATION_PORT: u16 = 30001;

/// Port the registry rebroadcasts known services on
pub const ANNOUNCE_PORT: u16 = 30002;

/// Default bind address for receive roles
pub const DEFAULT_BIND_ADDRESS: &str = "0::0";

/// Default multicast group
pub const DEFAULT_MULTICAST_ADDRESS: &str = "ff31::8000:1234";

/// Default re-announcement interval
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Default and minimum receive buffer length in bytes
pub const DEFAULT_BUFFER_LEN: usize = 1024;
