use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

/// Messaging style offered by an announced service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Publish / subscribe
    #[default]
    PubSub,
    /// Request / reply
    ReqRep,
}

impl Protocol {
    /// Wire representation
    pub fn as_byte(self) -> u8 {
        match self {
            Protocol::PubSub => 0,
            Protocol::ReqRep => 1,
        }
    }

    /// Parses the wire representation
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Protocol::PubSub),
            1 => Some(Protocol::ReqRep),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::PubSub => f.write_str("pub_sub"),
            Protocol::ReqRep => f.write_str("req_rep"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pub_sub" | "pubsub" => Ok(Protocol::PubSub),
            "req_rep" | "reqrep" => Ok(Protocol::ReqRep),
            other => Err(Error::config(format!("unknown protocol style '{}'", other))),
        }
    }
}

/// Identity of one announced service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Human readable identifier
    pub name: String,
    /// Connectable host or URI
    pub address: String,
    /// Listening port of the service
    pub port: u16,
    /// Free text description
    #[serde(default)]
    pub brief: String,
    /// Messaging style
    #[serde(default)]
    pub protocol: Protocol,
}

/// Channel configuration shared by registries and announcers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local address the receive roles bind to and join the group on
    pub bind_address: String,
    /// Multicast group (a unicast address is used as a plain endpoint)
    pub multicast_address: String,
    /// Port announcements are sent to and the registry listens on
    pub registration_port: u16,
    /// Port the registry rebroadcasts on and announcers listen on
    pub announce_port: u16,
    /// Fixed re-announcement interval
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub announce_interval: Duration,
    /// Receive buffer length in bytes
    pub buffer_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_address: super::DEFAULT_BIND_ADDRESS.to_string(),
            multicast_address: super::DEFAULT_MULTICAST_ADDRESS.to_string(),
            registration_port: super::REGISTRATION_PORT,
            announce_port: super::ANNOUNCE_PORT,
            announce_interval: super::DEFAULT_ANNOUNCE_INTERVAL,
            buffer_len: super::DEFAULT_BUFFER_LEN,
        }
    }
}

impl Config {
    /// Loads a configuration from a JSON file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }
}
