//! Multicast channel roles and the discovery participants built on them
//!
//! A [`MulticastSender`] transmits on a fixed interval and a [`MulticastReceiver`]
//! runs a receive loop; each owns at most one background task. The [`Registry`]
//! and [`Announcer`] combine one of each with the discovery protocol.

mod patterns;
mod receiver;
mod registry;
mod sender;
mod service;
pub mod socket;
mod worker;

pub use self::patterns::{BroadcastFn, Broadcaster, ListenFn, Listener, Pattern, ResponseFn};
pub use self::receiver::{Datagram, DatagramHandler, MulticastReceiver};
pub use self::registry::{Directory, Registry};
pub use self::sender::MulticastSender;
pub use self::service::{AnnouncementCallback, Announcer, AnnouncerState};
