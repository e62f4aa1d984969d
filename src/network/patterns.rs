//! Listener and broadcaster capabilities over the multicast channel roles.
//!
//! Request/reply and survey flows are built on these: a listener answers each
//! datagram unicast to its source, and a broadcaster hands those answers to its
//! response callback.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::core::{Error, ErrorCode, Result};
use super::receiver::{Datagram, MulticastReceiver};
use super::sender::MulticastSender;

/// Produces the reply for one received payload; an empty reply sends nothing
pub type ListenFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Produces the payload for one broadcast; an empty payload skips the tick
pub type BroadcastFn = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Receives one answer to a broadcast
pub type ResponseFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Lifecycle shared by every messaging pattern
#[async_trait]
pub trait Pattern: Send + Sync {
    /// Checks the underlying channel is usable
    async fn standup(&self) -> Result<()>;

    /// Stops any background task and waits for it
    async fn shutdown(&self);
}

#[async_trait]
pub trait Listener: Pattern {
    /// Handles exactly one datagram
    async fn listen(&self, handler: ListenFn) -> Result<()>;

    /// Handles datagrams on a background task until shutdown
    fn spawn_listen(&self, handler: ListenFn) -> Result<()>;
}

#[async_trait]
pub trait Broadcaster: Pattern {
    fn set_response_callback(&self, callback: ResponseFn);

    /// Transmits exactly once; returns the bytes sent
    async fn broadcast(&self, source: BroadcastFn) -> Result<usize>;

    /// Transmits every interval on a background task until shutdown
    fn spawn_broadcast(&self, source: BroadcastFn) -> Result<()>;
}

fn channel_ready(valid: bool, error: ErrorCode) -> Result<()> {
    if valid {
        Ok(())
    } else {
        Err(Error::Channel(error))
    }
}

/// Wraps a [`ListenFn`] so its replies go back through `receiver`'s socket
fn answering(
    receiver: &MulticastReceiver,
    handler: ListenFn,
) -> impl Fn(Datagram) -> BoxFuture<'static, ()> + Send + Sync + 'static {
    let inner = receiver.shared();
    move |datagram: Datagram| -> BoxFuture<'static, ()> {
        let inner = Arc::clone(&inner);
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let reply = handler(&datagram.payload);
            if reply.is_empty() {
                return;
            }
            if let Err(e) = inner.reply_to(datagram.source, &reply).await {
                debug!("reply to {} failed: {}", datagram.source, e);
            }
        })
    }
}

#[async_trait]
impl Pattern for MulticastReceiver {
    async fn standup(&self) -> Result<()> {
        channel_ready(self.is_valid(), self.error())
    }

    async fn shutdown(&self) {
        self.stop();
        self.join().await;
    }
}

#[async_trait]
impl Listener for MulticastReceiver {
    async fn listen(&self, handler: ListenFn) -> Result<()> {
        self.receive(&answering(self, handler)).await
    }

    fn spawn_listen(&self, handler: ListenFn) -> Result<()> {
        self.spawn_receive(answering(self, handler))
    }
}

#[async_trait]
impl Pattern for MulticastSender {
    async fn standup(&self) -> Result<()> {
        channel_ready(self.is_valid(), self.error())
    }

    async fn shutdown(&self) {
        self.stop();
        self.join().await;
    }
}

#[async_trait]
impl Broadcaster for MulticastSender {
    fn set_response_callback(&self, callback: ResponseFn) {
        self.set_response_handler(move |datagram: Datagram| {
            let callback = Arc::clone(&callback);
            async move { callback(&datagram.payload) }
        });
    }

    async fn broadcast(&self, source: BroadcastFn) -> Result<usize> {
        self.send(|dst| {
            dst.extend_from_slice(&source());
            Ok(())
        })
        .await
    }

    fn spawn_broadcast(&self, source: BroadcastFn) -> Result<()> {
        self.spawn_send(move |dst| {
            dst.extend_from_slice(&source());
            Ok(())
        })
    }
}
