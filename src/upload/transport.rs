//! Streaming RPC client abstraction
//!
//! Follows the trait-object style of the object store layer: the pipeline
//! only sees `StreamClient`/`StreamHandle`, production code plugs in a real
//! RPC client and tests plug in `SimulatedStreamClient`.
//!
//! Contract:
//! - `open_stream` never blocks on the network; failures surface through the
//!   returned status future.
//! - `on_ack` may be called from any thread, once per acknowledgement, in the
//!   order the server sent them.
//! - The status future resolves exactly once, after the last `on_ack` call for
//!   that stream instance.

use crate::upload::event::{PublishAck, PublishRequest};
use crate::upload::status::StreamStatus;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Invoked by the transport for every acknowledgement received
pub type AckCallback = Arc<dyn Fn(PublishAck) + Send + Sync>;

/// Resolves to the terminal status of one stream instance
pub type StatusFuture = BoxFuture<'static, StreamStatus>;

/// Opens bidirectional build event streams
pub trait StreamClient: Send + Sync + 'static {
    fn open_stream(&self, on_ack: AckCallback) -> (Box<dyn StreamHandle>, StatusFuture);
}

/// Client side of one open stream instance
pub trait StreamHandle: Send {
    /// Transmit one request. An error means the stream is already broken;
    /// the status future reports why.
    fn send(&mut self, request: PublishRequest) -> Result<(), StreamStatus>;

    /// No more requests on this instance
    fn half_close(&mut self);

    /// Tear the instance down; the status future resolves soon after
    fn abort(&mut self, status: StreamStatus);
}
