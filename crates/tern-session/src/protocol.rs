// The contract the session runtime requires from the transport layer.
use async_trait::async_trait;
use std::time::Duration;
use tern_wire::{ChannelId, Frame, Method, MethodKind};

use crate::error::Result;

/// Downward interface onto the wire: the transport owns the socket, the
/// codec, and the reply latches; the session only speaks through this trait.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Enqueue a frame for writing. Fire-and-forget; must not block the
    /// caller, which may be the network task itself.
    fn write_frame(&self, frame: Frame) -> Result<()>;

    /// Wait until every previously enqueued frame has reached the transport.
    async fn flush(&self) -> Result<()>;

    /// Write a frame and await the next method of the expected class on the
    /// same channel. Fails with `Timeout` past the deadline and with
    /// `FailoverInterrupted` when the connection is lost mid round-trip.
    async fn sync_write(
        &self,
        frame: Frame,
        expected: MethodKind,
        timeout: Option<Duration>,
    ) -> Result<Method>;

    /// Transport-side bookkeeping issued before a channel close round-trip.
    fn close_session(&self, channel: ChannelId);

    /// Deterministic unique name for client-named queues, stable enough to
    /// reuse across fail-over within one connection epoch.
    fn generate_queue_name(&self) -> String;

    fn protocol_version(&self) -> (u8, u8);
}
