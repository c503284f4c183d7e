use bytes::BytesMut;
use shared::error::Result;
use std::time::Instant;

/// SCTP association carried over DTLS application data.
///
/// Data channel framing lives in the implementation; the transport only
/// moves bytes between it and the DTLS engine and tells it when the
/// underlying connection is usable.
pub trait SctpAssociation {
    /// The DTLS connection is established.
    fn run(&mut self, now: Instant);

    /// DTLS application data received from the peer.
    fn handle_read(&mut self, now: Instant, data: BytesMut) -> Result<()>;

    /// Next SCTP packet to send as DTLS application data.
    fn poll_write(&mut self) -> Option<BytesMut>;

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    /// May queue a final packet (ABORT or SHUTDOWN) to be flushed by the
    /// transport before DTLS closes.
    fn close(&mut self) -> Result<()>;
}
