//! Abstract byte transport with per-direction timeouts.
//!
//! Mirrors `network::Transport` of the original library: concrete
//! transports only implement `write_some`/`read_some`/`shutdown`, and this
//! module supplies the timeout wrapping and the "keep calling `send_some`
//! until all of `data` is consumed" looping on top, so every transport
//! gets the same timeout and close-on-error behavior for free.

use crate::error::{YogiError, YogiResult};
use async_trait::async_trait;
use std::time::Duration;

/// A single logical connection to a peer, abstracting over the concrete
/// socket type underneath (TCP today; nothing else is wired up, but the
/// seam exists the way it does in the original so a test transport can be
/// dropped in without touching callers).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable description of the peer, used in log messages only.
    fn peer_description(&self) -> &str;

    /// The peer's IP address, when the concrete transport has one (TCP
    /// does; a loopback/test transport may not). `BranchConnection` needs
    /// this to pair with the port advertised in an info message, since the
    /// info message itself never carries the sender's address.
    fn peer_ip(&self) -> Option<std::net::IpAddr> {
        None
    }

    /// Performs a single, possibly partial, write. Returns the number of
    /// bytes actually written.
    async fn write_some(&self, data: &[u8]) -> YogiResult<usize>;

    /// Performs a single, possibly partial, read. Returns the number of
    /// bytes actually read; `0` means the peer closed the connection.
    async fn read_some(&self, buf: &mut [u8]) -> YogiResult<usize>;

    /// Tears down the underlying socket. Idempotent.
    async fn shutdown(&self);

    /// The per-operation timeout applied by `send_some`/`receive_some`.
    fn timeout(&self) -> Duration;

    /// Writes at least one byte of `data`, subject to the transport's
    /// timeout. Closes the transport on timeout or I/O error.
    async fn send_some(&self, data: &[u8]) -> YogiResult<usize> {
        debug_assert!(!data.is_empty());
        match tokio::time::timeout(self.timeout(), self.write_some(data)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                self.shutdown().await;
                Err(e)
            }
            Err(_) => {
                self.shutdown().await;
                Err(YogiError::Timeout)
            }
        }
    }

    /// Writes all of `data`, looping over `send_some` until it is fully
    /// consumed or an error occurs.
    async fn send_all(&self, mut data: &[u8]) -> YogiResult<()> {
        while !data.is_empty() {
            let n = self.send_some(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Reads at least one byte into `buf`, subject to the transport's
    /// timeout. Closes the transport on timeout or I/O error.
    async fn receive_some(&self, buf: &mut [u8]) -> YogiResult<usize> {
        debug_assert!(!buf.is_empty());
        match tokio::time::timeout(self.timeout(), self.read_some(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                self.shutdown().await;
                Err(e)
            }
            Err(_) => {
                self.shutdown().await;
                Err(YogiError::Timeout)
            }
        }
    }

    /// Fills `buf` completely, looping over `receive_some` until it is
    /// full or an error occurs. An early EOF surfaces as `RwSocketFailed`.
    async fn receive_all(&self, buf: &mut [u8]) -> YogiResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.receive_some(&mut buf[filled..]).await?;
            if n == 0 {
                self.shutdown().await;
                return Err(YogiError::RwSocketFailed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Closes the transport. Safe to call more than once.
    async fn close(&self) {
        self.shutdown().await;
    }
}
