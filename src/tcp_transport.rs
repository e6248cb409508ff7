//! TCP implementation of `Transport`: the concrete binding for both the
//! TCP server and client side, grounded in
//! `ipc::tcp_socket::TcpSocketTransport`'s low-latency socket setup and
//! split read/write halves, generalized from a request/response
//! transport to the plain duplex byte stream `MessageTransport` needs.

use crate::error::{YogiError, YogiResult};
use crate::transport::Transport;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

pub struct TcpTransport {
    read_half: Mutex<OwnedReadHalf>,
    write_half: Mutex<OwnedWriteHalf>,
    peer_description: String,
    peer_addr: Option<SocketAddr>,
    timeout: Duration,
}

impl TcpTransport {
    fn from_stream(stream: TcpStream, timeout: Duration) -> YogiResult<Self> {
        configure_socket(&stream)?;
        let peer_addr = stream.peer_addr().ok();
        let peer_description = peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "<unknown peer>".to_string());
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            peer_description,
            peer_addr,
            timeout,
        })
    }

    /// Connects to `addr`, completing the client half of TCP
    /// connection establishment. Loopback connections to the local
    /// advertised port are rejected one layer up, by the connection
    /// manager, since only it knows the local uuid to compare against.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> YogiResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| YogiError::ConnectSocketFailed)?;
        Self::from_stream(stream, timeout)
    }

    /// Binds a listener on `addr` for the server half. Returns the
    /// bound listener so the caller can drive its own accept loop and
    /// construct a `TcpTransport` per accepted connection.
    pub async fn bind(addr: SocketAddr) -> YogiResult<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|_| YogiError::BindSocketFailed)
    }

    /// Wraps a freshly accepted stream from a listener created by `bind`.
    pub fn from_accepted(stream: TcpStream, timeout: Duration) -> YogiResult<Self> {
        Self::from_stream(stream, timeout)
    }
}

fn configure_socket(stream: &TcpStream) -> YogiResult<()> {
    stream
        .set_nodelay(true)
        .map_err(|_| YogiError::SetSocketOptionFailed)
}

#[async_trait]
impl Transport for TcpTransport {
    fn peer_description(&self) -> &str {
        &self.peer_description
    }

    fn peer_ip(&self) -> Option<std::net::IpAddr> {
        self.peer_addr.map(|a| a.ip())
    }

    async fn write_some(&self, data: &[u8]) -> YogiResult<usize> {
        let mut half = self.write_half.lock().await;
        half.write(data).await.map_err(|e| YogiError::from_io(&e))
    }

    async fn read_some(&self, buf: &mut [u8]) -> YogiResult<usize> {
        let mut half = self.read_half.lock().await;
        half.read(buf).await.map_err(|e| YogiError::from_io(&e))
    }

    async fn shutdown(&self) {
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_and_accept_exchange_bytes_both_ways() {
        let listener = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransport::from_accepted(stream, Duration::from_secs(1)).unwrap()
        });

        let client = TcpTransport::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        let server = accept_task.await.unwrap();

        client.send_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.receive_all(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.send_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.receive_all(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn receive_all_fails_with_rw_error_on_peer_close() {
        let listener = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = TcpTransport::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        accept_task.await.unwrap();

        let mut buf = [0u8; 4];
        let err = client.receive_all(&mut buf).await.unwrap_err();
        assert_eq!(err, YogiError::RwSocketFailed);
    }
}
