//! Listens for peer advertising messages on the multicast group and
//! reports newly discovered branches. Grounded in
//! `objects::detail::AdvertisingReceiver`.

use crate::branch_info::{RemoteBranchInfo, ADVERTISING_MESSAGE_SIZE};
use crate::error::YogiError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, warn};
use uuid::Uuid;

/// A peer discovered through an advertising message: its uuid and the TCP
/// endpoint to connect to.
pub struct Discovery {
    pub uuid: Uuid,
    pub tcp_endpoint: SocketAddr,
}

pub struct AdvertisingReceiver {
    socket: UdpSocket,
    local_uuid: Uuid,
}

impl AdvertisingReceiver {
    /// Binds, enables address reuse, and joins the advertising multicast
    /// group. `local_uuid` is used to silently drop the branch's own
    /// advertisements instead of reporting a discovery of itself.
    pub async fn bind(adv_ep: SocketAddr, local_uuid: Uuid) -> Result<Self, YogiError> {
        let domain = if adv_ep.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|_| YogiError::OpenSocketFailed)?;
        socket
            .set_reuse_address(true)
            .map_err(|_| YogiError::SetSocketOptionFailed)?;

        let bind_addr: SocketAddr = if adv_ep.is_ipv4() {
            SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), adv_ep.port())
        } else {
            SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), adv_ep.port())
        };
        socket
            .bind(&bind_addr.into())
            .map_err(|_| YogiError::BindSocketFailed)?;

        match adv_ep.ip() {
            std::net::IpAddr::V4(group) => socket
                .join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)
                .map_err(|_| YogiError::SetSocketOptionFailed)?,
            std::net::IpAddr::V6(group) => socket
                .join_multicast_v6(&group, 0)
                .map_err(|_| YogiError::SetSocketOptionFailed)?,
        }

        socket
            .set_nonblocking(true)
            .map_err(|_| YogiError::SetSocketOptionFailed)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(|_| YogiError::OpenSocketFailed)?;

        Ok(Self { socket, local_uuid })
    }

    /// Runs the receive loop forever, invoking `on_discovered` for every
    /// valid advertisement from a peer other than ourselves. A fatal
    /// socket error ends the loop; malformed or self-originated messages
    /// are logged (or silently ignored for self) and the loop continues.
    pub async fn run(self: Arc<Self>, on_discovered: impl Fn(Discovery) + Send + Sync + 'static) {
        let mut buf = vec![0u8; ADVERTISING_MESSAGE_SIZE + 1];
        loop {
            let (n, sender) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    error!("failed to receive advertising message: {e}. No more advertising messages will be received.");
                    return;
                }
            };

            if n != ADVERTISING_MESSAGE_SIZE {
                warn!("unexpected advertising message size received ({n} bytes)");
                continue;
            }

            let (uuid, port) = match RemoteBranchInfo::deserialize_advertising_message(&buf[..n]) {
                Ok(v) => v,
                Err(e) => {
                    warn!("invalid advertising message received from {}: {e}", sender.ip());
                    continue;
                }
            };

            if uuid == self.local_uuid {
                continue;
            }

            on_discovered(Discovery {
                uuid,
                tcp_endpoint: SocketAddr::new(sender.ip(), port),
            });
        }
    }
}
