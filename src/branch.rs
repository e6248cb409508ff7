//! The public entry point tying every other module into one object a
//! host application constructs: the local `BranchInfo` created once at
//! startup and shared read-only, plus the network plumbing and
//! broadcast fan-out every other module implements a piece of. Grounded
//! in `objects::Branch` of the original C++ library (`objects/branch.cc`/
//! `.h`), the one piece described there only in terms of its parts.
//!
//! The original splits construction (`BranchCreate`) from network
//! startup (`Branch::Start`). Rust constructors can't `await`, so
//! this crate folds both into a single async `Branch::new`: a host
//! application calls them back to back in the original anyway, and
//! `LocalBranchInfo` needs the TCP server's actual bound port (possibly
//! OS-assigned from port 0) before it can be built, which means the bind
//! has to happen before `LocalBranchInfo::new`, not during a later
//! `start()`.

use crate::branch_info::{LocalBranchConfig, LocalBranchInfo};
use crate::broadcast_manager::{BroadcastManager, Encoding};
use crate::config::BranchConfig;
use crate::connection_manager::{BranchEvent, ConnectionManager};
use crate::error::{YogiError, YogiResult};
use crate::tcp_transport::TcpTransport;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// A running branch: a node in the Yogi network with its own identity,
/// advertising on the LAN, accepting and initiating authenticated
/// sessions with sibling branches, and fanning broadcasts across them.
///
/// Destroying the last `Arc<Branch>` tears down every task it owns —
/// accept loop, advertising sender/receiver, and every session — since
/// those tasks hold only weak or ring-fenced references back into the
/// branch's components, never a strong `Arc<Branch>` of their own (the
/// "destroying the branch cancels every in-flight operation").
pub struct Branch {
    local_info: Arc<LocalBranchInfo>,
    connection_manager: Arc<ConnectionManager>,
    broadcast_manager: Arc<BroadcastManager>,
    background_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Branch {
    /// Constructs and starts a branch: binds the TCP acceptor, builds the
    /// local branch's identity, and starts advertising, accepting, and
    /// discovering peers, matching the original `Branch::Start`.
    pub async fn new(config: BranchConfig) -> YogiResult<Arc<Self>> {
        if config.network_name.is_empty() {
            return Err(YogiError::InvalidParam);
        }

        let adv_ep = config.advertising_address;
        let bind_port = config.tcp_bind_address.port();
        let bind_addr: SocketAddr = if adv_ep.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), bind_port)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), bind_port)
        };
        let listener = TcpTransport::bind(bind_addr).await?;
        let tcp_endpoint = listener
            .local_addr()
            .map_err(|_| YogiError::BindSocketFailed)?;

        let local_info = Arc::new(LocalBranchInfo::new(
            LocalBranchConfig {
                name: config.name.clone(),
                description: config.description.clone(),
                net_name: config.network_name.clone(),
                path: config.path.clone(),
                timeout: config.timeout(),
                advertising_interval: config.advertising_interval(),
                ghost_mode: config.ghost_mode,
                tx_queue_size: config.tx_queue_size,
                rx_queue_size: config.rx_queue_size,
            },
            tcp_endpoint,
        )?);

        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
        let (connection_manager, broadcast_manager) =
            ConnectionManager::new(local_info.clone(), &config.password, changed_tx);

        let branch = Arc::new(Self {
            local_info: local_info.clone(),
            connection_manager: connection_manager.clone(),
            broadcast_manager,
            background_tasks: std::sync::Mutex::new(Vec::new()),
        });

        connection_manager.start(listener, adv_ep).await?;

        // Drains the manager's per-session start/stop notifications so the
        // channel never backs up; `connected_branches()` below stays the
        // authoritative source for a host application's own bookkeeping.
        let changed_task = tokio::spawn(async move {
            while let Some((uuid, result)) = changed_rx.recv().await {
                match result {
                    Ok(()) => debug!("[{uuid}] session started"),
                    Err(e) => debug!("[{uuid}] session ended: {e}"),
                }
            }
        });
        branch.background_tasks.lock().unwrap().push(changed_task);

        Ok(branch)
    }

    /// This branch's own identity, as presented to peers over the wire.
    pub fn info(&self) -> &LocalBranchInfo {
        &self.local_info
    }

    /// JSON view of this branch's own identity, suitable for logging or
    /// exposing over a host application's own API.
    pub fn info_json(&self) -> &serde_json::Value {
        self.local_info.to_json()
    }

    pub fn uuid(&self) -> Uuid {
        self.local_info.fields.uuid
    }

    /// Uuid and JSON info view of every branch this branch currently has
    /// a running, authenticated session with.
    pub fn connected_branches(&self) -> std::collections::HashMap<Uuid, serde_json::Value> {
        self.connection_manager.connected_branches()
    }

    /// Waits for the next branch lifecycle event whose kind is set in
    /// `event_mask`. Installing a new wait while one is already
    /// pending completes the old one with `Canceled`.
    pub async fn await_event(&self, event_mask: u8) -> YogiResult<BranchEvent> {
        self.connection_manager.await_event(event_mask).await
    }

    /// Completes a pending `await_event` with `Canceled`.
    pub fn cancel_await_event(&self) -> bool {
        self.connection_manager.cancel_await_event()
    }

    /// Fans `payload` (JSON or MessagePack, per `encoding`) out to every
    /// currently running session. `retry = false` resolves
    /// synchronously with `TxQueueFull` if any session's TX ring was
    /// already full; `retry = true` queues on those sessions and resolves
    /// once they've all drained or the operation is canceled.
    pub fn send_broadcast_async(
        self: &Arc<Self>,
        payload: &[u8],
        encoding: Encoding,
        retry: bool,
    ) -> YogiResult<(u64, tokio::sync::oneshot::Receiver<YogiResult<()>>)> {
        self.broadcast_manager
            .send_broadcast_async(payload, encoding, retry)
    }

    /// Convenience wrapper around `send_broadcast_async` that awaits the
    /// result inline.
    pub async fn send_broadcast(
        self: &Arc<Self>,
        payload: &[u8],
        encoding: Encoding,
        retry: bool,
    ) -> YogiResult<()> {
        let (_oid, rx) = self.send_broadcast_async(payload, encoding, retry)?;
        rx.await.map_err(|_| YogiError::Canceled)?
    }

    /// Cancels a still-pending retrying broadcast.
    pub fn cancel_send_broadcast(&self, oid: u64) -> bool {
        self.broadcast_manager.cancel_send_broadcast(oid)
    }

    /// Waits for the next broadcast observed on any running session,
    /// transcoded into `encoding` and copied into `buf`.
    pub async fn receive_broadcast(&self, encoding: Encoding, buf: &mut [u8]) -> YogiResult<usize> {
        self.broadcast_manager.receive_broadcast(encoding, buf).await
    }

    /// Completes a pending `receive_broadcast` with `Canceled`.
    pub fn cancel_receive_broadcast(&self) -> bool {
        self.broadcast_manager.cancel_receive_broadcast()
    }

    /// Tears the branch down: cancels every outstanding `await_event` and
    /// `receive_broadcast`, aborts the connection manager's accept loop and
    /// advertising sender/receiver, then aborts background bookkeeping
    /// tasks. Per-session tasks close on their own once nothing but
    /// `Drop`ping this `Branch` (and therefore its `ConnectionManager`, and
    /// in turn every `Arc<MessageTransport>` it was the last strong owner
    /// of) removes the last reference to their transport. Must not be
    /// called from within one of the branch's own event/broadcast handlers
    /// (the branch's cleanup rule: never tear down from inside your own handler).
    pub fn shutdown(&self) {
        self.connection_manager.cancel_await_event();
        self.broadcast_manager.cancel_receive_broadcast();
        self.connection_manager.shutdown();
        for handle in self.background_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{BranchEventKind, ALL_EVENTS};
    use std::time::Duration;

    fn config(name: &str, net: &str, adv_port: u16) -> BranchConfig {
        BranchConfig {
            name: name.to_string(),
            description: String::new(),
            network_name: net.to_string(),
            password: String::new(),
            path: format!("/{name}"),
            advertising_address: format!("239.255.97.5:{adv_port}").parse().unwrap(),
            advertising_interval_ms: Some(50),
            tcp_bind_address: "127.0.0.1:0".parse().unwrap(),
            timeout_ms: Some(500),
            ghost_mode: false,
            tx_queue_size: crate::branch_info::DEFAULT_QUEUE_SIZE,
            rx_queue_size: crate::branch_info::DEFAULT_QUEUE_SIZE,
        }
    }

    #[tokio::test]
    async fn two_branches_on_the_same_network_discover_and_connect() {
        let a = Branch::new(config("branch-a", "test-net", 21001)).await.unwrap();
        let b = Branch::new(config("branch-b", "test-net", 21001)).await.unwrap();

        let a_wait = a.await_event(ALL_EVENTS);
        let b_wait = b.await_event(ALL_EVENTS);

        let (a_ev, b_ev) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(a_wait, b_wait)
        })
        .await
        .expect("branches should discover each other within the timeout");

        assert!(a_ev.is_ok());
        assert!(b_ev.is_ok());

        for _ in 0..100 {
            if !a.connected_branches().is_empty() && !b.connected_branches().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(a.connected_branches().len(), 1);
        assert_eq!(b.connected_branches().len(), 1);
        assert!(a.connected_branches().contains_key(&b.uuid()));
        assert!(b.connected_branches().contains_key(&a.uuid()));

        let b_as_seen_by_a = &a.connected_branches()[&b.uuid()];
        assert_eq!(b_as_seen_by_a["name"], "branch-b");
        assert!(b_as_seen_by_a["connected_since"].is_string());
    }

    #[tokio::test]
    async fn mismatched_network_names_never_connect() {
        let a = Branch::new(config("branch-a", "net-a", 21002)).await.unwrap();
        let b = Branch::new(config("branch-b", "net-b", 21002)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(a.connected_branches().is_empty());
        assert!(b.connected_branches().is_empty());
    }

    #[tokio::test]
    async fn ghost_branch_queries_but_never_finishes_connecting() {
        let mut ghost_cfg = config("ghost", "test-net", 21003);
        ghost_cfg.ghost_mode = true;
        let ghost = Branch::new(ghost_cfg).await.unwrap();
        let peer = Branch::new(config("peer", "test-net", 21003)).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = ghost.await_event(ALL_EVENTS).await.unwrap();
                if ev.kind == BranchEventKind::BranchQueried {
                    return ev;
                }
            }
        })
        .await
        .expect("ghost should still query the peer");
        assert!(result.result.is_ok());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(ghost.connected_branches().is_empty());
        assert!(peer.connected_branches().is_empty());
    }
}
