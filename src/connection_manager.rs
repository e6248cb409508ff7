//! Accept/connect orchestration, duplicate-connection arbitration, the
//! uuid blacklist, and branch event delivery. Grounded in
//! `objects::detail::ConnectionManager`, restructured from its callback
//! chain into one `async fn` per accepted/connected socket that walks the
//! whole exchange→authenticate→session pipeline in order — the "next
//! phase runs on the scheduler" shape of the original falls out for free
//! from `.await`.

use crate::advertising_receiver::{AdvertisingReceiver, Discovery};
use crate::advertising_sender::AdvertisingSender;
use crate::branch_connection::{hash_password, BranchConnection};
use crate::branch_info::LocalBranchInfo;
use crate::broadcast_manager::{BroadcastManager, RunningSessions};
use crate::error::{YogiError, YogiResult};
use crate::msg_transport::MessageTransport;
use crate::tcp_transport::TcpTransport;
use crate::transport::Transport;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A branch lifecycle event as delivered to `await_event`. Event
/// payloads are JSON; `result` carries the associated error code
/// out-of-band, exactly as the original splits `ev_res` from the JSON
/// string.
#[derive(Debug, Clone)]
pub struct BranchEvent {
    pub kind: BranchEventKind,
    pub result: Result<(), YogiError>,
    pub uuid: Uuid,
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchEventKind {
    BranchDiscovered,
    BranchQueried,
    ConnectFinished,
    ConnectionLost,
}

impl BranchEventKind {
    fn bit(self) -> u8 {
        match self {
            BranchEventKind::BranchDiscovered => 1 << 0,
            BranchEventKind::BranchQueried => 1 << 1,
            BranchEventKind::ConnectFinished => 1 << 2,
            BranchEventKind::ConnectionLost => 1 << 3,
        }
    }
}

/// Mask value observing every event kind.
pub const ALL_EVENTS: u8 = 0b1111;
/// Mask value observing none.
pub const NO_EVENTS: u8 = 0;

/// What the connection manager remembers about a peer once info exchange
/// has completed, whether or not a session ever started. Mirrors the
/// original's `connections_` map entry: it stays populated even for a
/// connection that failed validation, since `GetConnectedBranches` only
/// reports entries with a running session (tracked separately in
/// `sessions`).
struct ConnectionEntry {
    is_tcp_server: bool,
    name: String,
    path: String,
    /// Remote info JSON plus `connected_since`, matching the original's
    /// `BranchConnection::MakeInfoString` (`connected_since_` there; this
    /// crate settles on `connected_since` with no trailing underscore as
    /// the one canonical key, per the resolved open question in DESIGN.md).
    json: serde_json::Value,
}

fn make_info_json(conn: &BranchConnection) -> serde_json::Value {
    let mut json = conn.remote_info.fields.to_json();
    json["connected_since"] = json!(conn.connected_since.to_rfc3339());
    json
}

struct State {
    connections: HashMap<Uuid, ConnectionEntry>,
    blacklisted: HashSet<Uuid>,
    pending_connects: HashSet<Uuid>,
}

/// Notification sent to the owning `Branch` whenever a session starts or
/// ends, so it can keep its own bookkeeping (e.g. a simple connected-count)
/// without polling `ConnectionManager`.
pub type ConnectionChanged = mpsc::UnboundedSender<(Uuid, Result<(), YogiError>)>;

pub struct ConnectionManager {
    local_info: Arc<LocalBranchInfo>,
    password_hash: [u8; 32],
    state: Mutex<State>,
    sessions: RunningSessions,
    broadcast_manager: Arc<BroadcastManager>,
    event_slot: Mutex<Option<(u8, oneshot::Sender<YogiResult<BranchEvent>>)>>,
    connection_changed: ConnectionChanged,
    /// Handles for the accept loop, advertising sender, and advertising
    /// receiver tasks spawned by `start`, so `shutdown` can cancel them.
    /// Per-session tasks (heartbeat, receive loop) are not tracked here —
    /// they end on their own once their transport closes, which dropping
    /// the acceptor and advertising tasks does not by itself trigger, but
    /// which a `Branch::shutdown` that also drops the `Branch` achieves by
    /// taking the last strong reference to each session's `MessageTransport`.
    task_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// An arbitrarily large but finite timeout standing in for "no timeout",
/// since `tokio::time::timeout` needs a concrete `Duration`.
const EFFECTIVELY_INFINITE_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn effective_timeout(local_info: &LocalBranchInfo) -> Duration {
    local_info.fields.timeout.unwrap_or(EFFECTIVELY_INFINITE_TIMEOUT)
}

impl ConnectionManager {
    pub fn new(
        local_info: Arc<LocalBranchInfo>,
        password: &str,
        connection_changed: ConnectionChanged,
    ) -> (Arc<Self>, Arc<BroadcastManager>) {
        let sessions: RunningSessions = Arc::new(Mutex::new(HashMap::new()));
        let broadcast_manager = BroadcastManager::new(sessions.clone());

        let cm = Arc::new(Self {
            local_info,
            password_hash: hash_password(password),
            state: Mutex::new(State {
                connections: HashMap::new(),
                blacklisted: HashSet::new(),
                pending_connects: HashSet::new(),
            }),
            sessions,
            broadcast_manager: broadcast_manager.clone(),
            event_slot: Mutex::new(None),
            connection_changed,
            task_handles: Mutex::new(Vec::new()),
        });
        (cm, broadcast_manager)
    }

    pub fn broadcast_manager(&self) -> Arc<BroadcastManager> {
        self.broadcast_manager.clone()
    }

    /// Starts the accept loop over an already-bound `listener`, plus the
    /// advertising sender and receiver. `listener` is bound by the caller
    /// (`Branch::new`) rather than here, because `LocalBranchInfo` must
    /// already carry the final TCP port (possibly OS-assigned from port 0)
    /// before it's constructed — binding has to happen before, not during,
    /// `start`. The acceptor's address family matches the advertising
    /// endpoint's.
    pub async fn start(self: &Arc<Self>, listener: tokio::net::TcpListener, adv_ep: SocketAddr) -> YogiResult<()> {
        let this = self.clone();
        let accept_handle = tokio::spawn(async move { this.run_accept_loop(listener).await });

        let sender = AdvertisingSender::bind(adv_ep).await;
        let info = self.local_info.clone();
        let interval = info.fields.advertising_interval;
        let sender_handle = tokio::spawn(async move { sender.run(info, interval).await });

        let receiver = Arc::new(
            AdvertisingReceiver::bind(adv_ep, self.local_info.fields.uuid).await?,
        );
        let this = self.clone();
        let receiver_handle = tokio::spawn(async move {
            receiver
                .run(move |d: Discovery| {
                    let this = this.clone();
                    this.on_advertisement_received(d);
                })
                .await;
        });

        self.task_handles
            .lock()
            .unwrap()
            .extend([accept_handle, sender_handle, receiver_handle]);

        info!(
            "{} started ConnectionManager with TCP server port {}{}",
            self.local_info.fields.name,
            self.local_info.fields.tcp_endpoint.port(),
            if self.local_info.fields.ghost_mode { " in ghost mode" } else { "" }
        );

        Ok(())
    }

    async fn run_accept_loop(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("accepted incoming TCP connection from {peer}");
                    match TcpTransport::from_accepted(stream, effective_timeout(&self.local_info)) {
                        Ok(transport) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.start_exchange_branch_info(Arc::new(transport), true, None)
                                    .await;
                            });
                        }
                        Err(e) => error!("failed to configure accepted socket: {e}"),
                    }
                }
                Err(e) => {
                    let err = YogiError::AcceptSocketFailed;
                    error!(
                        "accepting incoming TCP connections failed: {err} ({e}). No more \
                         connections will be accepted."
                    );
                    return;
                }
            }
        }
    }

    fn on_advertisement_received(self: Arc<Self>, discovery: Discovery) {
        let Discovery { uuid, tcp_endpoint } = discovery;
        {
            let mut state = self.state.lock().unwrap();
            if state.connections.contains_key(&uuid)
                || state.blacklisted.contains(&uuid)
                || state.pending_connects.contains(&uuid)
            {
                return;
            }
            state.pending_connects.insert(uuid);
        }

        debug!("attempting to connect to [{uuid}] on {tcp_endpoint}");
        self.emit_event(
            BranchEventKind::BranchDiscovered,
            Ok(()),
            uuid,
            json!({
                "uuid": uuid.to_string(),
                "tcp_server_address": tcp_endpoint.ip().to_string(),
                "tcp_server_port": tcp_endpoint.port(),
            }),
        );

        tokio::spawn(async move {
            let timeout = effective_timeout(&self.local_info);
            match TcpTransport::connect(tcp_endpoint, timeout).await {
                Ok(transport) => {
                    self.start_exchange_branch_info(Arc::new(transport), false, Some(uuid))
                        .await;
                }
                Err(err) => {
                    self.emit_event(BranchEventKind::BranchQueried, Err(err), uuid, json!({"uuid": uuid.to_string()}));
                    self.state.lock().unwrap().pending_connects.remove(&uuid);
                }
            }
        });
    }

    async fn start_exchange_branch_info(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        is_tcp_server: bool,
        adv_uuid: Option<Uuid>,
    ) {
        let result =
            BranchConnection::exchange_branch_info(transport, &self.local_info, is_tcp_server)
                .await;

        match result {
            Ok(conn) => {
                self.on_exchange_branch_info_finished(conn, adv_uuid).await;
            }
            Err(e) => {
                error!("exchanging branch info failed: {e}");
            }
        }

        if let Some(uuid) = adv_uuid {
            self.state.lock().unwrap().pending_connects.remove(&uuid);
        }
    }

    async fn on_exchange_branch_info_finished(
        self: Arc<Self>,
        conn: BranchConnection,
        adv_uuid: Option<Uuid>,
    ) {
        let remote_uuid = conn.remote_info.fields.uuid;

        if !conn.is_tcp_server {
            if let Some(expected) = adv_uuid {
                if expected != remote_uuid {
                    warn!(
                        "dropping connection: branch info uuid [{remote_uuid}] does not \
                         match advertised uuid [{expected}]; will retry on next discovery"
                    );
                    return;
                }
            }
        }

        let first_mapping;
        {
            let mut state = self.state.lock().unwrap();
            if state.blacklisted.contains(&remote_uuid) {
                debug!("dropping connection to [{remote_uuid}]: blacklisted");
                return;
            }

            let entry = ConnectionEntry {
                is_tcp_server: conn.is_tcp_server,
                name: conn.remote_info.fields.name.clone(),
                path: conn.remote_info.fields.path.clone(),
                json: make_info_json(&conn),
            };

            first_mapping = match state.connections.get(&remote_uuid) {
                None => {
                    state.connections.insert(remote_uuid, entry);
                    true
                }
                Some(existing) => {
                    // Priority rule: the TCP-server side keeps the
                    // connection iff the remote uuid sorts below the local
                    // uuid; otherwise the TCP-client side keeps it. This
                    // breaks the tie when both sides connect to each other
                    // at once.
                    let this_side_wins =
                        (remote_uuid < self.local_info.fields.uuid) == conn.is_tcp_server;
                    if !this_side_wins {
                        debug!(
                            "dropping {} connection to [{remote_uuid}]: a higher-priority \
                             connection already exists",
                            if conn.is_tcp_server { "server" } else { "client" }
                        );
                        return;
                    }
                    let _ = existing;
                    state.connections.insert(remote_uuid, entry);
                    false
                }
            };
        }

        if first_mapping {
            self.emit_event(
                BranchEventKind::BranchQueried,
                Ok(()),
                remote_uuid,
                conn.remote_info.fields.to_json(),
            );

            if let Err(chk_err) = self.check_remote_branch_info(&conn, remote_uuid) {
                self.emit_event(
                    BranchEventKind::ConnectFinished,
                    Err(chk_err),
                    remote_uuid,
                    json!({"uuid": remote_uuid.to_string()}),
                );
                return;
            }
        }

        if self.local_info.fields.ghost_mode {
            self.state.lock().unwrap().blacklisted.insert(remote_uuid);
            return;
        }

        self.start_authenticate(conn).await;
    }

    /// Validates a newly queried remote against the local branch and every
    /// other currently connected branch. Collisions with the
    /// local branch blacklist the remote; collisions with a third party do
    /// not, since the fault isn't necessarily this peer's.
    fn check_remote_branch_info(
        &self,
        conn: &BranchConnection,
        remote_uuid: Uuid,
    ) -> YogiResult<()> {
        let mut state = self.state.lock().unwrap();

        if conn.remote_info.fields.net_name != self.local_info.fields.net_name {
            state.blacklisted.insert(remote_uuid);
            return Err(YogiError::NetNameMismatch);
        }
        if conn.remote_info.fields.name == self.local_info.fields.name {
            state.blacklisted.insert(remote_uuid);
            return Err(YogiError::DuplicateBranchName);
        }
        if conn.remote_info.fields.path == self.local_info.fields.path {
            state.blacklisted.insert(remote_uuid);
            return Err(YogiError::DuplicateBranchPath);
        }

        for (uuid, entry) in state.connections.iter() {
            if *uuid == remote_uuid {
                continue;
            }
            if entry.name == conn.remote_info.fields.name {
                return Err(YogiError::DuplicateBranchName);
            }
            if entry.path == conn.remote_info.fields.path {
                return Err(YogiError::DuplicateBranchPath);
            }
        }

        Ok(())
    }

    async fn start_authenticate(self: Arc<Self>, conn: BranchConnection) {
        let remote_uuid = conn.remote_info.fields.uuid;
        let result = conn.authenticate(&self.password_hash).await;

        match result {
            Err(e) => {
                if e == YogiError::PasswordMismatch {
                    self.state.lock().unwrap().blacklisted.insert(remote_uuid);
                }
                self.state.lock().unwrap().connections.remove(&remote_uuid);
                self.emit_event(
                    BranchEventKind::ConnectFinished,
                    Err(e),
                    remote_uuid,
                    json!({"uuid": remote_uuid.to_string()}),
                );
            }
            Ok(()) => {
                self.start_session(conn).await;
            }
        }
    }

    async fn start_session(self: Arc<Self>, conn: BranchConnection) {
        let remote_uuid = conn.remote_info.fields.uuid;
        let remote_timeout = conn
            .remote_info
            .fields
            .timeout
            .unwrap_or(EFFECTIVELY_INFINITE_TIMEOUT);
        // Heartbeat on the remote's timeout, not our own: the peer's
        // receive timer is then never at risk under healthy conditions.
        let heartbeat_period = remote_timeout / 2;

        let mt = MessageTransport::new(
            conn.transport.clone(),
            self.local_info.fields.tx_queue_size,
            self.local_info.fields.rx_queue_size,
        );

        self.sessions.lock().unwrap().insert(remote_uuid, mt.clone());

        self.emit_event(
            BranchEventKind::ConnectFinished,
            Ok(()),
            remote_uuid,
            json!({"uuid": remote_uuid.to_string()}),
        );
        let _ = self.connection_changed.send((remote_uuid, Ok(())));

        let broadcast_manager = self.broadcast_manager.clone();
        let err = BranchConnection::run_session(mt, heartbeat_period, broadcast_manager, remote_uuid)
            .await;

        self.sessions.lock().unwrap().remove(&remote_uuid);
        self.state.lock().unwrap().connections.remove(&remote_uuid);

        self.emit_event(
            BranchEventKind::ConnectionLost,
            Err(err),
            remote_uuid,
            json!({"uuid": remote_uuid.to_string()}),
        );
        let _ = self.connection_changed.send((remote_uuid, Err(err)));
    }

    fn emit_event(
        &self,
        kind: BranchEventKind,
        result: Result<(), YogiError>,
        uuid: Uuid,
        json: serde_json::Value,
    ) {
        match kind {
            BranchEventKind::BranchDiscovered => debug!("event: BranchDiscovered uuid={uuid} result={result:?}"),
            BranchEventKind::BranchQueried => info!("event: BranchQueried uuid={uuid} result={result:?}"),
            BranchEventKind::ConnectFinished => info!("event: ConnectFinished uuid={uuid} result={result:?}"),
            BranchEventKind::ConnectionLost => warn!("event: ConnectionLost uuid={uuid} result={result:?}"),
        }

        let mut slot = self.event_slot.lock().unwrap();
        let Some((mask, _)) = slot.as_ref() else {
            return;
        };
        if mask & kind.bit() == 0 {
            return;
        }

        let (_, sender) = slot.take().unwrap();
        let _ = sender.send(Ok(BranchEvent { kind, result, uuid, json }));
    }

    /// Installs a single-slot handler for the next event whose kind is set
    /// in `mask`. Replacing an already-installed handler completes the old
    /// one with `Canceled`.
    pub async fn await_event(&self, mask: u8) -> YogiResult<BranchEvent> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.event_slot.lock().unwrap();
            if let Some((_, old)) = slot.take() {
                let _ = old.send(Err(YogiError::Canceled));
            }
            *slot = Some((mask, tx));
        }
        rx.await.map_err(|_| YogiError::Canceled)?
    }

    /// Completes a pending `await_event` with `Canceled`. Returns whether
    /// anything was actually waiting.
    pub fn cancel_await_event(&self) -> bool {
        let mut slot = self.event_slot.lock().unwrap();
        if let Some((_, sender)) = slot.take() {
            let _ = sender.send(Err(YogiError::Canceled));
            true
        } else {
            false
        }
    }

    /// Aborts the accept loop and the advertising sender/receiver tasks.
    /// Part of `Branch::shutdown`'s "destroying the branch cancels every
    /// in-flight accept/connect" contract (§5); per-session tasks end on
    /// their own once the branch's last `Arc<ConnectionManager>` reference
    /// is gone, since they hold the only strong references keeping a
    /// session's `MessageTransport` and socket alive.
    pub fn shutdown(&self) {
        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Returns the uuid and JSON info view of every branch with a
    /// currently running session, mirroring
    /// `MakeConnectedBranchesInfoStrings` (only sessions that actually
    /// started, not every entry in the connections map).
    pub fn connected_branches(&self) -> HashMap<Uuid, serde_json::Value> {
        let sessions = self.sessions.lock().unwrap();
        let state = self.state.lock().unwrap();
        sessions
            .keys()
            .filter_map(|uuid| state.connections.get(uuid).map(|e| (*uuid, e.json.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch_info::LocalBranchConfig;

    fn config(name: &str, net: &str, path: &str) -> LocalBranchConfig {
        LocalBranchConfig {
            name: name.to_string(),
            description: "".into(),
            net_name: net.to_string(),
            path: path.to_string(),
            timeout: Some(Duration::from_millis(500)),
            advertising_interval: Some(Duration::from_millis(50)),
            ghost_mode: false,
            tx_queue_size: crate::branch_info::DEFAULT_QUEUE_SIZE,
            rx_queue_size: crate::branch_info::DEFAULT_QUEUE_SIZE,
        }
    }

    async fn make_manager(name: &str, net: &str, path: &str, password: &str) -> Arc<ConnectionManager> {
        let info = Arc::new(
            LocalBranchInfo::new(config(name, net, path), "127.0.0.1:0".parse().unwrap()).unwrap(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let (cm, _bm) = ConnectionManager::new(info, password, tx);
        cm
    }

    #[tokio::test]
    async fn await_event_replaces_a_pending_handler_with_canceled() {
        let cm = make_manager("a", "net", "/a", "").await;
        let first = tokio::spawn({
            let cm = cm.clone();
            async move { cm.await_event(ALL_EVENTS).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _second = cm.await_event_non_blocking_for_test();
        let result = first.await.unwrap();
        assert_eq!(result.unwrap_err(), YogiError::Canceled);
    }

    #[tokio::test]
    async fn cancel_await_event_completes_pending_handler() {
        let cm = make_manager("a", "net", "/a", "").await;
        let task = tokio::spawn({
            let cm = cm.clone();
            async move { cm.await_event(ALL_EVENTS).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cm.cancel_await_event());
        assert_eq!(task.await.unwrap().unwrap_err(), YogiError::Canceled);
    }

    #[tokio::test]
    async fn connected_branches_starts_empty() {
        let cm = make_manager("a", "net", "/a", "").await;
        assert!(cm.connected_branches().is_empty());
    }

    impl ConnectionManager {
        // Test helper: installs a second handler without awaiting it, to
        // exercise the "replace" path above.
        fn await_event_non_blocking_for_test(self: &Arc<Self>) {
            let mut slot = self.event_slot.lock().unwrap();
            let (tx, _rx) = oneshot::channel();
            if let Some((_, old)) = slot.take() {
                let _ = old.send(Err(YogiError::Canceled));
            }
            *slot = Some((ALL_EVENTS, tx));
        }
    }
}
