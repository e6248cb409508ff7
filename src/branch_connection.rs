//! Per-peer session lifecycle: info exchange, challenge/response
//! authentication, then a running session that heartbeats and dispatches
//! received messages. Grounded in `objects::detail::BranchConnection`,
//! generalized from its callback chain into a sequence of `async fn`s —
//! each phase here is one `await` instead of one completion handler, and
//! `next_result_`'s "deferred error surfaces on the next phase" role is
//! simply the `?` operator.
//!
//! The receive loop is the one place this module completes what the
//! original left as a placeholder (`StartReceive` there reads one byte at
//! a time and does nothing with it): `run_session` drives
//! `MessageTransport::receive` in a loop and dispatches broadcasts to the
//! `BroadcastManager`, exactly as the surrounding design commits to.

use crate::branch_info::{LocalBranchInfo, RemoteBranchInfo, INFO_MESSAGE_HEADER_SIZE};
use crate::broadcast_manager::BroadcastManager;
use crate::error::{YogiError, YogiResult};
use crate::message::Message;
use crate::msg_transport::MessageTransport;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const ACK_BYTE: u8 = 0x55;
const CHALLENGE_LEN: usize = 8;
const SOLUTION_LEN: usize = 32;
/// Refuses an info message body larger than this rather than allocating
/// an attacker-controlled amount of memory for it.
const MAX_INFO_BODY_SIZE: u32 = 64 * 1024;
/// Upper bound on a single session message, applied to the receive loop's
/// scratch buffer.
const MAX_SESSION_MESSAGE_SIZE: usize = 64 * 1024;

/// A peer connection that has survived the info exchange. Not yet
/// authenticated.
pub struct BranchConnection {
    pub transport: Arc<dyn Transport>,
    pub is_tcp_server: bool,
    pub remote_info: RemoteBranchInfo,
    pub connected_since: DateTime<Utc>,
}

impl BranchConnection {
    /// Exchanges info messages with the peer over `transport` and
    /// validates the result, returning a connection ready for
    /// authentication. `is_tcp_server` records which side accepted versus
    /// initiated the connection, needed later for the priority tie-break.
    pub async fn exchange_branch_info(
        transport: Arc<dyn Transport>,
        local_info: &LocalBranchInfo,
        is_tcp_server: bool,
    ) -> YogiResult<Self> {
        transport.send_all(local_info.info_message()).await?;

        let mut header = vec![0u8; INFO_MESSAGE_HEADER_SIZE];
        transport.receive_all(&mut header).await?;

        let body_size = RemoteBranchInfo::deserialize_info_message_body_size(&header)?;
        if body_size > MAX_INFO_BODY_SIZE {
            return Err(YogiError::PayloadTooLarge);
        }

        let mut full_msg = header;
        let mut body = vec![0u8; body_size as usize];
        transport.receive_all(&mut body).await?;
        full_msg.extend_from_slice(&body);

        let peer_ip = transport
            .peer_ip()
            .ok_or(YogiError::RwSocketFailed)?;
        let remote_info = RemoteBranchInfo::create_from_info_message(&full_msg, peer_ip)?;

        if remote_info.fields.uuid == local_info.fields.uuid {
            return Err(YogiError::LoopbackConnection);
        }

        exchange_ack(&*transport).await?;

        Ok(Self {
            transport,
            is_tcp_server,
            remote_info,
            connected_since: Utc::now(),
        })
    }

    /// Runs the challenge/response handshake against
    /// `password_hash` (SHA-256 of the configured password, computed once
    /// by the caller). Returns `PasswordMismatch` rather than closing the
    /// transport itself — the caller decides what to do with a failed
    /// handshake (blacklisting, in `ConnectionManager`'s case).
    pub async fn authenticate(&self, password_hash: &[u8; 32]) -> YogiResult<()> {
        let mut my_challenge = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut my_challenge);
        self.transport.send_all(&my_challenge).await?;

        let mut remote_challenge = [0u8; CHALLENGE_LEN];
        self.transport.receive_all(&mut remote_challenge).await?;

        let my_solution = solve(&my_challenge, password_hash);
        let solution_to_remote_challenge = solve(&remote_challenge, password_hash);

        self.transport
            .send_all(&solution_to_remote_challenge)
            .await?;

        let mut received_solution = [0u8; SOLUTION_LEN];
        self.transport.receive_all(&mut received_solution).await?;

        exchange_ack(&*self.transport).await?;

        if received_solution != my_solution {
            return Err(YogiError::PasswordMismatch);
        }

        Ok(())
    }

    /// Runs the established session: a heartbeat timer ticking at
    /// `heartbeat_period` and a receive loop dispatching broadcasts to
    /// `broadcast_manager`. Returns the error that ended the session
    /// (always an error — a session only ends via failure or cancellation).
    ///
    /// Both directions race in one `select!` rather than a spawned
    /// heartbeat task: a send failure on the heartbeat path must terminate
    /// the session exactly as promptly as a receive failure does, and
    /// `select!` dropping the loser's future is simpler than plumbing a
    /// shared error slot between the two. A spawned task whose oneshot
    /// resolves `Ok(Err(e))` on failure (as `MessageTransport`'s pending
    /// sends do once `fail_all_pending` runs) would need that error
    /// threaded back out anyway.
    pub async fn run_session(
        mt: Arc<MessageTransport>,
        heartbeat_period: Duration,
        broadcast_manager: Arc<BroadcastManager>,
        remote_uuid: Uuid,
    ) -> YogiError {
        let heartbeat = async {
            loop {
                tokio::time::sleep(heartbeat_period).await;
                if !mt.try_send(&Message::Heartbeat) {
                    let (_oid, rx) = mt.send_async(Message::Heartbeat);
                    match rx.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return e,
                        Err(_) => return YogiError::Canceled,
                    }
                }
            }
        };

        let receive = async {
            let mut buf = vec![0u8; MAX_SESSION_MESSAGE_SIZE];
            loop {
                match mt.receive(&mut buf).await {
                    Ok(n) => match Message::from_bytes(&buf[..n]) {
                        Ok(Message::Broadcast(payload)) => {
                            broadcast_manager.on_broadcast_received(remote_uuid, payload);
                        }
                        Ok(Message::Heartbeat) | Ok(Message::Acknowledge) => {}
                        Err(e) => return e,
                    },
                    Err(e) => return e,
                }
            }
        };

        tokio::select! {
            err = heartbeat => err,
            err = receive => err,
        }
    }
}

fn solve(challenge: &[u8], password_hash: &[u8; 32]) -> [u8; SOLUTION_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(password_hash);
    hasher.finalize().into()
}

async fn exchange_ack(transport: &dyn Transport) -> YogiResult<()> {
    transport.send_all(&[ACK_BYTE]).await?;
    let mut ack = [0u8; 1];
    transport.receive_all(&mut ack).await?;
    if ack[0] != ACK_BYTE {
        return Err(YogiError::DeserializeMsgFailed);
    }
    Ok(())
}

/// Hashes a plaintext password the way a configured `BranchConfig`
/// expects it stored: SHA-256 of the UTF-8 bytes. An empty password
/// hashes to the SHA-256 of the empty string, same as any other branch
/// with no password configured, so two unauthenticated branches can still
/// complete the handshake.
pub fn hash_password(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}
