//! # Yogi Branch Runtime
//!
//! An embeddable peer-to-peer messaging runtime. A process instantiates a
//! [`Branch`]: a node that discovers sibling branches on a LAN via UDP
//! multicast, establishes authenticated TCP sessions with them, exchanges
//! a binary message protocol (heartbeats, acknowledgements, user
//! broadcasts), and surfaces lifecycle events and broadcast delivery back
//! to the host program.
//!
//! Module map mirrors the component breakdown: [`ringbuffer`] is the
//! SPSC byte ring staging TX/RX bytes for [`msg_transport`], which frames
//! messages over an abstract [`transport`] ([`tcp_transport`] is the only
//! concrete binding). [`codec`] and [`message`] are the wire format.
//! [`branch_info`] is a peer's identity, local or remote.
//! [`advertising_sender`]/[`advertising_receiver`] handle LAN discovery.
//! [`branch_connection`] is the per-peer handshake/session state machine,
//! orchestrated by [`connection_manager`], which also arbitrates
//! duplicate connections and the uuid blacklist. [`broadcast_manager`]
//! fans broadcasts across running sessions. [`branch`] ties all of the
//! above into the one object a host application actually constructs.

pub mod advertising_receiver;
pub mod advertising_sender;
pub mod branch;
pub mod branch_connection;
pub mod branch_info;
pub mod broadcast_manager;
pub mod codec;
pub mod config;
pub mod connection_manager;
pub mod error;
pub mod logging;
pub mod message;
pub mod msg_transport;
pub mod ringbuffer;
pub mod tcp_transport;
pub mod transport;

pub use branch::Branch;
pub use broadcast_manager::Encoding;
pub use config::BranchConfig;
pub use connection_manager::{BranchEvent, BranchEventKind, ALL_EVENTS, NO_EVENTS};
pub use error::{YogiError, YogiResult};

/// The current version of the branch runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
