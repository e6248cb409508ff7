//! Branch identity: the advertising/info message pair every peer presents
//! on the wire, and the two views onto it — `LocalBranchInfo` for the
//! branch constructed here, `RemoteBranchInfo` for one learned from a
//! peer. Grounded in `objects::detail::BranchInfo`.

use crate::codec::{
    serialize_duration_ns, serialize_i32, serialize_string, serialize_timestamp, serialize_u16,
    serialize_u32, serialize_uuid, FieldReader,
};
use crate::error::{YogiError, YogiResult};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use uuid::Uuid;

pub const ADVERTISING_MESSAGE_SIZE: usize = 25;
pub const INFO_MESSAGE_HEADER_SIZE: usize = ADVERTISING_MESSAGE_SIZE + 4;

const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;

/// Fields common to both the local and a remote branch's identity.
#[derive(Debug, Clone)]
pub struct BranchFields {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub net_name: String,
    pub path: String,
    pub hostname: String,
    pub pid: i32,
    pub tcp_endpoint: SocketAddr,
    pub start_time: DateTime<Utc>,
    pub timeout: Option<Duration>,
    pub advertising_interval: Option<Duration>,
    pub ghost_mode: bool,
    pub tx_queue_size: usize,
    pub rx_queue_size: usize,
}

impl BranchFields {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "uuid": self.uuid.to_string(),
            "name": self.name,
            "description": self.description,
            "network_name": self.net_name,
            "path": self.path,
            "hostname": self.hostname,
            "pid": self.pid,
            "tcp_server_address": self.tcp_endpoint.ip().to_string(),
            "tcp_server_port": self.tcp_endpoint.port(),
            "start_time": self.start_time.to_rfc3339(),
            "timeout": self.timeout.map(|d| d.as_secs_f32()).unwrap_or(-1.0),
            "advertising_interval": self
                .advertising_interval
                .map(|d| d.as_secs_f32())
                .unwrap_or(-1.0),
            "ghost_mode": self.ghost_mode,
            "tx_queue_size": self.tx_queue_size,
            "rx_queue_size": self.rx_queue_size,
        })
    }
}

/// Default byte capacity for a session's TX/RX rings when a `BranchConfig`
/// doesn't override them (a `BranchConfig`'s "tx/rx queue sizes" attributes).
pub const DEFAULT_QUEUE_SIZE: usize = 4096;

/// Parameters supplied by the host application when constructing a branch.
pub struct LocalBranchConfig {
    pub name: String,
    pub description: String,
    pub net_name: String,
    pub path: String,
    pub timeout: Option<Duration>,
    pub advertising_interval: Option<Duration>,
    pub ghost_mode: bool,
    pub tx_queue_size: usize,
    pub rx_queue_size: usize,
}

/// Immutable, constructed once at startup: this branch's own identity,
/// with its advertising and info message buffers cached so they're
/// re-sent verbatim on every advertising cycle and handshake.
pub struct LocalBranchInfo {
    pub fields: BranchFields,
    adv_msg: Vec<u8>,
    info_msg: Vec<u8>,
    json: serde_json::Value,
}

impl LocalBranchInfo {
    pub fn new(config: LocalBranchConfig, tcp_endpoint: SocketAddr) -> YogiResult<Self> {
        if config.name.is_empty() || config.net_name.is_empty() {
            return Err(YogiError::InvalidParam);
        }
        if !config.path.starts_with('/') {
            return Err(YogiError::InvalidParam);
        }

        let fields = BranchFields {
            uuid: Uuid::new_v4(),
            name: config.name,
            description: config.description,
            net_name: config.net_name,
            path: config.path,
            hostname: hostname(),
            pid: std::process::id() as i32,
            tcp_endpoint,
            start_time: Utc::now(),
            timeout: config.timeout,
            advertising_interval: config.advertising_interval,
            ghost_mode: config.ghost_mode,
            tx_queue_size: config.tx_queue_size,
            rx_queue_size: config.rx_queue_size,
        };

        let adv_msg = make_advertising_message(&fields);
        let info_msg = make_info_message(&adv_msg, &fields);
        let json = fields.to_json();

        Ok(Self {
            fields,
            adv_msg,
            info_msg,
            json,
        })
    }

    pub fn advertising_message(&self) -> &[u8] {
        &self.adv_msg
    }

    pub fn info_message(&self) -> &[u8] {
        &self.info_msg
    }

    pub fn to_json(&self) -> &serde_json::Value {
        &self.json
    }
}

/// A peer's identity, learned by deserializing a received info message.
pub struct RemoteBranchInfo {
    pub fields: BranchFields,
}

impl RemoteBranchInfo {
    /// Validates and parses the fixed advertising message header,
    /// returning the peer's uuid and advertised TCP port.
    pub fn deserialize_advertising_message(adv_msg: &[u8]) -> YogiResult<(Uuid, u16)> {
        check_magic_prefix_and_version(adv_msg)?;
        let mut reader = FieldReader::new(&adv_msg[7..]);
        let uuid = reader.read_uuid()?;
        let port = reader.read_u16()?;
        Ok((uuid, port))
    }

    /// Validates the advertising header and reads the body-length field
    /// that follows it, so the caller knows how many more bytes to read
    /// before the info message body can be parsed.
    pub fn deserialize_info_message_body_size(info_msg_hdr: &[u8]) -> YogiResult<u32> {
        check_magic_prefix_and_version(info_msg_hdr)?;
        let mut reader = FieldReader::new(&info_msg_hdr[ADVERTISING_MESSAGE_SIZE..]);
        reader.read_u32()
    }

    /// Builds a `RemoteBranchInfo` from a complete info message plus the
    /// socket address the connection was observed on — the info message
    /// itself does not carry the peer's IP, only its advertised port.
    pub fn create_from_info_message(info_msg: &[u8], remote_addr: IpAddr) -> YogiResult<Self> {
        let (uuid, port) = Self::deserialize_advertising_message(info_msg)?;
        let tcp_endpoint = SocketAddr::new(remote_addr, port);

        let mut reader = FieldReader::new(&info_msg[INFO_MESSAGE_HEADER_SIZE..]);
        let name = reader.read_string()?;
        let description = reader.read_string()?;
        let net_name = reader.read_string()?;
        let path = reader.read_string()?;
        let hostname = reader.read_string()?;
        let pid = reader.read_i32()?;
        let start_time = reader.read_timestamp()?;
        let timeout = reader.read_duration_ns()?.map(|ns| Duration::from_nanos(ns as u64));
        let advertising_interval = reader
            .read_duration_ns()?
            .map(|ns| Duration::from_nanos(ns as u64));
        let ghost_mode = reader.read_u8()? != 0;

        Ok(Self {
            fields: BranchFields {
                uuid,
                name,
                description,
                net_name,
                path,
                hostname,
                pid,
                tcp_endpoint,
                start_time,
                timeout,
                advertising_interval,
                ghost_mode,
                // Not carried over the wire: a peer's queue sizes only
                // govern its own session-local rings.
                tx_queue_size: DEFAULT_QUEUE_SIZE,
                rx_queue_size: DEFAULT_QUEUE_SIZE,
            },
        })
    }
}

fn check_magic_prefix_and_version(msg: &[u8]) -> YogiResult<()> {
    if msg.len() < ADVERTISING_MESSAGE_SIZE || &msg[0..5] != b"YOGI\0" {
        return Err(YogiError::InvalidMagicPrefix);
    }
    if msg[5] != VERSION_MAJOR || msg[6] != VERSION_MINOR {
        return Err(YogiError::IncompatibleVersion);
    }
    Ok(())
}

fn make_advertising_message(fields: &BranchFields) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ADVERTISING_MESSAGE_SIZE);
    buf.extend_from_slice(b"YOGI\0");
    buf.push(VERSION_MAJOR);
    buf.push(VERSION_MINOR);
    serialize_uuid(&mut buf, &fields.uuid);
    serialize_u16(&mut buf, fields.tcp_endpoint.port());
    debug_assert_eq!(buf.len(), ADVERTISING_MESSAGE_SIZE);
    buf
}

fn make_info_message(adv_msg: &[u8], fields: &BranchFields) -> Vec<u8> {
    let mut body = Vec::new();
    serialize_string(&mut body, &fields.name);
    serialize_string(&mut body, &fields.description);
    serialize_string(&mut body, &fields.net_name);
    serialize_string(&mut body, &fields.path);
    serialize_string(&mut body, &fields.hostname);
    serialize_i32(&mut body, fields.pid);
    serialize_timestamp(&mut body, fields.start_time);
    serialize_duration_ns(&mut body, fields.timeout.map(|d| d.as_nanos() as i64));
    serialize_duration_ns(
        &mut body,
        fields.advertising_interval.map(|d| d.as_nanos() as i64),
    );
    body.push(fields.ghost_mode as u8);

    let mut msg = Vec::with_capacity(INFO_MESSAGE_HEADER_SIZE + body.len());
    msg.extend_from_slice(adv_msg);
    serialize_u32(&mut msg, body.len() as u32);
    debug_assert_eq!(msg.len(), INFO_MESSAGE_HEADER_SIZE);
    msg.extend_from_slice(&body);
    msg
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> LocalBranchConfig {
        LocalBranchConfig {
            name: "branch-a".to_string(),
            description: "a test branch".to_string(),
            net_name: "test-net".to_string(),
            path: "/branch-a".to_string(),
            timeout: Some(Duration::from_secs(3)),
            advertising_interval: Some(Duration::from_millis(500)),
            ghost_mode: false,
            tx_queue_size: DEFAULT_QUEUE_SIZE,
            rx_queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    #[test]
    fn advertising_message_is_exactly_25_bytes() {
        let info =
            LocalBranchInfo::new(sample_config(), "127.0.0.1:12345".parse().unwrap()).unwrap();
        assert_eq!(info.advertising_message().len(), ADVERTISING_MESSAGE_SIZE);
    }

    #[test]
    fn path_must_start_with_a_slash() {
        let mut config = sample_config();
        config.path = "branch-a".to_string();
        let addr = "127.0.0.1:12345".parse().unwrap();
        assert_eq!(
            LocalBranchInfo::new(config, addr).unwrap_err(),
            YogiError::InvalidParam
        );
    }

    #[test]
    fn info_message_round_trips_through_remote_branch_info() {
        let local =
            LocalBranchInfo::new(sample_config(), "127.0.0.1:9999".parse().unwrap()).unwrap();
        let remote_addr: IpAddr = "192.168.1.42".parse().unwrap();
        let remote =
            RemoteBranchInfo::create_from_info_message(local.info_message(), remote_addr)
                .unwrap();

        assert_eq!(remote.fields.uuid, local.fields.uuid);
        assert_eq!(remote.fields.name, local.fields.name);
        assert_eq!(remote.fields.net_name, local.fields.net_name);
        assert_eq!(remote.fields.path, local.fields.path);
        assert_eq!(remote.fields.timeout, local.fields.timeout);
        assert_eq!(remote.fields.tcp_endpoint.ip(), remote_addr);
        assert_eq!(
            remote.fields.tcp_endpoint.port(),
            local.fields.tcp_endpoint.port()
        );
    }

    #[test]
    fn invalid_magic_prefix_is_rejected() {
        let mut bad = vec![0u8; ADVERTISING_MESSAGE_SIZE];
        bad[0..5].copy_from_slice(b"NOPE\0");
        assert_eq!(
            RemoteBranchInfo::deserialize_advertising_message(&bad).unwrap_err(),
            YogiError::InvalidMagicPrefix
        );
    }

    #[test]
    fn incompatible_version_is_rejected() {
        let local =
            LocalBranchInfo::new(sample_config(), "127.0.0.1:1".parse().unwrap()).unwrap();
        let mut msg = local.advertising_message().to_vec();
        msg[5] = 0xFF;
        assert_eq!(
            RemoteBranchInfo::deserialize_advertising_message(&msg).unwrap_err(),
            YogiError::IncompatibleVersion
        );
    }
}
