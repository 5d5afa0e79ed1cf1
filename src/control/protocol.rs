//! Wire format for control-plane messages.
//!
//! All master/agent traffic is length-prefixed (4-byte LE) JSON frames over
//! TCP. Requests and responses are explicitly tagged sum types; the
//! reconfiguration stream carries `ReconfigureEvent` frames.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed message frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// One host line of the hostfile: address, local device count, agent port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub ip: String,
    pub devices: usize,
    pub port: u16,
}

/// The authoritative cluster membership. `epoch` increments on every
/// membership change; the rendezvous port is only valid within its epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistInfo {
    pub epoch: u64,
    pub hosts: Vec<HostInfo>,
}

impl DistInfo {
    pub fn new(epoch: u64, hosts: Vec<HostInfo>) -> Self {
        Self { epoch, hosts }
    }

    pub fn world_size(&self) -> usize {
        self.hosts.iter().map(|h| h.devices).sum()
    }

    /// Global rank of device `gpu_index` on host `host_index`.
    pub fn rank_of(&self, host_index: usize, gpu_index: usize) -> usize {
        self.hosts[..host_index]
            .iter()
            .map(|h| h.devices)
            .sum::<usize>()
            + gpu_index
    }

    pub fn host_index_of(&self, ip: &str) -> Option<usize> {
        self.hosts.iter().position(|h| h.ip == ip)
    }
}

/// Training script the master distributes to agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInfo {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Hex SHA-256 digest of the script; empty when verification is off.
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port: u16,
}

/// Agent-to-master requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    #[serde(rename = "get_dist_info")]
    GetDistInfo,

    #[serde(rename = "get_code")]
    GetCode,

    #[serde(rename = "set_master_rank_port")]
    SetMasterRankPort { epoch: u64, port: u16 },

    #[serde(rename = "get_master_rank_port")]
    GetMasterRankPort,

    /// Switches the connection into push mode: the master streams a
    /// `ReconfigureEvent` frame on every membership change.
    #[serde(rename = "watch_reconfiguration")]
    WatchReconfiguration,

    #[serde(rename = "report_host_failure")]
    ReportHostFailure { ip: String },
}

/// Master-to-agent responses and stream events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    #[serde(rename = "dist_info")]
    DistInfo(DistInfo),

    #[serde(rename = "code_info")]
    CodeInfo(CodeInfo),

    #[serde(rename = "port_info")]
    PortInfo(PortInfo),

    #[serde(rename = "ack")]
    Ack,

    #[serde(rename = "reconfigure_event")]
    ReconfigureEvent(DistInfo),

    #[serde(rename = "error")]
    Error { code: u32, message: String },
}

/// Encode a message to JSON bytes, enforcing the frame cap.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a message from JSON bytes.
pub fn decode_message<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read a length-prefixed frame from an async reader.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; frame_len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
