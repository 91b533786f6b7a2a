//! Cluster wire protocol.
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: `[kind:1][length:4][payload:N][crc32:4]`
//!
//! Long-running ("slow") messages are marked so receivers schedule them on
//! the slow job queue; fast control messages never wait behind an index
//! build or a table scan.

use crate::error::{Error, Result};
use crate::jobs::JobManagerStatus;
use crate::query::{EntityRow, PlanDescription};
use crate::worker::WorkerInfo;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Protocol version, bumped on incompatible frame changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame kind byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Shard announces itself after connecting
    AddShard = 0x01,
    /// Shard registers one of its workers
    RegisterWorker = 0x02,
    /// Manager fans a resolved plan to a shard
    ExecuteQuery = 0x10,
    /// Shard delivers one worker's partial result
    ShardResult = 0x11,
    /// Manager cancels an execution
    CancelQuery = 0x12,
    /// Shard heartbeat with job queue status
    UpdateJobStatus = 0x20,
    /// Orderly shutdown
    Shutdown = 0x30,
    /// Protocol-level error
    Error = 0xFF,
}

impl TryFrom<u8> for MessageKind {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::AddShard),
            0x02 => Ok(Self::RegisterWorker),
            0x10 => Ok(Self::ExecuteQuery),
            0x11 => Ok(Self::ShardResult),
            0x12 => Ok(Self::CancelQuery),
            0x20 => Ok(Self::UpdateJobStatus),
            0x30 => Ok(Self::Shutdown),
            0xFF => Ok(Self::Error),
            _ => Err(Error::cluster(format!("unknown message kind: {value:#x}"))),
        }
    }
}

/// Stable error shape shipped inside results and status responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl WireError {
    /// Wire form of an engine error.
    pub fn from_error(error: &Error) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Messages exchanged between manager and shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Shard hello, sent once per connection
    AddShard {
        /// Shard name
        shard: String,
        /// Protocol version spoken by the shard
        protocol_version: u32,
    },

    /// One worker identity owned by the connecting shard
    RegisterWorker {
        /// Worker identity and partition
        info: WorkerInfo,
    },

    /// Resolved plan for every worker of the target dataset on this shard
    ExecuteQuery {
        /// Execution id
        execution: Uuid,
        /// Immutable plan template
        description: PlanDescription,
    },

    /// Partial result of one worker
    ShardResult {
        /// Execution id
        execution: Uuid,
        /// Reporting worker
        worker: String,
        /// Contained entity rows; meaningless when `error` is set
        rows: Vec<EntityRow>,
        /// Worker-level failure, failing the whole execution
        error: Option<WireError>,
    },

    /// Cancellation of an execution, best-effort
    CancelQuery {
        /// Execution id
        execution: Uuid,
    },

    /// Heartbeat with the shard's aggregated job queues
    UpdateJobStatus {
        /// Reporting shard
        shard: String,
        /// One status per job manager (shard plus each worker)
        statuses: Vec<JobManagerStatus>,
    },

    /// Orderly shutdown announcement
    Shutdown,

    /// Protocol-level error
    Error {
        /// Error payload
        error: WireError,
    },
}

impl ClusterMessage {
    /// Kind byte of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AddShard { .. } => MessageKind::AddShard,
            Self::RegisterWorker { .. } => MessageKind::RegisterWorker,
            Self::ExecuteQuery { .. } => MessageKind::ExecuteQuery,
            Self::ShardResult { .. } => MessageKind::ShardResult,
            Self::CancelQuery { .. } => MessageKind::CancelQuery,
            Self::UpdateJobStatus { .. } => MessageKind::UpdateJobStatus,
            Self::Shutdown => MessageKind::Shutdown,
            Self::Error { .. } => MessageKind::Error,
        }
    }

    /// Whether receivers must schedule this on the slow queue.
    pub fn is_slow(&self) -> bool {
        matches!(self, Self::ExecuteQuery { .. })
    }

    /// Encode into one frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::cluster(format!("serialization failed: {e}")))?;

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of kind + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode one full frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            // min: kind(1) + length(4) + crc(4)
            return Err(Error::cluster("frame too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = u32::from_le_bytes(buf[crc_offset..].try_into().expect("fixed slice"));

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::cluster(format!(
                "CRC mismatch: expected {stored_crc:x}, got {computed_crc:x}"
            )));
        }

        MessageKind::try_from(buf[0])?;
        let length = u32::from_le_bytes(buf[1..5].try_into().expect("fixed slice")) as usize;
        if buf.len() < 5 + length + 4 {
            return Err(Error::cluster("incomplete frame"));
        }

        let payload = &buf[5..5 + length];
        bincode::deserialize(payload)
            .map_err(|e| Error::cluster(format!("deserialization failed: {e}")))
    }

    /// Write one frame to an async stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame from an async stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        // kind(1) + length(4)
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;

        let length = u32::from_le_bytes(header[1..5].try_into().expect("fixed slice")) as usize;

        let mut rest = vec![0u8; length + 4];
        reader.read_exact(&mut rest).await?;

        let mut frame = Vec::with_capacity(5 + rest.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&rest);
        Self::decode(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::description::NodeDescription;
    use crate::query::ResultValue;

    #[test]
    fn test_encode_decode_round_trip() {
        let msg = ClusterMessage::AddShard {
            shard: "shard-1".into(),
            protocol_version: PROTOCOL_VERSION,
        };
        let encoded = msg.encode().unwrap();
        match ClusterMessage::decode(&encoded).unwrap() {
            ClusterMessage::AddShard {
                shard,
                protocol_version,
            } => {
                assert_eq!(shard, "shard-1");
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_crc_validation() {
        let msg = ClusterMessage::Shutdown;
        let mut encoded = msg.encode().unwrap();
        let index = encoded.len() - 5;
        encoded[index] ^= 0xFF;

        let result = ClusterMessage::decode(&encoded);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_shard_result_round_trip() {
        let msg = ClusterMessage::ShardResult {
            execution: Uuid::nil(),
            worker: "w0".into(),
            rows: vec![EntityRow {
                entity: 7,
                values: vec![ResultValue::Integer(3), ResultValue::Null],
            }],
            error: None,
        };
        let decoded = ClusterMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ClusterMessage::ShardResult { rows, error, .. } => {
                assert!(error.is_none());
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].entity, 7);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_slow_marking() {
        let execute = ClusterMessage::ExecuteQuery {
            execution: Uuid::nil(),
            description: PlanDescription {
                dataset: "d".into(),
                root: NodeDescription::Leaf,
                generate_date_aggregator: false,
            },
        };
        assert!(execute.is_slow());
        assert!(!ClusterMessage::Shutdown.is_slow());
        assert!(!ClusterMessage::CancelQuery {
            execution: Uuid::nil()
        }
        .is_slow());
    }

    #[tokio::test]
    async fn test_async_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let msg = ClusterMessage::CancelQuery {
            execution: Uuid::new_v4(),
        };
        msg.write_to(&mut client).await.unwrap();
        let received = ClusterMessage::read_from(&mut server).await.unwrap();
        assert_eq!(msg.kind(), received.kind());
    }
}
