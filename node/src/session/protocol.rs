//! Sync message protocol definitions.
//!
//! Every message is one JSON object in one frame, tagged by `type` and using
//! snake_case for field names.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tandem_engine::{HlcTimestamp, NodeId, Operation, SchemaVersion, VectorSummary};

/// Messages exchanged by the two sides of a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Identity and clock exchange.
    Hello {
        node_id: NodeId,
        clock: HlcTimestamp,
        schema_version: SchemaVersion,
        session_id: String,
    },

    /// Every entity the sender holds, with its version vector.
    VectorSummary { entities: VectorSummary },

    /// Entities the sender wants, each with the vector to send from.
    DeltaRequest { since: VectorSummary },

    /// Operations answering the peer's request.
    DeltaBatch {
        sequence: u32,
        operations: Vec<Operation>,
        /// Set on the sender's final batch
        last: bool,
    },

    /// Confirms application. Carries the sender's summary afterwards.
    Ack { entities: VectorSummary },

    /// Ends the session early.
    Abort { reason: String },
}

impl SyncMessage {
    /// Message kind as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Hello { .. } => "hello",
            SyncMessage::VectorSummary { .. } => "vector_summary",
            SyncMessage::DeltaRequest { .. } => "delta_request",
            SyncMessage::DeltaBatch { .. } => "delta_batch",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::Abort { .. } => "abort",
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Split operations into delta batches of at most `batch_size`.
///
/// Always yields at least one batch, so an empty delta still carries the
/// `last` flag.
pub fn into_batches(operations: Vec<Operation>, batch_size: usize) -> Vec<SyncMessage> {
    let batch_size = batch_size.max(1);
    let mut chunks: Vec<Vec<Operation>> = Vec::new();
    let mut current = Vec::with_capacity(batch_size.min(operations.len()));
    for op in operations {
        current.push(op);
        if current.len() == batch_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }

    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, operations)| SyncMessage::DeltaBatch {
            sequence: i as u32,
            operations,
            last: i + 1 == count,
        })
        .collect()
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },

    #[error("schema version mismatch: local {local}, peer {peer}")]
    SchemaMismatch {
        local: SchemaVersion,
        peer: SchemaVersion,
    },

    #[error("peer identified itself as {got}, expected {expected}")]
    WrongPeer { expected: NodeId, got: NodeId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_engine::{Mutation, VersionVector};

    fn op(n: u64) -> Operation {
        Operation::new(
            "employee",
            "employee:a.1.0",
            Mutation::Set {
                field: "jobTitle".into(),
                value: json!(format!("title {n}")),
            },
            HlcTimestamp::new(1000 + n, 0, "a"),
            n + 1,
        )
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let hello = SyncMessage::Hello {
            node_id: "laptop".into(),
            clock: HlcTimestamp::new(1000, 2, "laptop"),
            schema_version: 1,
            session_id: "s1".into(),
        };
        let value: serde_json::Value = serde_json::from_slice(&hello.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["node_id"], "laptop");
        assert_eq!(value["schema_version"], 1);

        let mut summary = VectorSummary::new();
        summary.insert("employee:a.1.0".into(), [("a".to_string(), 3)].into_iter().collect::<VersionVector>());
        let ack = SyncMessage::Ack { entities: summary };
        let decoded = SyncMessage::decode(&ack.encode().unwrap()).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.kind(), "ack");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            SyncMessage::decode(b"not json"),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            SyncMessage::decode(br#"{"type":"gossip"}"#),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_batches_flag_the_last() {
        let batches = into_batches((0..5).map(op).collect(), 2);
        assert_eq!(batches.len(), 3);

        let shape: Vec<(u32, usize, bool)> = batches
            .iter()
            .map(|msg| match msg {
                SyncMessage::DeltaBatch {
                    sequence,
                    operations,
                    last,
                } => (*sequence, operations.len(), *last),
                other => panic!("unexpected {}", other.kind()),
            })
            .collect();
        assert_eq!(shape, vec![(0, 2, false), (1, 2, false), (2, 1, true)]);
    }

    #[test]
    fn test_empty_delta_is_one_last_batch() {
        let batches = into_batches(Vec::new(), 16);
        assert_eq!(
            batches,
            vec![SyncMessage::DeltaBatch {
                sequence: 0,
                operations: Vec::new(),
                last: true,
            }]
        );
    }
}
