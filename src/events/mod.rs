/// Outbound firehose events
///
/// The indexer normalizes every handled repository event into a commit
/// envelope and hands it to the event manager, which fans it out to all
/// connected subscribers over a broadcast channel.
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Normalized commit envelope broadcast on the firehose
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    /// DID of the repository
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    /// CAR slice of the commit; nulled out when too_big
    pub blocks: Option<Vec<u8>>,
    pub rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    /// CID of the new head commit
    pub commit: String,
    /// ISO-8601 emission time
    pub time: String,
    /// Record ops; nulled out when too_big
    pub ops: Option<Vec<CommitEventOp>>,
    pub too_big: bool,
}

/// Operation within an emitted commit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEventOp {
    /// collection/rkey
    pub path: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// Broadcast fan-out for the outbound firehose
pub struct EventManager {
    tx: broadcast::Sender<CommitEvent>,
}

impl EventManager {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Push an event to all subscribers. An empty subscriber set is not an
    /// error; the event is simply dropped.
    pub fn add_event(&self, evt: CommitEvent) -> RelayResult<()> {
        let disposition = if evt.too_big { "too_big" } else { "ok" };
        crate::metrics::FIREHOSE_EVENTS_TOTAL
            .with_label_values(&[disposition])
            .inc();

        match self.tx.send(evt) {
            Ok(_) | Err(broadcast::error::SendError(_)) => Ok(()),
        }
    }

    /// Subscribe to the firehose from the current position.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitEvent> {
        self.tx.subscribe()
    }

    /// Encode an event for the wire.
    pub fn encode(evt: &CommitEvent) -> RelayResult<Vec<u8>> {
        serde_cbor::to_vec(evt)
            .map_err(|e| RelayError::Internal(format!("failed to encode commit event: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> CommitEvent {
        CommitEvent {
            repo: "did:plc:abc".into(),
            prev: None,
            blocks: Some(vec![1, 2, 3]),
            rev: "r1".into(),
            since: Some("r0".into()),
            commit: "bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454".into(),
            time: "2024-01-01T00:00:00Z".into(),
            ops: Some(vec![CommitEventOp {
                path: "app.bsky.feed.post/3k1".into(),
                action: "create".into(),
                cid: None,
            }]),
            too_big: false,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();

        manager.add_event(sample_event()).unwrap();

        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.repo, "did:plc:abc");
        assert_eq!(evt.rev, "r1");
    }

    #[tokio::test]
    async fn test_add_event_without_subscribers() {
        let manager = EventManager::new(16);
        assert!(manager.add_event(sample_event()).is_ok());
    }

    #[test]
    fn test_encode_roundtrip() {
        let evt = sample_event();
        let bytes = EventManager::encode(&evt).unwrap();
        let decoded: CommitEvent = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded.commit, evt.commit);
        assert!(!decoded.too_big);
    }
}
