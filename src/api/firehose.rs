/// Outbound firehose WebSocket endpoint
///
/// Implements com.atproto.sync.subscribeRepos for downstream subscribers.
/// Each frame is a CBOR header { op: 1, t: "#commit" } followed by the
/// CBOR-encoded commit envelope.
use crate::{context::AppContext, error::RelayResult, events::CommitEvent, events::EventManager};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde_cbor::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub async fn subscribe_repos(
    State(ctx): State<AppContext>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, ctx))
}

async fn stream_events(mut socket: WebSocket, ctx: AppContext) {
    info!("firehose subscriber connected");
    let mut rx = ctx.events.subscribe();

    loop {
        match rx.recv().await {
            Ok(evt) => {
                let frame = match encode_frame(&evt) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "failed to encode firehose frame");
                        continue;
                    }
                };

                if socket.send(Message::Binary(frame)).await.is_err() {
                    debug!("firehose subscriber disconnected");
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "firehose subscriber lagged, events dropped");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn encode_frame(evt: &CommitEvent) -> RelayResult<Vec<u8>> {
    let mut header = BTreeMap::new();
    header.insert(Value::Text("op".to_string()), Value::Integer(1));
    header.insert(Value::Text("t".to_string()), Value::Text("#commit".to_string()));

    let mut frame = serde_cbor::to_vec(&Value::Map(header)).map_err(|e| {
        crate::error::RelayError::Internal(format!("failed to encode frame header: {}", e))
    })?;
    frame.extend(EventManager::encode(evt)?);

    Ok(frame)
}

pub fn routes() -> Router<AppContext> {
    Router::new().route("/xrpc/com.atproto.sync.subscribeRepos", get(subscribe_repos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_prefixes_header() {
        let evt = CommitEvent {
            repo: "did:plc:abc".into(),
            prev: None,
            blocks: Some(vec![]),
            rev: "r1".into(),
            since: None,
            commit: "bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454".into(),
            time: "2024-01-01T00:00:00Z".into(),
            ops: Some(vec![]),
            too_big: false,
        };

        let frame = encode_frame(&evt).unwrap();

        let mut de = serde_cbor::Deserializer::from_slice(&frame);
        let header: Value = serde::Deserialize::deserialize(&mut de).unwrap();
        match header {
            Value::Map(map) => {
                assert_eq!(
                    map.get(&Value::Text("t".into())),
                    Some(&Value::Text("#commit".into()))
                );
            }
            other => panic!("header not a map: {:?}", other),
        }
    }
}
