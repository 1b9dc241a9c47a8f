/// Typed record payloads and AT-URI handling
///
/// Records arrive inside commit ops as schema-tagged DAG-CBOR maps. The
/// `$type` tag selects the variant; the indexer is a pure match on it.
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// A record decoded from a commit op, dispatched by its `$type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "$type")]
pub enum RecordPayload {
    #[serde(rename = "app.bsky.feed.post")]
    Post(PostRecord),
    #[serde(rename = "app.bsky.feed.repost")]
    Repost(RepostPayload),
    #[serde(rename = "app.bsky.feed.like")]
    Like(LikePayload),
    #[serde(rename = "app.bsky.graph.follow")]
    Follow(FollowPayload),
    #[serde(rename = "app.bsky.graph.block")]
    Block(BlockPayload),
    #[serde(rename = "app.bsky.actor.profile")]
    Profile(ProfilePayload),
    #[serde(rename = "app.bsky.graph.confirmation")]
    Confirmation(ConfirmationPayload),
}

/// Reference to a record by AT-URI and CID
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
}

/// Reply linkage on a post
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

/// An inline entity inside post text; mentions carry the referenced DID
/// in `value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepostPayload {
    pub subject: StrongRef,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LikePayload {
    pub subject: StrongRef,
    #[serde(default)]
    pub created_at: String,
}

/// Follow target is a bare DID
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowPayload {
    pub subject: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockPayload {
    pub subject: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPayload {
    #[serde(default)]
    pub originator: Option<StrongRef>,
}

impl RecordPayload {
    /// Decode a record from raw DAG-CBOR bytes.
    pub fn from_cbor(bytes: &[u8]) -> RelayResult<Self> {
        serde_cbor::from_slice(bytes)
            .map_err(|e| RelayError::UnrecognizedRecord(format!("record decode: {}", e)))
    }

    /// Decode a record from an already-parsed CBOR value.
    pub fn from_cbor_value(value: serde_cbor::Value) -> RelayResult<Self> {
        serde_cbor::value::from_value(value)
            .map_err(|e| RelayError::UnrecognizedRecord(format!("record decode: {}", e)))
    }

    /// The collection this record belongs to.
    pub fn collection(&self) -> &'static str {
        match self {
            RecordPayload::Post(_) => "app.bsky.feed.post",
            RecordPayload::Repost(_) => "app.bsky.feed.repost",
            RecordPayload::Like(_) => "app.bsky.feed.like",
            RecordPayload::Follow(_) => "app.bsky.graph.follow",
            RecordPayload::Block(_) => "app.bsky.graph.block",
            RecordPayload::Profile(_) => "app.bsky.actor.profile",
            RecordPayload::Confirmation(_) => "app.bsky.graph.confirmation",
        }
    }
}

/// A parsed at:// URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    /// Parse "at://did/collection/rkey".
    pub fn parse(uri: &str) -> RelayResult<Self> {
        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| RelayError::Validation(format!("invalid at uri: {}", uri)))?;

        let mut parts = rest.splitn(3, '/');
        let did = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();

        if did.is_empty() || collection.is_empty() || rkey.is_empty() {
            return Err(RelayError::Validation(format!("invalid at uri: {}", uri)));
        }

        Ok(Self {
            did: did.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }
}

impl std::fmt::Display for AtUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}
