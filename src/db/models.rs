/// Relay database models
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Local monotone integer id for an actor, issued by this relay.
/// The UID <-> DID mapping is 1:1 and permanent.
pub type Uid = i64;

/// Actor record. Tombstoned or taken-down actors are read-visible only
/// via listing and never serve content.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Actor {
    pub uid: Uid,
    pub did: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub pds: i64,
    pub tombstoned: bool,
    pub taken_down: bool,
}

/// A Personal Data Server this relay crawls
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Pds {
    pub id: i64,
    /// Lowercase, scheme-stripped domain
    pub host: String,
    pub ssl: bool,
    /// Crawl rate, events/sec
    pub crawl_rate_limit: f64,
    pub registered: bool,
}

/// A post row. `missing` marks a placeholder created to satisfy a forward
/// reference; `deleted` is a soft flag, the row remains for back-references.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FeedPost {
    pub id: i64,
    pub author: Uid,
    pub rkey: String,
    pub cid: String,
    pub reply_to: i64,
    pub missing: bool,
    pub deleted: bool,
    pub up_count: i64,
}

/// 'follower' followed 'target'
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FollowRecord {
    pub id: i64,
    pub follower: Uid,
    pub target: Uid,
    pub rkey: String,
    pub cid: String,
}

/// A like on a post. A post's up_count equals the count of non-deleted
/// votes referring to it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: i64,
    pub voter: Uid,
    pub post: i64,
    pub rkey: String,
    pub cid: String,
    pub created: String,
}

/// A repost of a post
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RepostRecord {
    pub id: i64,
    pub reposter: Uid,
    pub post: i64,
    pub author: Uid,
    pub rkey: String,
    pub cid: String,
    pub rec_created: String,
}

/// A recorded notification side effect
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub kind: String,
    pub recipient: Uid,
    pub source: Uid,
    pub subject: i64,
}
