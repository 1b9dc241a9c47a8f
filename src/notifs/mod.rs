/// Notification side effects
///
/// The indexer emits notifications as it applies record ops. Delivery is a
/// collaborator concern; the relay records them through this trait so the
/// backend can be swapped (tests use a counting stub).
use crate::db::models::Uid;
use crate::error::RelayResult;
use async_trait::async_trait;
use sqlx::SqlitePool;

/// Notification recording backend
#[async_trait]
pub trait NotificationManager: Send + Sync {
    /// `author` replied to `replied_to_author`'s post
    async fn add_reply_to(
        &self,
        author: Uid,
        post_id: i64,
        replied_to_author: Uid,
    ) -> RelayResult<()>;

    /// `author` mentioned `mentioned` in a post
    async fn add_mention(&self, author: Uid, post_id: i64, mentioned: Uid) -> RelayResult<()>;

    /// `voter` up-voted a post by `post_author`
    async fn add_up_vote(
        &self,
        voter: Uid,
        post_id: i64,
        vote_id: i64,
        post_author: Uid,
    ) -> RelayResult<()>;

    /// `reposter` reposted a post by `post_author`
    async fn add_repost(&self, post_author: Uid, repost_id: i64, reposter: Uid) -> RelayResult<()>;

    /// `follower` followed `target`
    async fn add_follow(&self, follower: Uid, target: Uid, follow_id: i64) -> RelayResult<()>;
}

/// Database-backed notification recorder
pub struct DbNotificationManager {
    db: SqlitePool,
}

impl DbNotificationManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    async fn record(
        &self,
        kind: &str,
        recipient: Uid,
        source: Uid,
        subject: i64,
    ) -> RelayResult<()> {
        sqlx::query(
            "INSERT INTO notification (kind, recipient, source, subject) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(kind)
        .bind(recipient)
        .bind(source)
        .bind(subject)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationManager for DbNotificationManager {
    async fn add_reply_to(
        &self,
        author: Uid,
        post_id: i64,
        replied_to_author: Uid,
    ) -> RelayResult<()> {
        self.record("reply", replied_to_author, author, post_id).await
    }

    async fn add_mention(&self, author: Uid, post_id: i64, mentioned: Uid) -> RelayResult<()> {
        self.record("mention", mentioned, author, post_id).await
    }

    async fn add_up_vote(
        &self,
        voter: Uid,
        post_id: i64,
        _vote_id: i64,
        post_author: Uid,
    ) -> RelayResult<()> {
        self.record("vote", post_author, voter, post_id).await
    }

    async fn add_repost(&self, post_author: Uid, repost_id: i64, reposter: Uid) -> RelayResult<()> {
        self.record("repost", post_author, reposter, repost_id).await
    }

    async fn add_follow(&self, follower: Uid, target: Uid, follow_id: i64) -> RelayResult<()> {
        self.record("follow", target, follower, follow_id).await
    }
}
