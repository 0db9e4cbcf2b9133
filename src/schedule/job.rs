//! Scheduled jobs and the collaborator traits the dispatcher drives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UpstreamError;

/// A "send later" post waiting for its due time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    /// The account that scheduled the post.
    pub owner_id: String,
    pub due_at: DateTime<Utc>,
    pub payload: PostPayload,
}

/// What gets posted upstream when a job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostPayload {
    pub text: String,
    #[serde(default)]
    pub langs: Vec<String>,
    /// URI of the post being replied to, if any.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Protocol-specific embed record, passed through opaquely.
    #[serde(default)]
    pub embed: Option<serde_json::Value>,
}

impl PostPayload {
    /// A plain text post.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            langs: Vec::new(),
            reply_to: None,
            embed: None,
        }
    }
}

/// The account a job posts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub handle: String,
}

/// Upstream identifiers of a successfully created post.
#[derive(Debug, Clone)]
pub struct PostReceipt {
    pub uri: String,
    pub cid: String,
}

/// Source of scheduled jobs, backed by the host application's store.
///
/// The dispatcher holds no persistent state of its own; everything durable
/// lives behind this trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All jobs with `due_at <= now`.
    async fn due_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledJob>>;

    /// Remove a job permanently.
    async fn delete_job(&self, id: Uuid) -> anyhow::Result<()>;

    /// Resolve a job's owning account, or `None` if it no longer exists.
    async fn resolve_owner(&self, owner_id: &str) -> anyhow::Result<Option<Owner>>;
}

/// Sends a post upstream on behalf of an owner.
///
/// Implementations are expected to route through
/// [`RequestGovernor::execute`](crate::govern::RequestGovernor::execute)
/// under [`Category::Write`](crate::config::Category::Write), so scheduled
/// dispatch shares the same rate budget as interactive posting.
#[async_trait]
pub trait PostSender: Send + Sync {
    async fn send_post(
        &self,
        owner: &Owner,
        payload: &PostPayload,
    ) -> Result<PostReceipt, UpstreamError>;
}
