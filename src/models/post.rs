use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A post as seen by one user: the stored row plus whether that user likes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPost {
    pub id: i64,
    pub title: Option<String>,
    pub content: String,
    pub likes_count: i64,
    pub comments_count: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub is_liked: bool,
}

/// How `toggle_like` derives the new `likes_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikeCounter {
    /// Adds the delta to the counter value the caller read. Two toggles made
    /// from the same stale row will drift the counter.
    Caller,
    /// Adds the delta to the stored counter inside the write transaction.
    #[default]
    Stored,
    /// Sets the counter to the number of like rows for the post.
    Recount,
}

impl LikeCounter {
    pub fn label(&self) -> &'static str {
        match self {
            LikeCounter::Caller => "caller",
            LikeCounter::Stored => "stored",
            LikeCounter::Recount => "recount",
        }
    }
}
