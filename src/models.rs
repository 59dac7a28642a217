//! Normalized domain objects returned to callers.
//!
//! These shapes are independent of the sidecar's wire format and are only
//! built by the transform step or the fallback generator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PostStats {
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub collections: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub title: String,
    pub description: String,
    pub author: Author,
    pub stats: PostStats,
    pub published_at: DateTime<Utc>,
    pub url: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfileStats {
    pub followers: u64,
    pub following: u64,
    pub likes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub nickname: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub stats: ProfileStats,
    #[serde(default)]
    pub posts: Vec<Post>,
}

/// Where a result came from. Fallback data is synthetic and non-authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Cache,
    Fallback,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataSource::Live => "live",
            DataSource::Cache => "cache",
            DataSource::Fallback => "fallback",
        })
    }
}

/// Value tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fetched<T> {
    pub data: T,
    pub source: DataSource,
}

impl<T> Fetched<T> {
    pub fn new(data: T, source: DataSource) -> Self {
        Self { data, source }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == DataSource::Fallback
    }

    pub fn is_cached(&self) -> bool {
        self.source == DataSource::Cache
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub keyword: String,
    pub posts: Vec<Post>,
    pub total: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub cached: bool,
    pub source: DataSource,
}

impl SearchResult {
    pub fn is_fallback(&self) -> bool {
        self.source == DataSource::Fallback
    }

    /// Copy marked as served from cache.
    pub(crate) fn as_cached(&self) -> Self {
        Self {
            cached: true,
            source: DataSource::Cache,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Popular,
    Latest,
}

impl SortBy {
    pub fn as_str(self) -> &'static str {
        match self {
            SortBy::Popular => "popular",
            SortBy::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    pub limit: usize,
    pub sort_by: SortBy,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            sort_by: SortBy::Popular,
        }
    }
}

impl SearchOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// Post with its weighted engagement score (0-100).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingPost {
    pub post: Post,
    pub trending_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub url: String,
    pub error: String,
}

/// Batch result. Partial failures are listed next to the successful posts.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct BatchOutcome {
    pub posts: Vec<Fetched<Post>>,
    pub failures: Vec<BatchFailure>,
}

const LIKE_WEIGHT: f64 = 0.4;
const COMMENT_WEIGHT: f64 = 0.3;
const COLLECTION_WEIGHT: f64 = 0.2;
const SHARE_WEIGHT: f64 = 0.1;

/// Scores `posts` against the batch maxima and returns the top `limit`,
/// highest score first.
pub fn rank_trending(posts: Vec<Post>, limit: usize) -> Vec<TrendingPost> {
    let max = posts.iter().fold(PostStats::default(), |acc, post| PostStats {
        likes: acc.likes.max(post.stats.likes),
        comments: acc.comments.max(post.stats.comments),
        shares: acc.shares.max(post.stats.shares),
        collections: acc.collections.max(post.stats.collections),
    });
    let ratio = |value: u64, max: u64| if max == 0 { 0.0 } else { value as f64 / max as f64 };

    let mut ranked: Vec<TrendingPost> = posts
        .into_iter()
        .map(|post| {
            let raw = ratio(post.stats.likes, max.likes) * LIKE_WEIGHT
                + ratio(post.stats.comments, max.comments) * COMMENT_WEIGHT
                + ratio(post.stats.collections, max.collections) * COLLECTION_WEIGHT
                + ratio(post.stats.shares, max.shares) * SHARE_WEIGHT;
            TrendingPost {
                trending_score: (raw * 100.0 * 100.0).round() / 100.0,
                post,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.trending_score.total_cmp(&a.trending_score));
    ranked.truncate(limit);
    ranked
}
