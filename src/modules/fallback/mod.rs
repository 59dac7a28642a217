//! Synthetic placeholder data served when the live path is unavailable.
//!
//! Everything is seeded from the request itself, so the same query always
//! yields the same item count, ids and stats. Results are tagged
//! [`DataSource::Fallback`] and must never reach the result cache.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{Author, DataSource, Post, PostStats, ProfileStats, SearchResult, UserProfile};
use crate::modules::cache::normalize;
use crate::modules::clock::Clock;
use crate::sidecar::transform::{explore_url, extract_post_id};

/// Upper bound on synthetic posts per search.
pub const MAX_FALLBACK_POSTS: usize = 5;

const FALLBACK_NOTICE: &str = "Placeholder generated while live data is unavailable.";

#[derive(Clone)]
pub struct FallbackGenerator {
    clock: Arc<dyn Clock>,
}

impl FallbackGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn rng(parts: &[&str]) -> StdRng {
        let mut hasher = DefaultHasher::new();
        parts.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }

    fn post_stats(rng: &mut StdRng) -> PostStats {
        PostStats {
            likes: rng.gen_range(100..1_100),
            collections: rng.gen_range(50..550),
            comments: rng.gen_range(20..220),
            shares: rng.gen_range(10..110),
        }
    }

    /// `min(limit, 5)` posts with ids `mock_<keyword>_<n>`, keyed by the
    /// same normalized keyword as the search cache.
    pub fn posts(&self, keyword: &str, limit: usize) -> Vec<Post> {
        let count = limit.min(MAX_FALLBACK_POSTS);
        let normalized = normalize(keyword);
        let mut rng = Self::rng(&["search", &normalized, &count.to_string()]);
        let now = self.clock.now();
        (0..count)
            .map(|index| {
                let id = format!("mock_{normalized}_{index}");
                Post {
                    title: format!("{keyword} 精选笔记 {}", index + 1),
                    description: FALLBACK_NOTICE.to_string(),
                    author: Author {
                        id: format!("mock_author_{index}"),
                        nickname: format!("用户{}", index + 1),
                        avatar: None,
                    },
                    stats: Self::post_stats(&mut rng),
                    published_at: now - ChronoDuration::days(index as i64),
                    url: explore_url(&id),
                    images: Vec::new(),
                    id,
                }
            })
            .collect()
    }

    pub fn search_result(&self, keyword: &str, limit: usize) -> SearchResult {
        let posts = self.posts(keyword, limit);
        SearchResult {
            keyword: keyword.to_string(),
            total: posts.len(),
            posts,
            has_more: false,
            next_cursor: None,
            cached: false,
            source: DataSource::Fallback,
        }
    }

    /// A single post for `url`, keeping the note id when the URL carries one.
    pub fn post(&self, url: &str) -> Post {
        let mut rng = Self::rng(&["post", url]);
        let id = extract_post_id(url).unwrap_or_else(|| format!("mock_{:016x}", rng.r#gen::<u64>()));
        Post {
            title: format!("笔记 {id}"),
            description: FALLBACK_NOTICE.to_string(),
            author: Author {
                id: "mock_author".into(),
                nickname: "未知用户".into(),
                avatar: None,
            },
            stats: Self::post_stats(&mut rng),
            published_at: self.clock.now(),
            url: url.to_string(),
            images: Vec::new(),
            id,
        }
    }

    pub fn profile(&self, user_id: &str) -> UserProfile {
        let mut rng = Self::rng(&["profile", user_id]);
        UserProfile {
            user_id: user_id.to_string(),
            nickname: format!("用户{}", user_id.chars().take(6).collect::<String>()),
            description: FALLBACK_NOTICE.to_string(),
            avatar: None,
            stats: ProfileStats {
                following: rng.gen_range(100..1_100),
                followers: rng.gen_range(500..5_500),
                likes: rng.gen_range(1_000..11_000),
            },
            posts: Vec::new(),
        }
    }
}
