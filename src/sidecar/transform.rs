//! Sidecar payload normalization.
//!
//! The sidecar has shipped several payload shapes over time: MCP tool
//! results wrapping a JSON text block, `{data: {notes|feeds}}` envelopes,
//! native note objects (`note_id`, `display_title`, `interact_info` with
//! string counters) and already-normalized objects. Everything here is
//! tolerant: missing fields default, unknown fields are ignored.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::models::{Author, DataSource, Post, PostStats, ProfileStats, SearchResult, UserProfile};

const EXPLORE_URL: &str = "https://www.xiaohongshu.com/explore/";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("unexpected sidecar payload: {0}")]
    Shape(String),
    #[error("sidecar payload is missing {0}")]
    Missing(&'static str),
}

static PROFILE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"xiaohongshu\.com/user/profile/([a-zA-Z0-9]+)")
        .case_insensitive(true)
        .build()
        .expect("invalid profile url regex")
});

static SHORT_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"xhslink\.com/([a-zA-Z0-9]+)")
        .case_insensitive(true)
        .build()
        .expect("invalid short link regex")
});

static EXPLORE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"xiaohongshu\.com/(?:explore|discovery/item)/([a-zA-Z0-9]+)")
        .case_insensitive(true)
        .build()
        .expect("invalid explore url regex")
});

/// User id from a profile, short-link or explore URL.
pub fn extract_user_id(url: &str) -> Option<String> {
    [&*PROFILE_URL_RE, &*SHORT_LINK_RE, &*EXPLORE_URL_RE]
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Note id from a post URL.
pub fn extract_post_id(url: &str) -> Option<String> {
    EXPLORE_URL_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            let parsed = Url::parse(url).ok()?;
            parsed
                .query_pairs()
                .find(|(key, _)| key == "noteId" || key == "note_id")
                .map(|(_, value)| value.into_owned())
        })
}

pub fn explore_url(id: &str) -> String {
    format!("{EXPLORE_URL}{id}")
}

/// Unwraps MCP `content` text blocks and `data` envelopes.
pub fn unwrap_payload(value: &Value) -> Value {
    let mut current = value.clone();
    loop {
        if let Some(text) = mcp_text(&current)
            && let Ok(inner) = serde_json::from_str::<Value>(&text)
        {
            current = inner;
            continue;
        }
        match current.get("data") {
            Some(data) if data.is_object() || data.is_array() => {
                current = data.clone();
            }
            _ => return current,
        }
    }
}

fn mcp_text(value: &Value) -> Option<String> {
    value
        .get("content")?
        .as_array()?
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
        .find_map(|block| block.get("text").and_then(Value::as_str))
        .map(str::to_string)
}

/// Plain text carried by an MCP result, if any.
pub fn payload_text(value: &Value) -> Option<String> {
    mcp_text(value).or_else(|| value.as_str().map(str::to_string))
}

/// Unwrapped payload, rejecting plain-text or scalar results.
fn structured(value: &Value, what: &str) -> Result<Value, TransformError> {
    let payload = unwrap_payload(value);
    if let Some(text) = mcp_text(&payload) {
        return Err(TransformError::Shape(format!("{what} returned text: {text}")));
    }
    if payload.is_object() || payload.is_array() {
        Ok(payload)
    } else {
        Err(TransformError::Shape(format!(
            "{what} returned {}",
            payload_text(&payload).unwrap_or_else(|| payload.to_string())
        )))
    }
}

fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn obj_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    keys.iter().find_map(|key| obj.get(*key)?.as_object())
}

/// Parses counters such as `123`, `"456"`, `"1.2万"` or `"10+"`.
pub fn parse_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => {
            let trimmed = s.trim().trim_end_matches('+').replace(',', "");
            let (digits, multiplier) = match trimmed.strip_suffix('万') {
                Some(rest) => (rest.trim().to_string(), 10_000.0),
                None => match trimmed.strip_suffix('亿') {
                    Some(rest) => (rest.trim().to_string(), 100_000_000.0),
                    None => (trimmed, 1.0),
                },
            };
            digits
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| (f * multiplier).round() as u64)
                .unwrap_or(0)
        }
        _ => 0,
    }
}

fn count_field(obj: &Map<String, Value>, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
        .map(parse_count)
        .unwrap_or(0)
}

fn timestamp_field(obj: &Map<String, Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(seconds) = obj.get("time").and_then(Value::as_i64)
        && let Some(ts) = timestamp_from_number(seconds)
    {
        return ts;
    }
    for key in ["publishedAt", "publishTime", "createTime", "published_at"] {
        match obj.get(key) {
            Some(Value::String(raw)) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                    return parsed.with_timezone(&Utc);
                }
            }
            Some(Value::Number(n)) => {
                if let Some(ts) = n.as_i64().and_then(timestamp_from_number) {
                    return ts;
                }
            }
            _ => {}
        }
    }
    now
}

/// Accepts epoch seconds or milliseconds.
fn timestamp_from_number(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    if value > 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

fn images_field(obj: &Map<String, Value>) -> Vec<String> {
    let list = ["images_list", "image_list", "images", "imageUrls"]
        .iter()
        .find_map(|key| obj.get(*key)?.as_array());
    let mut images: Vec<String> = list
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(img) => str_field(img, &["url_default", "url", "url_pre"]),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    if images.is_empty()
        && let Some(cover) = obj.get("cover")
    {
        let cover_url = match cover {
            Value::String(s) => Some(s.clone()),
            Value::Object(c) => str_field(c, &["url_default", "url"]),
            _ => None,
        };
        images.extend(cover_url);
    }
    images
}

fn author_field(obj: &Map<String, Value>) -> Author {
    if let Some(user) = obj_field(obj, &["user", "author"]) {
        return Author {
            id: str_field(user, &["user_id", "userId", "id"]).unwrap_or_default(),
            nickname: str_field(user, &["nickname", "nick_name", "name"]).unwrap_or_default(),
            avatar: str_field(user, &["avatar", "image"]),
        };
    }
    Author {
        id: str_field(obj, &["author_id", "authorId"]).unwrap_or_default(),
        nickname: str_field(obj, &["author_name", "authorName"]).unwrap_or_default(),
        avatar: str_field(obj, &["author_avatar", "authorAvatar"]),
    }
}

fn stats_field(obj: &Map<String, Value>) -> PostStats {
    if let Some(info) = obj_field(obj, &["interact_info", "interactInfo"]) {
        return PostStats {
            likes: count_field(info, &["liked_count", "likedCount"]),
            comments: count_field(info, &["comment_count", "commentCount"]),
            shares: count_field(info, &["share_count", "shareCount"]),
            collections: count_field(info, &["collected_count", "collectedCount"]),
        };
    }
    if let Some(stats) = obj_field(obj, &["stats"]) {
        return PostStats {
            likes: count_field(stats, &["likes"]),
            comments: count_field(stats, &["comments"]),
            shares: count_field(stats, &["shares"]),
            collections: count_field(stats, &["collections"]),
        };
    }
    PostStats {
        likes: count_field(obj, &["likes", "likeCount"]),
        comments: count_field(obj, &["comments", "commentCount"]),
        shares: count_field(obj, &["shares", "shareCount"]),
        collections: count_field(obj, &["collections", "collectCount"]),
    }
}

/// Builds a [`Post`] from one note object. Returns `None` without an id.
pub fn post_from_value(value: &Value, now: DateTime<Utc>) -> Option<Post> {
    let outer = value.as_object()?;
    // Feed items nest the note under `note_card` / `noteCard`.
    let note = obj_field(outer, &["note_card", "noteCard"]).unwrap_or(outer);

    let id = str_field(note, &["note_id", "noteId", "id", "postId"])
        .or_else(|| str_field(outer, &["note_id", "noteId", "id", "postId"]))?;
    let url = obj_field(note, &["share_info", "shareInfo"])
        .and_then(|share| str_field(share, &["un_share_url", "link"]))
        .or_else(|| str_field(note, &["url", "postUrl"]))
        .unwrap_or_else(|| explore_url(&id));

    Some(Post {
        title: str_field(note, &["title", "display_title", "displayTitle"]).unwrap_or_default(),
        description: str_field(note, &["desc", "content", "description"]).unwrap_or_default(),
        author: author_field(note),
        stats: stats_field(note),
        published_at: timestamp_field(note, now),
        url,
        images: images_field(note),
        id,
    })
}

fn post_list(payload: &Value) -> Option<&Vec<Value>> {
    if let Some(items) = payload.as_array() {
        return Some(items);
    }
    ["notes", "feeds", "posts", "items"]
        .iter()
        .find_map(|key| payload.get(*key)?.as_array())
}

/// Normalizes a `search_feeds` result.
pub fn search_result(keyword: &str, value: &Value, now: DateTime<Utc>) -> Result<SearchResult, TransformError> {
    let payload = structured(value, "search")?;

    let posts: Vec<Post> = post_list(&payload)
        .map(|items| items.iter().filter_map(|item| post_from_value(item, now)).collect())
        .unwrap_or_default();
    let total = payload
        .get("total")
        .or_else(|| payload.get("count"))
        .map(parse_count)
        .map(|n| n as usize)
        .filter(|n| *n >= posts.len())
        .unwrap_or(posts.len());

    Ok(SearchResult {
        keyword: keyword.to_string(),
        has_more: payload
            .get("hasMore")
            .or_else(|| payload.get("has_more"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        next_cursor: payload
            .get("nextCursor")
            .or_else(|| payload.get("cursor"))
            .and_then(Value::as_str)
            .map(str::to_string),
        total,
        posts,
        cached: false,
        source: DataSource::Live,
    })
}

/// Normalizes a `get_feed_detail` result for the post at `requested_url`.
pub fn post_detail(value: &Value, requested_url: &str, now: DateTime<Utc>) -> Result<Post, TransformError> {
    let payload = structured(value, "feed detail")?;
    let note = ["note", "note_card", "noteCard", "post"]
        .iter()
        .find_map(|key| payload.get(*key).filter(|v| v.is_object()))
        .or_else(|| post_list(&payload).and_then(|items| items.first()))
        .unwrap_or(&payload);

    let mut patched = note.clone();
    if let (Some(obj), Some(id)) = (patched.as_object_mut(), extract_post_id(requested_url)) {
        let has_id = ["note_id", "noteId", "id", "postId"]
            .iter()
            .any(|key| obj.contains_key(*key));
        if !has_id {
            obj.insert("note_id".into(), Value::String(id));
        }
    }

    let mut post = post_from_value(&patched, now).ok_or(TransformError::Missing("note id"))?;
    if post.url.starts_with(EXPLORE_URL) && !requested_url.is_empty() {
        post.url = requested_url.to_string();
    }
    Ok(post)
}

fn interaction_counts(payload: &Value) -> Option<ProfileStats> {
    let interactions = payload.get("interactions")?.as_array()?;
    let mut stats = ProfileStats::default();
    for entry in interactions {
        let Some(obj) = entry.as_object() else { continue };
        let count = count_field(obj, &["count"]);
        match obj.get("type").and_then(Value::as_str) {
            Some("follows") => stats.following = count,
            Some("fans") => stats.followers = count,
            Some("interaction") => stats.likes = count,
            _ => {}
        }
    }
    Some(stats)
}

/// Normalizes a `user_profile` result.
pub fn user_profile(value: &Value, requested_user_id: &str, now: DateTime<Utc>) -> Result<UserProfile, TransformError> {
    let payload = structured(value, "user profile")?;
    let root = payload
        .as_object()
        .ok_or_else(|| TransformError::Shape("profile is not an object".into()))?;
    let basic = obj_field(root, &["userBasicInfo", "basic_info", "basicInfo", "user"]).unwrap_or(root);

    let stats = interaction_counts(&payload).unwrap_or_else(|| match obj_field(root, &["stats"]) {
        Some(stats) => ProfileStats {
            followers: count_field(stats, &["followers"]),
            following: count_field(stats, &["following"]),
            likes: count_field(stats, &["likes"]),
        },
        None => ProfileStats {
            followers: count_field(basic, &["fans", "followerCount", "followers"]),
            following: count_field(basic, &["follows", "followingCount", "following"]),
            likes: count_field(basic, &["interaction", "likeCount", "likes"]),
        },
    });

    let posts = post_list(&payload)
        .map(|items| items.iter().filter_map(|item| post_from_value(item, now)).collect())
        .unwrap_or_default();

    Ok(UserProfile {
        user_id: str_field(basic, &["user_id", "userId", "id", "red_id", "redId"])
            .or_else(|| str_field(root, &["user_id", "userId", "id"]))
            .unwrap_or_else(|| requested_user_id.to_string()),
        nickname: str_field(basic, &["nickname", "nick_name", "name"]).unwrap_or_default(),
        description: str_field(basic, &["desc", "description", "bio"]).unwrap_or_default(),
        avatar: str_field(basic, &["avatar", "imageb", "images", "avatarUrl"]),
        stats,
        posts,
    })
}
