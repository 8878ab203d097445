//! Attachment cache
//!
//! Images pulled out of a request are parked here so a tool call can fetch them
//! later by their request-scoped id `{request_id}#{n}`. Payloads are validated
//! once on the way in. Entries expire after a TTL and the least recently used
//! entry is evicted at capacity.

use crate::protocol::{ContentBlock, ImageSource};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Attachment cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentCacheConfig {
    /// Maximum number of entries
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Entry lifetime in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

fn default_capacity() -> usize { 100 }
fn default_ttl() -> u64 { 300 }

impl Default for AttachmentCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_secs: default_ttl(),
        }
    }
}

/// How the payload data is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentEncoding {
    Base64,
    Url,
}

/// A cached image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub data: String,
    pub media_type: String,
    pub encoding: AttachmentEncoding,
}

impl AttachmentPayload {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            media_type: media_type.into(),
            encoding: AttachmentEncoding::Base64,
        }
    }

    pub fn from_source(source: &ImageSource) -> Self {
        match source {
            ImageSource::Base64 { media_type, data } => Self::base64(media_type, data),
            ImageSource::Url { url } => Self {
                data: url.clone(),
                media_type: String::new(),
                encoding: AttachmentEncoding::Url,
            },
        }
    }

    /// Image block suitable for a tool result
    pub fn to_image_block(&self) -> ContentBlock {
        let source = match self.encoding {
            AttachmentEncoding::Base64 => ImageSource::Base64 {
                media_type: self.media_type.clone(),
                data: self.data.clone(),
            },
            AttachmentEncoding::Url => ImageSource::Url {
                url: self.data.clone(),
            },
        };
        ContentBlock::Image { source }
    }

    fn is_well_formed(&self) -> bool {
        match self.encoding {
            AttachmentEncoding::Base64 => STANDARD.decode(self.data.as_bytes()).is_ok(),
            AttachmentEncoding::Url => !self.data.is_empty(),
        }
    }
}

/// Attachment cache errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("attachment '{id}' is not valid base64")]
    InvalidBase64 { id: String },

    #[error("attachment '{id}' has an empty payload")]
    Empty { id: String },
}

/// Result of [`AttachmentCache::store`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    AlreadyPresent,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired_evictions: u64,
}

#[derive(Debug)]
struct CacheEntry {
    payload: AttachmentPayload,
    inserted_at: Instant,
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    stats: AttachmentCacheStats,
}

/// Bounded, TTL-limited image store
#[derive(Debug)]
pub struct AttachmentCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
}

impl Default for AttachmentCache {
    fn default() -> Self {
        Self::new(AttachmentCacheConfig::default())
    }
}

impl AttachmentCache {
    pub fn new(config: AttachmentCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                stats: AttachmentCacheStats::default(),
            }),
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    /// Store `payload` under `id` unless a live entry already exists
    pub fn store(
        &self,
        id: impl Into<String>,
        payload: AttachmentPayload,
    ) -> Result<StoreOutcome, AttachmentError> {
        let id = id.into();
        if payload.data.is_empty() {
            return Err(AttachmentError::Empty { id });
        }
        if !payload.is_well_formed() {
            return Err(AttachmentError::InvalidBase64 { id });
        }

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.peek(&id) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(StoreOutcome::AlreadyPresent);
            }
        }

        inner.entries.put(
            id,
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
            },
        );
        Ok(StoreOutcome::Inserted)
    }

    /// Fetch a live payload
    pub fn get(&self, id: &str) -> Option<AttachmentPayload> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let live = inner
            .entries
            .get(id)
            .map(|entry| (entry.inserted_at.elapsed() < self.ttl).then(|| entry.payload.clone()));

        match live {
            Some(Some(payload)) => {
                inner.stats.hits += 1;
                Some(payload)
            }
            Some(None) => {
                inner.entries.pop(id);
                tracing::debug!(id, "attachment expired");
                inner.stats.expired_evictions += 1;
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Image `n` of request `request_id`
    pub fn lookup(&self, request_id: &str, n: usize) -> Option<AttachmentPayload> {
        self.get(&scoped_id(request_id, n))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn stats(&self) -> AttachmentCacheStats {
        self.inner.lock().stats
    }
}

/// `{request_id}#{n}`
pub fn scoped_id(request_id: &str, n: usize) -> String {
    format!("{}#{}", request_id, n)
}

/// Split an image id into its request and image number.
///
/// Accepts `{request_id}#{n}`, or `#{n}` / `{n}` with no request part.
pub fn parse_image_id(image_id: &str) -> Option<(Option<&str>, usize)> {
    let image_id = image_id.trim();
    let (request_id, n) = match image_id.rsplit_once('#') {
        Some((request_id, n)) => (Some(request_id).filter(|r| !r.is_empty()), n),
        None => (None, image_id),
    };
    n.parse().ok().map(|n| (request_id, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn png() -> AttachmentPayload {
        AttachmentPayload::base64("image/png", "iVBORw0KGgo=")
    }

    #[test]
    fn test_store_is_idempotent() {
        let cache = AttachmentCache::default();
        assert_eq!(cache.store("r#1", png()).unwrap(), StoreOutcome::Inserted);

        let other = AttachmentPayload::base64("image/jpeg", "AAAA");
        assert_eq!(cache.store("r#1", other).unwrap(), StoreOutcome::AlreadyPresent);
        assert_eq!(cache.get("r#1").unwrap(), png());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let cache = AttachmentCache::default();
        let bad = AttachmentPayload::base64("image/png", "not base64!!");
        assert!(matches!(
            cache.store("r#1", bad),
            Err(AttachmentError::InvalidBase64 { .. })
        ));
        assert!(cache.get("r#1").is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = AttachmentCache::new(AttachmentCacheConfig {
            capacity: 2,
            ttl_secs: 300,
        });
        cache.store("a", png()).unwrap();
        cache.store("b", png()).unwrap();
        assert!(cache.get("a").is_some());
        cache.store("c", png()).unwrap();

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = AttachmentCache::new(AttachmentCacheConfig {
            capacity: 10,
            ttl_secs: 0,
        });
        cache.store("a", png()).unwrap();
        thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().expired_evictions, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lookup_is_request_scoped() {
        let cache = AttachmentCache::default();
        let jpeg = AttachmentPayload::base64("image/jpeg", "AAAA");
        cache.store(scoped_id("req", 1), jpeg.clone()).unwrap();
        cache.store(scoped_id("other", 1), png()).unwrap();

        assert_eq!(cache.lookup("req", 1).unwrap(), jpeg);
        assert_eq!(cache.lookup("other", 1).unwrap(), png());
        assert!(cache.lookup("req", 2).is_none());
        assert!(cache.get("#1").is_none());
    }

    #[test]
    fn test_parse_image_id() {
        assert_eq!(parse_image_id("req-1#3"), Some((Some("req-1"), 3)));
        assert_eq!(parse_image_id(" #2 "), Some((None, 2)));
        assert_eq!(parse_image_id("7"), Some((None, 7)));
        assert_eq!(parse_image_id("req#x"), None);
        assert_eq!(parse_image_id(""), None);
    }

    #[test]
    fn test_clear() {
        let cache = AttachmentCache::default();
        cache.store("a", png()).unwrap();
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_image_block_round_trip() {
        let source = ImageSource::Url {
            url: "https://example.com/cat.png".into(),
        };
        let payload = AttachmentPayload::from_source(&source);
        assert_eq!(payload.to_image_block(), ContentBlock::Image { source });
    }
}
