//! Inbound replay suppression.
//!
//! Providers redeliver messages on reconnect; a bounded LRU keyed on
//! `(provider, peer, messageId, sessionKey)` drops replays seen within the
//! TTL. Messages without a provider message id bypass dedup entirely.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;

pub const DEDUP_TTL_MS: u64 = 60_000;
const DEDUP_CAPACITY: usize = 2048;

#[derive(Debug, Clone)]
pub struct DedupContext<'a> {
    pub provider: &'a str,
    pub peer: &'a str,
    pub message_id: Option<&'a str>,
    pub session_key: Option<&'a str>,
}

pub struct InboundDeduper {
    cache: Mutex<LruCache<String, u64>>,
    ttl_ms: u64,
}

impl InboundDeduper {
    pub fn new() -> Self {
        Self::with_settings(DEDUP_CAPACITY, DEDUP_TTL_MS)
    }

    pub fn with_settings(capacity: usize, ttl_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1024)).expect("nonzero capacity");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl_ms,
        }
    }

    /// True when this message was already seen within the TTL. First sight
    /// records the message and returns false.
    pub fn should_skip(&self, ctx: &DedupContext<'_>) -> bool {
        self.should_skip_at(ctx, now_ms())
    }

    /// Clock-injected variant for tests.
    pub fn should_skip_at(&self, ctx: &DedupContext<'_>, now_ms: u64) -> bool {
        let Some(message_id) = ctx.message_id else {
            return false;
        };

        let key = format!(
            "{}|{}|{}|{}",
            ctx.provider,
            ctx.peer,
            message_id,
            ctx.session_key.unwrap_or("")
        );

        let mut cache = self.cache.lock().expect("dedup cache poisoned");
        if let Some(seen_at) = cache.get(&key) {
            if now_ms.saturating_sub(*seen_at) < self.ttl_ms {
                return true;
            }
        }
        cache.put(key, now_ms);
        false
    }
}

impl Default for InboundDeduper {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(message_id: Option<&'a str>) -> DedupContext<'a> {
        DedupContext {
            provider: "whatsapp",
            peer: "+15555550123",
            message_id,
            session_key: Some("agent:clawd:main"),
        }
    }

    #[test]
    fn repeat_within_ttl_is_skipped() {
        let dedup = InboundDeduper::new();
        assert!(!dedup.should_skip_at(&ctx(Some("msg-1")), 1_000));
        assert!(dedup.should_skip_at(&ctx(Some("msg-1")), 11_000));
    }

    #[test]
    fn repeat_after_ttl_is_delivered_again() {
        let dedup = InboundDeduper::new();
        assert!(!dedup.should_skip_at(&ctx(Some("msg-1")), 1_000));
        assert!(!dedup.should_skip_at(&ctx(Some("msg-1")), 1_000 + DEDUP_TTL_MS));
        // And the re-sight refreshes the window.
        assert!(dedup.should_skip_at(&ctx(Some("msg-1")), 1_000 + DEDUP_TTL_MS + 10));
    }

    #[test]
    fn missing_message_id_never_suppresses() {
        let dedup = InboundDeduper::new();
        assert!(!dedup.should_skip_at(&ctx(None), 1_000));
        assert!(!dedup.should_skip_at(&ctx(None), 1_001));
    }

    #[test]
    fn different_ids_are_independent() {
        let dedup = InboundDeduper::new();
        assert!(!dedup.should_skip_at(&ctx(Some("a")), 1_000));
        assert!(!dedup.should_skip_at(&ctx(Some("b")), 1_001));
    }

    #[test]
    fn session_key_scopes_the_dedup_key() {
        let dedup = InboundDeduper::new();
        let a = DedupContext {
            session_key: Some("agent:clawd:main"),
            ..ctx(Some("msg-1"))
        };
        let b = DedupContext {
            session_key: Some("agent:clawd:global"),
            ..ctx(Some("msg-1"))
        };
        assert!(!dedup.should_skip_at(&a, 1_000));
        assert!(!dedup.should_skip_at(&b, 1_001));
        assert!(dedup.should_skip_at(&a, 1_002));
    }

    #[test]
    fn capacity_floor_is_enforced() {
        // Even a tiny requested capacity keeps room for a TTL window.
        let dedup = InboundDeduper::with_settings(8, DEDUP_TTL_MS);
        for i in 0..1024 {
            let id = format!("msg-{i}");
            let c = DedupContext {
                provider: "telegram",
                peer: "peer",
                message_id: Some(&id),
                session_key: None,
            };
            assert!(!dedup.should_skip_at(&c, 1_000 + i));
        }
        // The first entry is still tracked.
        let c = DedupContext {
            provider: "telegram",
            peer: "peer",
            message_id: Some("msg-0"),
            session_key: None,
        };
        assert!(dedup.should_skip_at(&c, 3_000));
    }
}
