//! Bounded ring of recently dispatched messages.
//!
//! Size policy matches the reference implementation's `cache_size`
//! convention: negative disables the cache entirely, zero means unbounded,
//! positive bounds it with FIFO eviction.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// One recorded frame. `was_dispatched` distinguishes a command that found a
/// handler or waiter from one that fell through to `NoHandler`; nothing in
/// the public API reads it back today (see DESIGN.md), but it's kept for
/// parity with the source's `MessageCacheMember` shape.
#[derive(Debug, Clone)]
pub struct MessageCacheEntry {
    pub header: Vec<u8>,
    pub content: Vec<u8>,
    pub was_dispatched: bool,
    pub command: String,
}

pub struct MessageCache {
    limit: i64,
    entries: Mutex<VecDeque<MessageCacheEntry>>,
}

impl MessageCache {
    pub fn new(limit: i64) -> Self {
        MessageCache {
            limit,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit >= 0
    }

    /// Append an entry and evict the oldest if the cache is bounded and full.
    /// A no-op when the cache is disabled.
    pub fn record(&self, header: Vec<u8>, content: Vec<u8>, command: String, was_dispatched: bool) {
        if !self.enabled() {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push_back(MessageCacheEntry {
            header,
            content,
            was_dispatched,
            command,
        });
        if self.limit > 0 {
            while entries.len() as i64 > self.limit {
                entries.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<MessageCacheEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(command: &str) -> (Vec<u8>, Vec<u8>, String) {
        (vec![0; 16], command.as_bytes().to_vec(), command.to_string())
    }

    #[test]
    fn negative_limit_disables_caching() {
        let cache = MessageCache::new(-1);
        let (h, c, cmd) = entry("ping");
        cache.record(h, c, cmd, true);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let cache = MessageCache::new(0);
        for i in 0..50 {
            let (h, c, cmd) = entry(&format!("cmd{i}"));
            cache.record(h, c, cmd, true);
        }
        assert_eq!(cache.len(), 50);
    }

    #[test]
    fn positive_limit_evicts_oldest_first() {
        let cache = MessageCache::new(2);
        let (h1, c1, cmd1) = entry("one");
        let (h2, c2, cmd2) = entry("two");
        let (h3, c3, cmd3) = entry("three");
        cache.record(h1, c1, cmd1, true);
        cache.record(h2, c2, cmd2, true);
        cache.record(h3, c3, cmd3, false);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].command, "two");
        assert_eq!(snapshot[1].command, "three");
    }
}
