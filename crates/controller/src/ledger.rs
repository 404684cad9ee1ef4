//! Version ledger: the durable `VersionCache` plus an overlay of writes that did not
//! reach storage, so a failed write still counts for the rest of this process.

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use steward_persist::VersionCache;
use tracing::warn;

pub struct VersionLedger {
    durable: Box<dyn VersionCache>,
    /// uid -> version, or `None` for a forget that did not reach storage.
    pending: FxHashMap<String, Option<String>>,
    /// uid -> version produced by our own finalizer write, not recorded but not a change either.
    own_writes: FxHashMap<String, String>,
}

impl VersionLedger {
    pub fn new(durable: Box<dyn VersionCache>) -> Self {
        Self { durable, pending: FxHashMap::default(), own_writes: FxHashMap::default() }
    }

    /// Last recorded version for `uid`. A read failure is logged and reads as never seen.
    pub fn get(&self, uid: &str) -> Option<String> {
        if let Some(v) = self.pending.get(uid) {
            return v.clone();
        }
        match self.durable.get(uid) {
            Ok(v) => v,
            Err(e) => {
                warn!(uid = %uid, error = %e, "version cache read failed; treating as unseen");
                None
            }
        }
    }

    pub fn put(&mut self, uid: &str, resource_version: &str) {
        let started = std::time::Instant::now();
        match self.durable.put(uid, resource_version) {
            Ok(()) => {
                self.pending.remove(uid);
            }
            Err(e) => {
                counter!("steward_cache_write_errors_total", 1u64);
                warn!(uid = %uid, rv = %resource_version, error = %e, "version cache write failed; keeping in memory");
                self.pending.insert(uid.to_string(), Some(resource_version.to_string()));
            }
        }
        histogram!("steward_cache_put_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn forget(&mut self, uid: &str) {
        self.own_writes.remove(uid);
        match self.durable.remove(uid) {
            Ok(()) => {
                self.pending.remove(uid);
            }
            Err(e) => {
                counter!("steward_cache_write_errors_total", 1u64);
                warn!(uid = %uid, error = %e, "version cache delete failed; keeping tombstone in memory");
                self.pending.insert(uid.to_string(), None);
            }
        }
    }

    /// Remember that `resource_version` of `uid` came from our own write; its echo is a no-op.
    /// Kept in memory only, and only the latest per uid.
    pub fn note_own_write(&mut self, uid: &str, resource_version: &str) {
        self.own_writes.insert(uid.to_string(), resource_version.to_string());
    }

    /// True once for the echo of a noted own write.
    pub fn take_own_write(&mut self, uid: &str, resource_version: &str) -> bool {
        match self.own_writes.get(uid) {
            Some(v) if v == resource_version => {
                self.own_writes.remove(uid);
                true
            }
            _ => false,
        }
    }

    /// Every uid the ledger currently considers recorded.
    pub fn uids(&self) -> anyhow::Result<Vec<String>> {
        let mut out: Vec<String> = self
            .durable
            .entries()?
            .into_iter()
            .map(|e| e.uid)
            .filter(|uid| !matches!(self.pending.get(uid), Some(None)))
            .collect();
        for (uid, v) in self.pending.iter() {
            if v.is_some() && !out.contains(uid) {
                out.push(uid.clone());
            }
        }
        Ok(out)
    }

    /// Writes held only in memory.
    pub fn pending(&self) -> usize { self.pending.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use steward_persist::{CacheEntry, MemoryVersionCache};

    /// Memory cache whose writes can be switched off.
    struct Flaky {
        inner: MemoryVersionCache,
        broken: Arc<AtomicBool>,
    }

    impl VersionCache for Flaky {
        fn get(&self, uid: &str) -> anyhow::Result<Option<String>> { self.inner.get(uid) }
        fn put(&self, uid: &str, rv: &str) -> anyhow::Result<()> {
            if self.broken.load(Ordering::SeqCst) { return Err(anyhow!("disk full")); }
            self.inner.put(uid, rv)
        }
        fn remove(&self, uid: &str) -> anyhow::Result<()> {
            if self.broken.load(Ordering::SeqCst) { return Err(anyhow!("disk full")); }
            self.inner.remove(uid)
        }
        fn entries(&self) -> anyhow::Result<Vec<CacheEntry>> { self.inner.entries() }
        fn clear(&self) -> anyhow::Result<usize> { self.inner.clear() }
    }

    fn flaky() -> (VersionLedger, Arc<AtomicBool>) {
        let broken = Arc::new(AtomicBool::new(false));
        let ledger = VersionLedger::new(Box::new(Flaky { inner: MemoryVersionCache::new(), broken: broken.clone() }));
        (ledger, broken)
    }

    #[test]
    fn failed_write_is_still_visible() {
        let (mut ledger, broken) = flaky();
        broken.store(true, Ordering::SeqCst);
        ledger.put("abc123", "v1");
        assert_eq!(ledger.get("abc123").as_deref(), Some("v1"));
        assert_eq!(ledger.pending(), 1);
        // storage recovers: the next successful write clears the overlay
        broken.store(false, Ordering::SeqCst);
        ledger.put("abc123", "v2");
        assert_eq!(ledger.pending(), 0);
        assert_eq!(ledger.get("abc123").as_deref(), Some("v2"));
    }

    #[test]
    fn failed_forget_leaves_tombstone() {
        let (mut ledger, broken) = flaky();
        ledger.put("abc123", "v1");
        broken.store(true, Ordering::SeqCst);
        ledger.forget("abc123");
        assert_eq!(ledger.get("abc123"), None);
        assert!(ledger.uids().unwrap().is_empty());
    }

    #[test]
    fn uids_merge_overlay() {
        let (mut ledger, broken) = flaky();
        ledger.put("a", "1");
        broken.store(true, Ordering::SeqCst);
        ledger.put("b", "2");
        let mut uids = ledger.uids().unwrap();
        uids.sort();
        assert_eq!(uids, vec!["a", "b"]);
    }

    #[test]
    fn own_write_matches_once() {
        let (mut ledger, _) = flaky();
        ledger.note_own_write("abc123", "11");
        assert!(!ledger.take_own_write("abc123", "12"));
        assert!(ledger.take_own_write("abc123", "11"));
        assert!(!ledger.take_own_write("abc123", "11"));
        ledger.note_own_write("abc123", "11");
        ledger.forget("abc123");
        assert!(!ledger.take_own_write("abc123", "11"));
    }
}
