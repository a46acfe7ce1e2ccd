// src/version/cache.rs

//! Interning caches for parsed and thawed versions
//!
//! Each cache maps a key to a weak handle, so an entry lives exactly as
//! long as some caller holds the version. Dead entries are dropped lazily
//! on lookup and eagerly by [`VersionCache::purge`].

use super::{ParseError, Version, VersionData};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

/// A process-wide map from version keys to live versions
#[derive(Debug, Default)]
pub struct VersionCache {
    entries: Mutex<HashMap<String, Weak<VersionData>>>,
}

impl VersionCache {
    /// Cache keyed by frozen string, used by [`Version::thaw`]
    pub fn thawed() -> &'static VersionCache {
        static THAWED: OnceLock<VersionCache> = OnceLock::new();
        THAWED.get_or_init(VersionCache::default)
    }

    /// Cache keyed by display string and timestamps, used by
    /// [`Version::parse`] and [`Version::from_string_with_timestamps`]
    pub fn parsed() -> &'static VersionCache {
        static PARSED: OnceLock<VersionCache> = OnceLock::new();
        PARSED.get_or_init(VersionCache::default)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Weak<VersionData>>> {
        // Entries are only inserted or removed whole, so a poisoned map is still valid
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live version for `key`, or build and remember one
    pub(crate) fn intern<F>(&self, key: &str, build: F) -> Result<Version, ParseError>
    where
        F: FnOnce() -> Result<Version, ParseError>,
    {
        let mut entries = self.lock();
        if let Some(inner) = entries.get(key).and_then(Weak::upgrade) {
            return Ok(Version { inner });
        }

        let version = build()?;
        entries.insert(key.to_string(), Arc::downgrade(&version.inner));
        Ok(version)
    }

    /// True when `key` maps to a version somebody still holds
    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|entry| entry.strong_count() > 0)
    }

    /// Drop a handle and forget its entry if it was the last one
    pub fn release(&self, version: Version) {
        let weak = Arc::downgrade(&version.inner);
        drop(version);
        if weak.strong_count() == 0 {
            self.lock().retain(|_, entry| !entry.ptr_eq(&weak));
        }
    }

    /// Forget every entry whose version has been dropped
    pub fn purge(&self) {
        self.lock().retain(|_, entry| entry.strong_count() > 0);
    }

    /// Number of live entries, after purging dead ones
    pub fn live_len(&self) -> usize {
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.strong_count() > 0);
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thawed_versions_are_shared() {
        let text = "/cache.test@spc:thaw/1:1.2-3/bang.com@spc:branch/2:2.4-5";
        let v1 = Version::thaw(text).unwrap();
        let v2 = Version::thaw(text).unwrap();
        assert!(Version::same_handle(&v1, &v2));
        assert!(VersionCache::thawed().contains(text));

        drop(v1);
        assert!(VersionCache::thawed().contains(text));
        drop(v2);
        assert!(!VersionCache::thawed().contains(text));
    }

    #[test]
    fn test_parsed_versions_keyed_by_timestamps() {
        let text = "/cache.test@spc:parse/1.2-3";
        let v1 = Version::parse(text).unwrap();
        let v2 = Version::from_string_with_timestamps(text, &[1.0]).unwrap();
        let v3 = Version::parse(text).unwrap();
        let v4 = Version::parse(text).unwrap();

        assert_eq!(v1.timestamps(), vec![0.0]);
        assert_eq!(v2.timestamps(), vec![1.0]);
        assert!(!Version::same_handle(&v1, &v2));
        assert!(!Version::same_handle(&v2, &v3));
        assert!(Version::same_handle(&v1, &v3));
        assert!(Version::same_handle(&v3, &v4));
    }

    #[test]
    fn test_private_cache_release_and_purge() {
        let cache = VersionCache::default();
        let key = "/cache.test@spc:private/1-1";
        let version = cache.intern(key, || Version::parse(key)).unwrap();
        let again = cache.intern(key, || Version::parse("/other@a:b")).unwrap();
        assert!(Version::same_handle(&version, &again));
        assert_eq!(cache.live_len(), 1);

        drop(again);
        assert_eq!(cache.live_len(), 1);
        cache.release(version);
        assert!(!cache.contains(key));
        assert_eq!(cache.live_len(), 0);

        let version = cache.intern(key, || Version::parse(key)).unwrap();
        drop(version);
        cache.purge();
        assert_eq!(cache.live_len(), 0);
    }
}
