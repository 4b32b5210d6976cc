//! Bounded source-keyed cache of built programs.
//!
//! Keys are SHA-256 digests of the generated source text, so distinct
//! source-keys producing identical text share an entry. A miss compiles
//! exactly once even under concurrency: the first caller installs an
//! in-flight marker and later callers for the same digest wait on it.
//! Entries are handed out as `Arc`s; an entry is evictable only once no
//! handout is alive, which guarantees a program outlives every kernel
//! created from it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};

use crate::api::{DeviceApi, ProgramId};
use crate::error::{GravelError, Result};
use crate::source::KernelSource;

type SourceDigest = [u8; 32];

/// Owned built program. Dropping the last handle releases the device
/// object.
pub struct ProgramHandle {
    api: Arc<dyn DeviceApi>,
    raw: ProgramId,
}

impl ProgramHandle {
    /// The wrapped program id.
    #[must_use]
    pub fn raw(&self) -> ProgramId {
        self.raw
    }
}

impl Drop for ProgramHandle {
    fn drop(&mut self) {
        if let Err(err) = self.api.release_program(self.raw) {
            tracing::warn!(program = self.raw.0, "failed to release program: {err}");
        }
    }
}

impl std::fmt::Debug for ProgramHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramHandle").field("raw", &self.raw.0).finish()
    }
}

enum Slot {
    /// A compile for this digest is in flight on some thread.
    Building,
    Ready(Entry),
}

struct Entry {
    program: Arc<ProgramHandle>,
    last_used: u64,
}

struct CacheInner {
    slots: HashMap<SourceDigest, Slot>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Bounded map from source digest to built program.
pub struct ProgramCache {
    api: Arc<dyn DeviceApi>,
    capacity: usize,
    build_options: String,
    inner: Mutex<CacheInner>,
    built: Condvar,
}

impl ProgramCache {
    /// Create an empty cache that builds with `build_options`.
    #[must_use]
    pub fn new(api: Arc<dyn DeviceApi>, capacity: usize, build_options: impl Into<String>) -> Self {
        Self {
            api,
            capacity: capacity.max(1),
            build_options: build_options.into(),
            inner: Mutex::new(CacheInner {
                slots: HashMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
            built: Condvar::new(),
        }
    }

    /// Number of cached programs, excluding in-flight builds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Whether the cache holds no built programs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit and miss counts since construction.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }

    /// Look up the program for `source`, compiling and caching it on miss.
    pub fn get_or_build(&self, source: &dyn KernelSource) -> Result<Arc<ProgramHandle>> {
        let text = source.generate_source().concat();
        let digest = digest_of(&text);

        let mut guard = self.inner.lock();
        loop {
            guard.tick += 1;
            let tick = guard.tick;
            match guard.slots.get_mut(&digest) {
                Some(Slot::Ready(entry)) => {
                    entry.last_used = tick;
                    let program = Arc::clone(&entry.program);
                    guard.hits += 1;
                    tracing::trace!(key = %short_hex(&digest), "program cache hit");
                    return Ok(program);
                }
                Some(Slot::Building) => {
                    // Another thread is compiling this digest; one compile
                    // serves everyone.
                    self.built.wait(&mut guard);
                }
                None => break,
            }
        }
        guard.misses += 1;
        guard.slots.insert(digest, Slot::Building);
        drop(guard);

        tracing::debug!(key = %short_hex(&digest), bytes = text.len(), "program cache miss, building");
        match self.build(&digest, &text) {
            Ok(handle) => {
                let program = Arc::new(handle);
                let mut guard = self.inner.lock();
                guard.tick += 1;
                let tick = guard.tick;
                evict_if_full(&mut guard, self.capacity);
                guard.slots.insert(
                    digest,
                    Slot::Ready(Entry {
                        program: Arc::clone(&program),
                        last_used: tick,
                    }),
                );
                drop(guard);
                self.built.notify_all();
                Ok(program)
            }
            Err(err) => {
                self.inner.lock().slots.remove(&digest);
                self.built.notify_all();
                Err(err)
            }
        }
    }

    fn build(&self, digest: &SourceDigest, text: &str) -> Result<ProgramHandle> {
        let raw = self.api.create_program(text)?;
        if self.api.build_program(raw, &self.build_options).is_err() {
            let log = self.api.build_log(raw);
            // The failed program object must not leak.
            if let Err(release_err) = self.api.release_program(raw) {
                tracing::warn!(program = raw.0, "failed to release unbuilt program: {release_err}");
            }
            return Err(GravelError::Compile {
                key: hex(digest),
                log,
            });
        }
        Ok(ProgramHandle {
            api: Arc::clone(&self.api),
            raw,
        })
    }
}

fn evict_if_full(inner: &mut CacheInner, capacity: usize) {
    while inner.slots.len() >= capacity {
        // Only entries with no live handout may go; a program must outlive
        // every kernel created from it. If everything is referenced the
        // cache runs over capacity until handouts drop.
        let victim = inner
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(entry) if Arc::strong_count(&entry.program) == 1 => {
                    Some((*key, entry.last_used))
                }
                _ => None,
            })
            .min_by_key(|&(_, last_used)| last_used)
            .map(|(key, _)| key);
        match victim {
            Some(key) => {
                inner.slots.remove(&key);
                tracing::debug!(key = %short_hex(&key), "evicted program");
            }
            None => break,
        }
    }
}

fn digest_of(text: &str) -> SourceDigest {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let out = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&out);
    digest
}

fn hex(digest: &SourceDigest) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn short_hex(digest: &SourceDigest) -> String {
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;
    use crate::stub::StubDevice;

    fn cache(stub: &Arc<StubDevice>, capacity: usize) -> ProgramCache {
        let api: Arc<dyn DeviceApi> = Arc::clone(stub) as Arc<dyn DeviceApi>;
        ProgramCache::new(api, capacity, "-cl-unsafe-math-optimizations")
    }

    #[test]
    fn second_lookup_hits() {
        let stub = StubDevice::new();
        let cache = cache(&stub, 100);
        let source = StaticSource::new(["__kernel void map() {}"]);

        let first = cache.get_or_build(&source).unwrap();
        let second = cache.get_or_build(&source).unwrap();
        assert_eq!(first.raw(), second.raw());
        assert_eq!(stub.build_count(), 1);
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn identical_text_from_distinct_keys_shares_an_entry() {
        let stub = StubDevice::new();
        let cache = cache(&stub, 100);
        let a = StaticSource::new(["__kernel", " void f() {}"]);
        let b = StaticSource::new(["__kernel void f() {}"]);

        let pa = cache.get_or_build(&a).unwrap();
        let pb = cache.get_or_build(&b).unwrap();
        assert_eq!(pa.raw(), pb.raw());
        assert_eq!(stub.build_count(), 1);
    }

    #[test]
    fn capacity_is_honored_once_handouts_drop() {
        let stub = StubDevice::new();
        let cache = cache(&stub, 2);

        for i in 0..5 {
            let source = StaticSource::new([format!("__kernel void k{i}() {{}}")]);
            let handle = cache.get_or_build(&source).unwrap();
            drop(handle);
        }
        assert!(cache.len() <= 2);
    }

    #[test]
    fn referenced_entries_are_never_evicted() {
        let stub = StubDevice::new();
        let cache = cache(&stub, 1);

        let pinned_source = StaticSource::new(["__kernel void pinned() {}"]);
        let pinned = cache.get_or_build(&pinned_source).unwrap();

        let other = StaticSource::new(["__kernel void other() {}"]);
        let _ = cache.get_or_build(&other).unwrap();

        // The pinned program is still served from cache, not rebuilt.
        let again = cache.get_or_build(&pinned_source).unwrap();
        assert_eq!(pinned.raw(), again.raw());
    }

    #[test]
    fn build_failure_surfaces_compile_error_and_releases() {
        let stub = StubDevice::new();
        let cache = cache(&stub, 100);
        let source = StaticSource::new(["__kernel void broken() {}"]);

        stub.inject_failure("build_program", 0, -11);
        let err = cache.get_or_build(&source).unwrap_err();
        assert!(matches!(err, GravelError::Compile { .. }));

        // A retry with the same key compiles cleanly.
        let handle = cache.get_or_build(&source).unwrap();
        drop(handle);
        drop(cache);
        assert!(stub.handle_counts().is_balanced());
    }

    #[test]
    fn concurrent_misses_build_once() {
        let stub = StubDevice::new();
        let cache = Arc::new(cache(&stub, 100));
        let source = StaticSource::new(["__kernel void hot() {}"]);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let source = source.clone();
                scope.spawn(move || {
                    cache.get_or_build(&source).unwrap();
                });
            }
        });
        assert_eq!(stub.build_count(), 1);
    }

    #[test]
    fn dropping_the_cache_releases_programs() {
        let stub = StubDevice::new();
        let cache = cache(&stub, 100);
        for i in 0..3 {
            let source = StaticSource::new([format!("__kernel void k{i}() {{}}")]);
            let _ = cache.get_or_build(&source).unwrap();
        }
        drop(cache);
        assert!(stub.handle_counts().is_balanced());
    }
}
