// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Surface cache: destroyed surfaces are parked here instead of freed, so a
//! decoder that recycles same-sized surfaces skips the allocation and guard
//! setup on every frame.
//!
//! All cache instances live in one process-global registry behind a single
//! lock. Lookups match on device and immutable surface identity (size,
//! format, kind). Entries expire after [`CACHE_EXPIRY`]; expired entries are
//! swept opportunistically whenever a surface is inserted.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;

use crate::pixbuf::PixelFormat;
use crate::surface::Surface;
use crate::surface::SurfaceKind;
use crate::sync::Mutex;

/// How long an unused cached surface keeps its backing memory.
pub const CACHE_EXPIRY: Duration = Duration::from_secs(30);

struct CacheEntry {
    surface: Arc<Surface>,
    last_use: Instant,
}

struct CacheInstance {
    id: u64,
    entries: Vec<CacheEntry>,
}

static REGISTRY: Mutex<Vec<CacheInstance>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Owning handle for one cache instance. Dropping it frees every surface the
/// instance still holds.
pub struct SurfaceCache {
    id: u64,
}

impl SurfaceCache {
    pub fn new() -> SurfaceCache {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        REGISTRY.lock().push(CacheInstance {
            id,
            entries: Vec::new(),
        });
        SurfaceCache { id }
    }

    /// Parks a destroyed surface. Inserting a surface that is already cached
    /// refreshes its timestamp instead of duplicating the entry. Expired
    /// entries of this instance are swept on the way out.
    pub fn insert(&self, surface: Arc<Surface>) {
        let now = Instant::now();
        let mut registry = REGISTRY.lock();
        let instance = match registry.iter_mut().find(|i| i.id == self.id) {
            Some(instance) => instance,
            None => return,
        };
        match instance
            .entries
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.surface, &surface))
        {
            Some(entry) => entry.last_use = now,
            None => instance.entries.push(CacheEntry {
                surface,
                last_use: now,
            }),
        }
        let before = instance.entries.len();
        instance
            .entries
            .retain(|e| now.duration_since(e.last_use) < CACHE_EXPIRY);
        let evicted = before - instance.entries.len();
        if evicted > 0 {
            debug!("evicted {} expired cached surface(s)", evicted);
        }
    }

    /// Removes this instance's entries without destroying the instance.
    pub fn flush(&self) {
        let mut registry = REGISTRY.lock();
        if let Some(instance) = registry.iter_mut().find(|i| i.id == self.id) {
            instance.entries.clear();
        }
    }

    #[cfg(test)]
    fn backdate_all(&self, by: Duration) {
        let mut registry = REGISTRY.lock();
        if let Some(instance) = registry.iter_mut().find(|i| i.id == self.id) {
            for entry in &mut instance.entries {
                entry.last_use -= by;
            }
        }
    }
}

impl Default for SurfaceCache {
    fn default() -> Self {
        SurfaceCache::new()
    }
}

impl Drop for SurfaceCache {
    fn drop(&mut self) {
        REGISTRY.lock().retain(|i| i.id != self.id);
    }
}

/// Searches every cache instance for a parked surface matching the request
/// and revives the first hit. The entry leaves the cache; the caller owns
/// the returned reference.
pub fn take_cached(
    device_id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    kind: SurfaceKind,
) -> Option<Arc<Surface>> {
    let mut registry = REGISTRY.lock();
    for instance in registry.iter_mut() {
        if let Some(pos) = instance
            .entries
            .iter()
            .position(|e| e.surface.matches(device_id, width, height, format, kind))
        {
            let entry = instance.entries.remove(pos);
            drop(registry);
            entry.surface.revive();
            debug!(
                "reusing cached {}x{} {:?} surface",
                width, height, kind
            );
            return Some(entry.surface);
        }
    }
    None
}

/// Detaches a surface from whichever cache holds it. Used when a cached
/// surface's memory must actually go away.
pub fn remove_from_any(surface: &Arc<Surface>) {
    let mut registry = REGISTRY.lock();
    for instance in registry.iter_mut() {
        instance
            .entries
            .retain(|e| !Arc::ptr_eq(&e.surface, surface));
    }
}

/// Empties every cache instance in the process. Full-teardown path.
pub fn drop_all_caches() {
    let mut registry = REGISTRY.lock();
    for instance in registry.iter_mut() {
        instance.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host1x::DummyChannel;
    use crate::mem::fake::FakeAllocator;

    static TEST_DEVICE_ID: AtomicU64 = AtomicU64::new(1000);

    fn make_surface(device_id: u64, width: u32, height: u32) -> Arc<Surface> {
        Surface::new(
            device_id,
            &FakeAllocator::new(),
            Arc::new(DummyChannel::new()),
            &Config::default(),
            SurfaceKind::Video,
            width,
            height,
            PixelFormat::Yuv420,
        )
        .unwrap()
    }

    #[test]
    fn hit_requires_matching_identity() {
        let device_id = TEST_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let cache = SurfaceCache::new();
        let surface = make_surface(device_id, 64, 64);
        surface.mark_destroyed();
        cache.insert(surface);

        assert!(take_cached(device_id, 64, 32, PixelFormat::Yuv420, SurfaceKind::Video).is_none());
        assert!(
            take_cached(device_id, 64, 64, PixelFormat::Argb8888, SurfaceKind::Video).is_none()
        );
        assert!(
            take_cached(device_id + 1, 64, 64, PixelFormat::Yuv420, SurfaceKind::Video).is_none()
        );
        let hit =
            take_cached(device_id, 64, 64, PixelFormat::Yuv420, SurfaceKind::Video).unwrap();
        assert!(!hit.is_destroyed());
        // The entry left the cache.
        assert!(take_cached(device_id, 64, 64, PixelFormat::Yuv420, SurfaceKind::Video).is_none());
    }

    #[test]
    fn reinsert_refreshes_instead_of_duplicating() {
        let device_id = TEST_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let cache = SurfaceCache::new();
        let surface = make_surface(device_id, 48, 48);
        surface.mark_destroyed();
        cache.insert(surface.clone());
        cache.insert(surface.clone());

        assert!(take_cached(device_id, 48, 48, PixelFormat::Yuv420, SurfaceKind::Video).is_some());
        assert!(take_cached(device_id, 48, 48, PixelFormat::Yuv420, SurfaceKind::Video).is_none());
    }

    #[test]
    fn expired_entries_are_swept_on_insert() {
        let device_id = TEST_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let cache = SurfaceCache::new();
        let old = make_surface(device_id, 32, 32);
        old.mark_destroyed();
        cache.insert(old);
        cache.backdate_all(CACHE_EXPIRY + Duration::from_secs(1));

        let fresh = make_surface(device_id, 16, 16);
        fresh.mark_destroyed();
        cache.insert(fresh);

        assert!(take_cached(device_id, 32, 32, PixelFormat::Yuv420, SurfaceKind::Video).is_none());
        assert!(take_cached(device_id, 16, 16, PixelFormat::Yuv420, SurfaceKind::Video).is_some());
    }

    #[test]
    fn dropping_the_cache_frees_its_surfaces() {
        let device_id = TEST_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let cache = SurfaceCache::new();
        let surface = make_surface(device_id, 20, 20);
        surface.mark_destroyed();
        cache.insert(surface.clone());
        assert_eq!(Arc::strong_count(&surface), 2);
        drop(cache);
        assert_eq!(Arc::strong_count(&surface), 1);
        assert!(take_cached(device_id, 20, 20, PixelFormat::Yuv420, SurfaceKind::Video).is_none());
    }

    #[test]
    fn remove_from_any_detaches() {
        let device_id = TEST_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let cache = SurfaceCache::new();
        let surface = make_surface(device_id, 24, 24);
        surface.mark_destroyed();
        cache.insert(surface.clone());
        remove_from_any(&surface);
        assert!(take_cached(device_id, 24, 24, PixelFormat::Yuv420, SurfaceKind::Video).is_none());
    }
}
