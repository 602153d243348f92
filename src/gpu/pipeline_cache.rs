use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use super::structs::SamplerDesc;

/// Get-or-create map from a state descriptor to the native object realized
/// for it. Entries live until [`PipelineCache::clear`]; the descriptor space
/// is bounded by content.
pub struct PipelineCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
    creations: AtomicUsize,
    hits: AtomicUsize,
}

impl<K, V> Default for PipelineCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            creations: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }
}

impl<K: Hash + Eq + Clone + std::fmt::Debug, V: Clone> PipelineCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Return the cached object for `key`, creating and inserting it on a
    /// miss.
    pub fn get_or_create(&self, key: &K, create: impl FnOnce(&K) -> V) -> V {
        if let Some(value) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("pipeline cache hit for {key:?}");
            return value;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return value.clone();
        }
        let value = create(key);
        self.creations.fetch_add(1, Ordering::Relaxed);
        log::debug!("pipeline cache miss, created state for {key:?}");
        entries.insert(key.clone(), value.clone());
        value
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Native sampler objects shared by every texture with the same
/// [`SamplerDesc`]. Entries belong to one device epoch; the first lookup
/// after a recreation empties the cache.
pub struct SamplerCache<V> {
    samplers: PipelineCache<SamplerDesc, V>,
    epoch: AtomicU64,
}

impl<V> Default for SamplerCache<V> {
    fn default() -> Self {
        Self {
            samplers: PipelineCache::default(),
            epoch: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> SamplerCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, epoch: u64, desc: &SamplerDesc, create: impl FnOnce(&SamplerDesc) -> V) -> V {
        let previous = self.epoch.swap(epoch, Ordering::AcqRel);
        if previous != epoch {
            log::debug!("sampler cache reset for epoch {epoch} ({} dropped)", self.samplers.len());
            self.samplers.clear();
        }
        self.samplers.get_or_create(desc, create)
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    pub fn creations(&self) -> usize {
        self.samplers.creations()
    }

    pub fn hits(&self) -> usize {
        self.samplers.hits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BlendDesc, DepthStencilDesc, SamplerMagFilter, SamplerMinFilter};

    #[test]
    fn identical_descriptors_hit() {
        let cache: PipelineCache<BlendDesc, u32> = PipelineCache::new();
        let mut next = 0;
        let mut make = |_: &BlendDesc| {
            next += 1;
            next
        };
        let a = cache.get_or_create(&BlendDesc::alpha_blend(), &mut make);
        let b = cache.get_or_create(&BlendDesc::alpha_blend(), &mut make);
        assert_eq!(a, b);
        assert_eq!(cache.creations(), 1);
        assert_eq!(cache.hits(), 1);

        let c = cache.get_or_create(&BlendDesc::default(), &mut make);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clear_forces_recreation() {
        let cache: PipelineCache<DepthStencilDesc, &'static str> = PipelineCache::new();
        cache.get_or_create(&DepthStencilDesc::default(), |_| "first");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_create(&DepthStencilDesc::default(), |_| "second"), "second");
        assert_eq!(cache.creations(), 2);
    }

    #[test]
    fn samplers_are_shared_within_an_epoch() {
        let cache: SamplerCache<u32> = SamplerCache::new();
        let nearest = SamplerDesc {
            min_filter: SamplerMinFilter::Nearest,
            mag_filter: SamplerMagFilter::Nearest,
            ..SamplerDesc::default()
        };
        assert_eq!(cache.get_or_create(0, &SamplerDesc::default(), |_| 1), 1);
        assert_eq!(cache.get_or_create(0, &nearest, |_| 2), 2);
        assert_eq!(cache.get_or_create(0, &SamplerDesc::default(), |_| 3), 1);
        assert_eq!(cache.creations(), 2);
        assert_eq!(cache.hits(), 1);

        // Objects from the old epoch are never handed out again.
        assert_eq!(cache.get_or_create(1, &SamplerDesc::default(), |_| 4), 4);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_or_create(1, &nearest, |_| 5), 5);
        assert_eq!(cache.creations(), 4);
    }
}
