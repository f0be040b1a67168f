//! The post-transform data store.
//!
//! Single owner of every cached fetch result. UI-side viewers re-query the
//! same event constantly; the store makes repeat lookups O(1), including for
//! fetches that failed (the status string is cached too, so a missing
//! extension is not re-probed per frame). Aliased events (duplicate sub-draws
//! from indirect-count expansion) redirect to the primary's entry instead of
//! re-running the GPU work.

use std::collections::HashMap;

use crate::driver::BufferHandle;
use crate::executor::StageData;
use prism_annotate::ShaderStage;

/// Cache key: one event, one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub event_id: u64,
    pub stage: ShaderStage,
}

/// Runs the actual GPU fetch on a cache miss and releases result buffers on
/// invalidation. Implemented over [`crate::executor::Executor`] in
/// production; tests substitute a counter.
pub trait StageFetcher {
    fn fetch(&mut self, key: StoreKey) -> StageData;
    fn release(&mut self, buffer: BufferHandle);
}

#[derive(Default)]
pub struct PostTransformStore {
    cache: HashMap<StoreKey, StageData>,
    /// alias event id -> primary event id.
    aliases: HashMap<u64, u64>,
}

impl PostTransformStore {
    pub fn new() -> PostTransformStore {
        PostTransformStore::default()
    }

    fn resolve(&self, event_id: u64) -> u64 {
        self.aliases.get(&event_id).copied().unwrap_or(event_id)
    }

    /// Cached post-transform data for an event, fetching on first use.
    pub fn get<F: StageFetcher>(&mut self, fetcher: &mut F, key: StoreKey) -> &StageData {
        let resolved = StoreKey {
            event_id: self.resolve(key.event_id),
            stage: key.stage,
        };
        self.cache
            .entry(resolved)
            .or_insert_with(|| fetcher.fetch(resolved))
    }

    /// Declares that `alias_event_id` produces GPU state identical to
    /// `primary_event_id`; lookups for the alias reuse the primary's entry.
    pub fn register_alias(&mut self, primary_event_id: u64, alias_event_id: u64) {
        if primary_event_id == alias_event_id {
            return;
        }
        let root = self.resolve(primary_event_id);
        self.aliases.insert(alias_event_id, root);
    }

    pub fn is_cached(&self, key: StoreKey) -> bool {
        let resolved = StoreKey {
            event_id: self.resolve(key.event_id),
            stage: key.stage,
        };
        self.cache.contains_key(&resolved)
    }

    /// Releases every owned GPU buffer and clears the cache. Called on
    /// capture close.
    pub fn invalidate<F: StageFetcher>(&mut self, fetcher: &mut F) {
        for (_, data) in self.cache.drain() {
            if let Some(buffer) = data.vertex_buffer {
                fetcher.release(buffer);
            }
            if let Some(buffer) = data.index_buffer {
                fetcher.release(buffer);
            }
        }
        self.aliases.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
