//! Byte-bounded LRU cache of decoded source chunks.
//!
//! Each [`SourceReader`](crate::raster::SourceReader) owns one of these, so a
//! worker's cache never contends with another worker's.

use std::sync::Arc;

use lru::LruCache;

/// Default budget per source handle.
pub const DEFAULT_CAPACITY_BYTES: usize = 256 * 1024 * 1024;

/// A decoded strip or tile, samples interleaved by band.
#[derive(Debug)]
pub struct DecodedChunk {
    /// Samples converted to `f32`
    pub data: Vec<f32>,
    /// Row stride in pixels
    pub stride: usize,
}

struct CacheEntry {
    chunk: Arc<DecodedChunk>,
    size_bytes: usize,
}

pub struct TileCache {
    current_bytes: usize,
    capacity_bytes: usize,
    entries: LruCache<u32, CacheEntry>,
}

impl TileCache {
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        TileCache {
            current_bytes: 0,
            capacity_bytes,
            entries: LruCache::unbounded(),
        }
    }

    pub fn get(&mut self, chunk_index: u32) -> Option<Arc<DecodedChunk>> {
        self.entries.get(&chunk_index).map(|entry| Arc::clone(&entry.chunk))
    }

    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a decoded chunk, evicting least-recently-used entries to stay
    /// within budget. Chunks larger than the whole budget are not cached.
    pub fn insert(&mut self, chunk_index: u32, chunk: Arc<DecodedChunk>) {
        let size_bytes = chunk.data.len() * std::mem::size_of::<f32>();
        if size_bytes > self.capacity_bytes {
            return;
        }

        if let Some(old) = self.entries.pop(&chunk_index) {
            self.current_bytes = self.current_bytes.saturating_sub(old.size_bytes);
        }

        while self.current_bytes + size_bytes > self.capacity_bytes {
            if let Some((_key, entry)) = self.entries.pop_lru() {
                self.current_bytes = self.current_bytes.saturating_sub(entry.size_bytes);
            } else {
                break;
            }
        }

        self.current_bytes = self.current_bytes.saturating_add(size_bytes);
        self.entries.put(chunk_index, CacheEntry { chunk, size_bytes });
    }
}
