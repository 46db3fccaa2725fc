//! Partitioning of the composite extent into chunk windows.
//!
//! Windows are produced lazily in a fixed order: the outer loop walks x, the
//! inner loop walks y, so `chunk_0_0`, `chunk_0_1024`, ... `chunk_1024_0`, ...
//! Edge windows are clipped to the remaining extent, which makes the sequence
//! an exact partition of `[0, width) x [0, height)`.

use std::fmt;
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

/// Rectangular region of the composite, in composite pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkWindow {
    pub x_offset: usize,
    pub y_offset: usize,
    pub x_size: usize,
    pub y_size: usize,
}

impl ChunkWindow {
    #[must_use]
    pub fn new(x_offset: usize, y_offset: usize, x_size: usize, y_size: usize) -> Self {
        Self { x_offset, y_offset, x_size, y_size }
    }

    /// Number of pixels covered.
    #[must_use]
    pub fn area(&self) -> usize {
        self.x_size * self.y_size
    }

    /// Output file name derived from the window origin.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("chunk_{}_{}.tif", self.x_offset, self.y_offset)
    }

    /// Output path inside `dir`.
    #[must_use]
    pub fn output_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Whether the two windows share at least one pixel.
    #[must_use]
    pub fn intersects(&self, other: &ChunkWindow) -> bool {
        self.x_offset < other.x_offset + other.x_size
            && other.x_offset < self.x_offset + self.x_size
            && self.y_offset < other.y_offset + other.y_size
            && other.y_offset < self.y_offset + self.y_size
    }
}

impl fmt::Display for ChunkWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "window ({}, {}) {}x{}",
            self.x_offset, self.y_offset, self.x_size, self.y_size
        )
    }
}

/// Number of windows `plan(width, height, chunk_size)` yields.
#[must_use]
pub fn window_count(width: usize, height: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    width.div_ceil(chunk_size) * height.div_ceil(chunk_size)
}

/// Plan the chunk grid for a `width x height` raster.
///
/// A `chunk_size` of zero yields no windows; configuration validation rejects
/// it before it gets here.
#[must_use]
pub fn plan(width: usize, height: usize, chunk_size: usize) -> ChunkPlan {
    ChunkPlan {
        width,
        height,
        chunk_size,
        next_x: 0,
        next_y: 0,
        remaining: window_count(width, height, chunk_size),
    }
}

/// Lazy, restartable (`Clone`) iterator over the chunk grid.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    width: usize,
    height: usize,
    chunk_size: usize,
    next_x: usize,
    next_y: usize,
    remaining: usize,
}

impl ChunkPlan {
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total number of windows in the full grid, independent of progress.
    #[must_use]
    pub fn total(&self) -> usize {
        window_count(self.width, self.height, self.chunk_size)
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkWindow;

    fn next(&mut self) -> Option<ChunkWindow> {
        if self.remaining == 0 {
            return None;
        }
        let window = ChunkWindow {
            x_offset: self.next_x,
            y_offset: self.next_y,
            x_size: self.chunk_size.min(self.width - self.next_x),
            y_size: self.chunk_size.min(self.height - self.next_y),
        };

        self.next_y += self.chunk_size;
        if self.next_y >= self.height {
            self.next_y = 0;
            self.next_x += self.chunk_size;
        }
        self.remaining -= 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ChunkPlan {}

impl FusedIterator for ChunkPlan {}
