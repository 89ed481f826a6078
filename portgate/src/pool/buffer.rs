//! Tiered byte buffers for streaming bodies and socket reads.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::{Pool, ReusableOwned};

pub const SMALL_BUFFER_SIZE: usize = 32 * 1024;
pub const MEDIUM_BUFFER_SIZE: usize = 64 * 1024;
pub const LARGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Content lengths outside `[MIN_SIZED_CONTENT, MAX_SIZED_CONTENT]` are not
/// trusted for sizing and get the medium tier.
const MIN_SIZED_CONTENT: u64 = 64 * 1024;
const MAX_SIZED_CONTENT: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTier {
    Small,
    Medium,
    Large,
}

impl BufferTier {
    pub fn size(self) -> usize {
        match self {
            BufferTier::Small => SMALL_BUFFER_SIZE,
            BufferTier::Medium => MEDIUM_BUFFER_SIZE,
            BufferTier::Large => LARGE_BUFFER_SIZE,
        }
    }

    pub fn for_content_length(len: Option<u64>) -> Self {
        match len {
            Some(len) if (MIN_SIZED_CONTENT..=MAX_SIZED_CONTENT).contains(&len) => {
                if len >= LARGE_BUFFER_SIZE as u64 {
                    BufferTier::Large
                } else {
                    BufferTier::Medium
                }
            }
            _ => BufferTier::Medium,
        }
    }
}

/// Free lists of buffers, one per tier. Cloning shares the lists.
#[derive(Clone)]
pub struct AdaptiveBufferPool {
    small: Arc<Pool<Vec<u8>>>,
    medium: Arc<Pool<Vec<u8>>>,
    large: Arc<Pool<Vec<u8>>>,
}

impl Default for AdaptiveBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveBufferPool {
    /// Buffers are allocated on first use and kept once returned.
    pub fn new() -> Self {
        Self {
            small: Arc::new(Pool::new(0, || Vec::with_capacity(SMALL_BUFFER_SIZE))),
            medium: Arc::new(Pool::new(0, || Vec::with_capacity(MEDIUM_BUFFER_SIZE))),
            large: Arc::new(Pool::new(0, || Vec::with_capacity(LARGE_BUFFER_SIZE))),
        }
    }

    pub fn get(&self, tier: BufferTier) -> PooledBuffer {
        let pool = match tier {
            BufferTier::Small => &self.small,
            BufferTier::Medium => &self.medium,
            BufferTier::Large => &self.large,
        };
        let size = tier.size();
        let mut buf = pool.pull_owned(move || Vec::with_capacity(size));
        buf.resize(size, 0);
        PooledBuffer {
            inner: Some(buf),
            tier,
        }
    }

    pub fn get_for_content_length(&self, len: Option<u64>) -> PooledBuffer {
        self.get(BufferTier::for_content_length(len))
    }
}

/// A borrowed buffer, exactly `tier.size()` bytes long. It goes back to its
/// free list on [`PooledBuffer::release`] or on drop.
pub struct PooledBuffer {
    inner: Option<ReusableOwned<Vec<u8>>>,
    tier: BufferTier,
}

impl PooledBuffer {
    pub fn tier(&self) -> BufferTier {
        self.tier
    }

    /// Returns the buffer to its pool. Releasing twice is a no-op; a released
    /// buffer reads as empty.
    pub fn release(&mut self) {
        self.inner.take();
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            Some(buf) => buf.as_slice(),
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.inner {
            Some(buf) => buf.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("tier", &self.tier)
            .field("len", &self.len())
            .finish()
    }
}
