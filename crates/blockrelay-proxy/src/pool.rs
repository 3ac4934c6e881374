//! Bounded buffer pool and scatter lists
//!
//! All pre-read memory comes from a fixed, pre-allocated pool; exhaustion
//! fails the single request that hit it rather than growing the heap under
//! load. Scatter lists own their buffers and may reference the same buffer
//! from several elements, which is how the pass-through middle of a
//! pre-read shares one "dummy" block.

use blockrelay_common::{Error, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::warn;

struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_bytes: usize,
    name: &'static str,
}

/// Fixed-size pool of pre-allocated block buffers.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    /// Pre-allocate `count` buffers of `buffer_bytes` each.
    #[must_use]
    pub fn new(name: &'static str, buffer_bytes: usize, count: usize) -> Self {
        let free = (0..count)
            .map(|_| vec![0u8; buffer_bytes].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                buffer_bytes,
                name,
            }),
        }
    }

    /// Take one buffer; `ResourceExhausted` when the pool is empty.
    pub fn take(&self) -> Result<PoolBlock> {
        let buf = self.inner.free.lock().pop();
        buf.map_or_else(
            || {
                warn!(pool = self.inner.name, "buffer pool exhausted");
                Err(Error::ResourceExhausted(self.inner.name))
            },
            |buf| {
                Ok(PoolBlock {
                    buf: Some(buf),
                    pool: Arc::clone(&self.inner),
                })
            },
        )
    }

    /// Size of each pooled buffer in bytes.
    #[must_use]
    pub fn buffer_bytes(&self) -> usize {
        self.inner.buffer_bytes
    }

    /// Buffers currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// One buffer checked out of a [`BlockPool`]; returns itself on drop.
pub struct PoolBlock {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PoolBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("pool buffer present until drop")
    }
}

impl DerefMut for PoolBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("pool buffer present until drop")
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().push(buf);
        }
    }
}

enum SgBuffer {
    Pooled(PoolBlock),
    Heap(Box<[u8]>),
}

impl SgBuffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Pooled(block) => block,
            Self::Heap(buf) => buf,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Pooled(block) => block,
            Self::Heap(buf) => buf,
        }
    }
}

/// One scatter-list element: a byte length inside an owned buffer.
#[derive(Clone, Copy)]
struct SgElement {
    buffer: usize,
    len: usize,
}

/// Scatter list handed to the physical service for reads and attached to
/// writes as the read-modify-write descriptor.
///
/// Elements are consumed in order; several elements may point at the same
/// buffer, in which case later fills overwrite earlier ones (discard
/// semantics for the dummy block).
#[derive(Default)]
pub struct SgList {
    buffers: Vec<SgBuffer>,
    elements: Vec<SgElement>,
}

impl SgList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pooled buffer; returns its index for element references.
    pub fn push_pooled(&mut self, block: PoolBlock) -> usize {
        self.buffers.push(SgBuffer::Pooled(block));
        self.buffers.len() - 1
    }

    /// Add a plain heap buffer; returns its index for element references.
    pub fn push_heap(&mut self, buf: Box<[u8]>) -> usize {
        self.buffers.push(SgBuffer::Heap(buf));
        self.buffers.len() - 1
    }

    /// Append an element covering `len` bytes of buffer `buffer`.
    pub fn push_element(&mut self, buffer: usize, len: usize) {
        debug_assert!(buffer < self.buffers.len());
        debug_assert!(len <= self.buffers[buffer].as_slice().len());
        self.elements.push(SgElement { buffer, len });
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Total bytes covered by all elements.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.elements.iter().map(|e| e.len).sum()
    }

    /// Fill the list sequentially from `src`, element by element.
    ///
    /// `src` must cover the full list. Aliased buffers end up holding the
    /// last chunk written to them.
    pub fn fill_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() != self.total_len() {
            return Err(Error::InvalidParameter(format!(
                "scatter list covers {} bytes, source has {}",
                self.total_len(),
                src.len()
            )));
        }
        let mut offset = 0;
        for element in &self.elements {
            let dst = &mut self.buffers[element.buffer].as_mut_slice()[..element.len];
            dst.copy_from_slice(&src[offset..offset + element.len]);
            offset += element.len;
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at logical `offset` out of the list.
    ///
    /// The logical byte space is the concatenation of all elements in
    /// order. Only meaningful for ranges backed by dedicated (non-aliased)
    /// buffers; aliased ranges yield whatever the buffer last held.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if offset + dst.len() > self.total_len() {
            return Err(Error::InvalidParameter(format!(
                "range {}..{} outside scatter list of {} bytes",
                offset,
                offset + dst.len(),
                self.total_len()
            )));
        }
        let mut cursor = 0;
        let mut copied = 0;
        for element in &self.elements {
            let elem_start = cursor;
            let elem_end = cursor + element.len;
            cursor = elem_end;
            let want_start = offset + copied;
            if want_start >= elem_end || copied == dst.len() {
                continue;
            }
            let within = want_start - elem_start;
            let take = (element.len - within).min(dst.len() - copied);
            let src = &self.buffers[element.buffer].as_slice()[within..within + take];
            dst[copied..copied + take].copy_from_slice(src);
            copied += take;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_take_and_return() {
        let pool = BlockPool::new("test", 64, 2);
        assert_eq!(pool.available(), 2);
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.take(), Err(Error::ResourceExhausted(_))));
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn sg_list_fill_and_copy_out() {
        let pool = BlockPool::new("test", 8, 4);
        let mut sgl = SgList::new();
        let head = pool.take().unwrap();
        let tail = pool.take().unwrap();
        let head_idx = sgl.push_pooled(head);
        let tail_idx = sgl.push_pooled(tail);
        sgl.push_element(head_idx, 4);
        sgl.push_element(tail_idx, 4);

        sgl.fill_from(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut out = [0u8; 3];
        sgl.copy_out(3, &mut out).unwrap();
        assert_eq!(out, [4, 5, 6]);
    }

    #[test]
    fn sg_list_aliased_dummy_holds_last_chunk() {
        let pool = BlockPool::new("test", 4, 2);
        let mut sgl = SgList::new();
        let dummy = sgl.push_pooled(pool.take().unwrap());
        sgl.push_element(dummy, 4);
        sgl.push_element(dummy, 4);

        sgl.fill_from(&[1, 1, 1, 1, 2, 2, 2, 2]).unwrap();
        let mut out = [0u8; 4];
        sgl.copy_out(0, &mut out).unwrap();
        assert_eq!(out, [2, 2, 2, 2]);
    }

    #[test]
    fn sg_list_range_checks() {
        let mut sgl = SgList::new();
        let heap = sgl.push_heap(vec![0u8; 8].into_boxed_slice());
        sgl.push_element(heap, 8);
        assert!(sgl.fill_from(&[0u8; 4]).is_err());
        let mut out = [0u8; 4];
        assert!(sgl.copy_out(6, &mut out).is_err());
    }
}
