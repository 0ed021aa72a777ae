//! Bump allocator backing the byte-level storage a module owns: interned
//! symbol names and global-initializer bytes.
//!
//! The IR's entity graph (blocks, instructions, operands) is owned
//! through dense [`liric_entity::PrimaryMap`]s rather than raw arena
//! pointers — see the module doc on [`crate::ir`] for why. What the
//! arena actually backs is variable-length byte data that needs a
//! single, module-scoped lifetime without per-allocation bookkeeping:
//! every symbol name and every global's raw initializer bytes live
//! here, copied in once and never moved again.
//!
//! Unlike the original C arena, handles returned by [`Arena`] are
//! stable chunk-relative indices rather than raw pointers, so there is
//! no unsafe code on the allocation path and no pointer invalidation to
//! reason about. A chunk, once allocated, is never resized or moved;
//! only the arena's chunk list grows.

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A handle to a byte range previously copied into an [`Arena`].
///
/// Valid only for the `Arena` that produced it; valid until that arena
/// is dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaBytes {
    chunk: u32,
    offset: u32,
    len: u32,
}

impl ArenaBytes {
    /// Number of bytes this handle refers to.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether this handle refers to zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A bump allocator whose allocations all share the lifetime of a single
/// containing module.
///
/// `alloc` zero-initializes; `alloc_uninit` skips that for hot paths
/// that are about to overwrite every byte anyway. Allocations larger
/// than the configured chunk size get their own chunk sized to fit.
#[derive(Debug)]
pub struct Arena {
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
}

impl Arena {
    /// Create an arena whose default chunk size is `default_chunk_size`
    /// bytes (64 KiB if `None`).
    pub fn create(default_chunk_size: Option<usize>) -> Self {
        Self {
            chunk_size: default_chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            chunks: Vec::new(),
        }
    }

    /// Copy `bytes` into the arena and return a stable handle to the copy.
    pub fn strdup(&mut self, bytes: &[u8]) -> ArenaBytes {
        let handle = self.alloc_uninit(bytes.len());
        self.bytes_mut(handle).copy_from_slice(bytes);
        handle
    }

    /// Allocate `len` zero-initialized bytes.
    pub fn alloc(&mut self, len: usize) -> ArenaBytes {
        let handle = self.alloc_uninit(len);
        for b in self.bytes_mut(handle) {
            *b = 0;
        }
        handle
    }

    /// Allocate `len` bytes without initializing them.
    ///
    /// Safe in the Rust sense (no uninitialized memory is ever exposed —
    /// the backing `Vec` is zero-filled on chunk creation), but callers
    /// should not rely on the contents before writing them.
    pub fn alloc_uninit(&mut self, len: usize) -> ArenaBytes {
        if len == 0 {
            return ArenaBytes {
                chunk: 0,
                offset: 0,
                len: 0,
            };
        }
        if self.chunks.is_empty() || self.remaining(self.chunks.len() - 1) < len {
            let size = len.max(self.chunk_size);
            self.chunks.push(Vec::with_capacity(size));
        }
        let idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[idx];
        let offset = chunk.len();
        chunk.resize(offset + len, 0);
        ArenaBytes {
            chunk: idx as u32,
            offset: offset as u32,
            len: len as u32,
        }
    }

    fn remaining(&self, chunk_idx: usize) -> usize {
        self.chunks[chunk_idx].capacity() - self.chunks[chunk_idx].len()
    }

    /// Read back the bytes referred to by `handle`.
    pub fn bytes(&self, handle: ArenaBytes) -> &[u8] {
        if handle.len == 0 {
            return &[];
        }
        let chunk = &self.chunks[handle.chunk as usize];
        &chunk[handle.offset as usize..handle.offset as usize + handle.len as usize]
    }

    fn bytes_mut(&mut self, handle: ArenaBytes) -> &mut [u8] {
        let chunk = &mut self.chunks[handle.chunk as usize];
        &mut chunk[handle.offset as usize..handle.offset as usize + handle.len as usize]
    }

    /// Total bytes currently resident across all chunks.
    pub fn total_allocated(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::create(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strdup_round_trips() {
        let mut arena = Arena::default();
        let h = arena.strdup(b"hello");
        assert_eq!(arena.bytes(h), b"hello");
    }

    #[test]
    fn large_alloc_gets_its_own_chunk() {
        let mut arena = Arena::create(Some(16));
        let big = vec![7u8; 1000];
        let h = arena.strdup(&big);
        assert_eq!(arena.bytes(h), &big[..]);
        assert!(arena.total_allocated() >= 1000);
    }

    #[test]
    fn zero_length_is_harmless() {
        let mut arena = Arena::default();
        let h = arena.alloc(0);
        assert!(h.is_empty());
        assert_eq!(arena.bytes(h), &[] as &[u8]);
    }
}
