//! Bump-allocated, chunked executable memory (spec §4.10).
//!
//! Each chunk starts read-write so code can be copied in, then flips
//! to read-execute once nothing more will be written into it. A
//! chunk already serving calls is never touched again unless a
//! rollback truncates it, so live code never sees its protection
//! toggled out from under it.

use liric_codegen::result::{CodegenError, CodegenResult};
use region::Protection;

const CHUNK_SIZE: usize = 64 * 1024;

struct Chunk {
    alloc: region::Allocation,
    len: usize,
    writable: bool,
}

impl Chunk {
    fn new(size: usize) -> CodegenResult<Self> {
        let alloc = region::alloc(size, Protection::READ_WRITE)
            .map_err(|e| CodegenError::backend(format!("mmap failed: {e}")))?;
        Ok(Chunk { alloc, len: 0, writable: true })
    }

    fn cap(&self) -> usize {
        self.alloc.len()
    }

    fn base_ptr(&self) -> *mut u8 {
        self.alloc.as_ptr::<u8>() as *mut u8
    }

    fn ensure_writable(&mut self) -> CodegenResult<()> {
        if self.writable {
            return Ok(());
        }
        unsafe {
            region::protect(self.base_ptr() as *const _, self.cap(), Protection::READ_WRITE)
                .map_err(|e| CodegenError::backend(format!("mprotect rw failed: {e}")))?;
        }
        self.writable = true;
        Ok(())
    }

    fn make_executable(&mut self) -> CodegenResult<()> {
        if !self.writable {
            return Ok(());
        }
        unsafe {
            region::protect(self.base_ptr() as *const _, self.cap(), Protection::READ_EXECUTE)
                .map_err(|e| CodegenError::backend(format!("mprotect rx failed: {e}")))?;
        }
        self.writable = false;
        flush_icache(self.base_ptr(), self.len);
        Ok(())
    }
}

/// Invalidate the instruction cache for freshly written code.
///
/// Required on architectures that don't keep the icache coherent with
/// the dcache (aarch64); a no-op everywhere else, including x86_64
/// where the hardware guarantees coherency.
#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *mut u8, len: usize) {
    extern "C" {
        fn __clear_cache(begin: *mut i8, end: *mut i8);
    }
    unsafe {
        __clear_cache(start as *mut i8, start.add(len) as *mut i8);
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: *mut u8, _len: usize) {}

/// A rollback point: every chunk created and every byte written after
/// this mark is taken is undone by [`CodeMemory::truncate`].
#[derive(Clone, Copy)]
pub struct Mark {
    chunk: usize,
    len: usize,
}

/// Growable executable memory, one function's code always contiguous
/// within a single chunk.
pub struct CodeMemory {
    chunks: Vec<Chunk>,
}

impl CodeMemory {
    pub fn new() -> Self {
        CodeMemory { chunks: Vec::new() }
    }

    pub fn mark(&self) -> Mark {
        match self.chunks.len() {
            0 => Mark { chunk: 0, len: 0 },
            n => Mark { chunk: n - 1, len: self.chunks[n - 1].len },
        }
    }

    /// Undo every write since `mark` was taken. Chunks created after
    /// the mark are dropped (unmapped); the mark's own chunk has its
    /// cursor rewound, leaving stale bytes past it unreachable.
    pub fn truncate(&mut self, mark: Mark) {
        if self.chunks.is_empty() {
            return;
        }
        self.chunks.truncate(mark.chunk + 1);
        self.chunks[mark.chunk].len = mark.len;
    }

    /// Copy `code` into the buffer, returning its absolute address.
    pub fn place(&mut self, code: &[u8]) -> CodegenResult<usize> {
        let needs_new_chunk = match self.chunks.last() {
            Some(c) => c.cap() - c.len < code.len(),
            None => true,
        };
        if needs_new_chunk {
            self.chunks.push(Chunk::new(CHUNK_SIZE.max(code.len()))?);
        }
        let chunk = self.chunks.last_mut().expect("just pushed or already present");
        chunk.ensure_writable()?;
        let base = chunk.base_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), base.add(chunk.len), code.len());
        }
        let addr = base as usize + chunk.len;
        chunk.len += code.len();
        Ok(addr)
    }

    /// Overwrite previously placed bytes at `addr` in place. Used for
    /// the repatch pass of a batch compile, where a function's final
    /// encoding is the same length as its placeholder-address one.
    pub fn overwrite(&mut self, addr: usize, code: &[u8]) -> CodegenResult<()> {
        for chunk in &mut self.chunks {
            let base = chunk.base_ptr() as usize;
            if addr >= base && addr + code.len() <= base + chunk.len {
                chunk.ensure_writable()?;
                unsafe {
                    std::ptr::copy_nonoverlapping(code.as_ptr(), addr as *mut u8, code.len());
                }
                return Ok(());
            }
        }
        Err(CodegenError::state("overwrite address not found in any code chunk"))
    }

    /// Flip every chunk with pending writes to read-execute. Called at
    /// the end of a successful `add_module`/`end_update`.
    pub fn finalize(&mut self) -> CodegenResult<()> {
        for c in &mut self.chunks {
            c.make_executable()?;
        }
        Ok(())
    }
}

impl Default for CodeMemory {
    fn default() -> Self {
        Self::new()
    }
}
