//! Session-wide large-buffer pool.
//!
//! One pinned block of `max_queue_depth × max_io_size` bytes, registered
//! once, carved into equal chunks kept on a LIFO free-stack. Requests whose
//! data exceeds the in-capsule size borrow a chunk and return it when their
//! completion is sent. The pool is mutated only by the executor owning the
//! session.

use std::io;

use crate::mem::{Pinned, POOL_ALIGN};
use crate::qp::{RdmaQp, Registration};

pub struct DataBufPool {
    buf: Pinned,
    registration: Registration,
    chunk_size: usize,
    num_chunks: usize,
    free_stack: Vec<usize>,
}

impl DataBufPool {
    /// Allocate and register the pool on `qp`'s protection domain.
    pub fn new(qp: &dyn RdmaQp, num_chunks: usize, chunk_size: usize) -> io::Result<Self> {
        debug_assert!(num_chunks > 0 && chunk_size > 0);
        let buf = Pinned::alloc(num_chunks * chunk_size, POOL_ALIGN)?;
        // Safety: `buf` is pinned and owned by the pool alongside the
        // registration.
        let registration = unsafe { qp.register(buf.as_mut_ptr(), buf.len())? };

        let free_stack = (0..num_chunks).collect();

        Ok(Self {
            buf,
            registration,
            chunk_size,
            num_chunks,
            free_stack,
        })
    }

    /// Pop a free chunk, or `None` when the pool is exhausted.
    #[inline]
    pub fn acquire(&mut self) -> Option<usize> {
        self.free_stack.pop()
    }

    /// Push a chunk back on the free-stack.
    #[inline]
    pub fn release(&mut self, chunk: usize) {
        debug_assert!(chunk < self.num_chunks);
        debug_assert!(!self.free_stack.contains(&chunk));
        self.free_stack.push(chunk);
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.registration.lkey()
    }

    #[inline]
    pub fn chunk_addr(&self, chunk: usize) -> u64 {
        debug_assert!(chunk < self.num_chunks);
        self.buf.addr() + (chunk * self.chunk_size) as u64
    }

    #[inline]
    pub fn chunk_ptr(&self, chunk: usize) -> *mut u8 {
        debug_assert!(chunk < self.num_chunks);
        unsafe { self.buf.as_mut_ptr().add(chunk * self.chunk_size) }
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free_stack.len()
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.num_chunks
    }
}

/// Per-session transport state: the shared buffer pool and the executor
/// that owns the session.
pub struct RdmaSession {
    pool: DataBufPool,
    executor: u32,
}

impl RdmaSession {
    /// Build the session pool against the first connection's device. Every
    /// later connection of the session is assumed to live on the same
    /// device.
    pub fn new(
        qp: &dyn RdmaQp,
        max_queue_depth: u16,
        max_io_size: u32,
        executor: u32,
    ) -> io::Result<Self> {
        let pool = DataBufPool::new(qp, max_queue_depth as usize, max_io_size as usize)?;
        log::debug!(
            "session data pool: {} chunks of {} bytes, lkey {:#x}",
            max_queue_depth,
            max_io_size,
            pool.lkey()
        );
        Ok(Self { pool, executor })
    }

    #[inline]
    pub fn pool(&self) -> &DataBufPool {
        &self.pool
    }

    #[inline]
    pub fn pool_mut(&mut self) -> &mut DataBufPool {
        &mut self.pool
    }

    #[inline]
    pub fn executor(&self) -> u32 {
        self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockQp;

    #[test]
    fn pool_is_lifo_and_conserving(){
        let qp = MockQp::new();
        let mut pool = DataBufPool::new(&qp, 4, 4096).unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.total(), 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 2);

        pool.release(a);
        // LIFO: the chunk released last comes back first.
        assert_eq!(pool.acquire().unwrap(), a);

        pool.release(b);
        pool.release(a);
        let _ = pool.acquire().unwrap();
        let _ = pool.acquire().unwrap();
        let _ = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn chunk_addresses_do_not_overlap() {
        let qp = MockQp::new();
        let pool = DataBufPool::new(&qp, 3, 8192).unwrap();
        let base = pool.chunk_addr(0);
        assert_eq!(pool.chunk_addr(1), base + 8192);
        assert_eq!(pool.chunk_addr(2), base + 16384);
    }
}
