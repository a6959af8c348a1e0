use std::collections::VecDeque;

use bitvec::prelude::{BitVec, Lsb0};
use model::GridLayout;
use thiserror::Error;

use crate::frame_buffer::{FrameBuffer, FrameBufferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("frame buffer pool size must be at least 1")]
    ZeroSize,
    #[error("no preparing buffer and no free buffer to rotate in")]
    NoBufferAvailable,
    #[error("mark_ready called with no buffer in the preparing slot")]
    NothingPreparing,
    #[error("dequeue_ready called on an empty ready queue")]
    ReadyQueueEmpty,
    #[error("frame buffer {0:?} does not belong to this pool")]
    UnknownBuffer(FrameBufferId),
    #[error("frame buffer {0:?} was returned but is not presenting")]
    NotPresenting(FrameBufferId),
}

/// Fixed set of `N` frame buffers cycling free -> preparing -> ready ->
/// presenting -> free.
///
/// Buffers handed to the presenter are moved out of the pool; the pool only
/// remembers their ids until they come back through
/// [`FrameBufferPool::return_from_presenting`]. At every point
/// `free + preparing + ready + presenting == N`.
#[derive(Debug)]
pub struct FrameBufferPool {
    size: usize,
    free: VecDeque<FrameBuffer>,
    preparing: Option<FrameBuffer>,
    ready: VecDeque<FrameBuffer>,
    presenting: BitVec<usize, Lsb0>,
    presenting_count: usize,
    marked_ready_total: u64,
}

impl FrameBufferPool {
    pub fn new(pool_size: usize, layout: &GridLayout) -> Result<Self, PoolError> {
        if pool_size == 0 {
            return Err(PoolError::ZeroSize);
        }
        let free = (0..pool_size)
            .map(|index| FrameBuffer::new(FrameBufferId(index as u32), layout))
            .collect();
        let mut pool = Self {
            size: pool_size,
            free,
            preparing: None,
            ready: VecDeque::with_capacity(pool_size),
            presenting: BitVec::repeat(false, pool_size),
            presenting_count: 0,
            marked_ready_total: 0,
        };
        pool.promote_free_to_preparing();
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn preparing_len(&self) -> usize {
        usize::from(self.preparing.is_some())
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn presenting_len(&self) -> usize {
        self.presenting_count
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// True when a preparing buffer exists or can be rotated in.
    pub fn can_prepare(&self) -> bool {
        self.preparing.is_some() || !self.free.is_empty()
    }

    pub fn marked_ready_total(&self) -> u64 {
        self.marked_ready_total
    }

    pub fn preparing_buffer(&self) -> Option<&FrameBuffer> {
        self.preparing.as_ref()
    }

    pub fn acquire_preparing_buffer(&mut self) -> Result<&mut FrameBuffer, PoolError> {
        self.promote_free_to_preparing();
        self.preparing.as_mut().ok_or(PoolError::NoBufferAvailable)
    }

    /// Moves the preparing buffer to the tail of the ready queue and rotates
    /// the next free buffer in.
    pub fn mark_ready(&mut self) -> Result<FrameBufferId, PoolError> {
        let mut buffer = self.preparing.take().ok_or(PoolError::NothingPreparing)?;
        buffer.reset_completion();
        let id = buffer.id();
        self.ready.push_back(buffer);
        self.marked_ready_total += 1;
        self.promote_free_to_preparing();
        self.debug_check_accounting();
        log::debug!(target: "pool", "frame buffer {:?} ready (ready queue {})", id, self.ready.len());
        Ok(id)
    }

    /// Removes the head of the ready queue; the caller now owns it as the
    /// presenting buffer.
    pub fn dequeue_ready(&mut self) -> Result<FrameBuffer, PoolError> {
        let buffer = self.ready.pop_front().ok_or(PoolError::ReadyQueueEmpty)?;
        let slot = buffer.id().0 as usize;
        assert!(
            !self.presenting[slot],
            "frame buffer {:?} is already presenting",
            buffer.id()
        );
        self.presenting.set(slot, true);
        self.presenting_count += 1;
        self.debug_check_accounting();
        Ok(buffer)
    }

    pub fn return_from_presenting(&mut self, buffer: FrameBuffer) -> Result<(), PoolError> {
        let id = buffer.id();
        let slot = id.0 as usize;
        if slot >= self.size {
            return Err(PoolError::UnknownBuffer(id));
        }
        if !self.presenting[slot] {
            return Err(PoolError::NotPresenting(id));
        }
        self.presenting.set(slot, false);
        self.presenting_count -= 1;
        self.free.push_back(buffer);
        self.debug_check_accounting();
        Ok(())
    }

    /// Number of buffers the pool can account for, wherever they are.
    pub fn accounted_buffers(&self) -> usize {
        self.free.len() + self.preparing_len() + self.ready.len() + self.presenting_count
    }

    fn promote_free_to_preparing(&mut self) {
        if self.preparing.is_some() {
            return;
        }
        if let Some(mut buffer) = self.free.pop_front() {
            buffer.begin_preparing();
            self.preparing = Some(buffer);
        }
    }

    fn debug_check_accounting(&self) {
        debug_assert_eq!(
            self.accounted_buffers(),
            self.size,
            "frame buffer pool lost track of a buffer"
        );
    }
}
