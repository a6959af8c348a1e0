//! Frame buffers, the buffer pool that cycles them, and the assembler that
//! writes decoded tiles into them.

mod assembler;
mod frame_buffer;
mod pool;

pub use assembler::{AssemblyError, AssemblyOutcome, BatchApplied, TileAssembler};
pub use frame_buffer::{BLACK_LUMA, FrameBuffer, FrameBufferId, FramePlanes, NEUTRAL_CHROMA};
pub use pool::{FrameBufferPool, PoolError};

// Presented buffers travel back to the pool through the release queue.
static_assertions::assert_impl_all!(FrameBuffer: Send);
static_assertions::assert_impl_all!(TileAssembler: Send, Sync);
