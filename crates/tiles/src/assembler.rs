use std::sync::Arc;

use model::{PlaneKind, TileTable};
use protocol::TileBatch;
use thiserror::Error;

use crate::frame_buffer::{FrameBuffer, FrameBufferId};
use crate::pool::{FrameBufferPool, PoolError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("tile {sequential_index} delivered twice into the same frame buffer")]
    DuplicateTile { sequential_index: u32 },
    #[error("tile {sequential_index} is not part of the tile grid")]
    UnknownTile { sequential_index: u32 },
    #[error(
        "tile {sequential_index} {plane:?} payload has {actual} bytes, expected {expected}"
    )]
    PayloadSizeMismatch {
        sequential_index: u32,
        plane: PlaneKind,
        expected: usize,
        actual: usize,
    },
    #[error("batch for frame {batch_frame} applied to a buffer holding frame {buffer_frame}")]
    FrameIndexMismatch { buffer_frame: u64, batch_frame: u64 },
    #[error("completion counter would reach {attempted} of {total} tiles")]
    CompletionOverflow { attempted: usize, total: usize },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchApplied {
    Partial { completed: usize, total: usize },
    FrameComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyOutcome {
    Partial { completed: usize, total: usize },
    FrameReady { buffer: FrameBufferId, frame_index: u64 },
}

/// Writes ready tile batches into frame buffers at precomputed offsets.
/// Work per call is bounded by the tile area of the batch; it never blocks.
#[derive(Debug, Clone)]
pub struct TileAssembler {
    table: Arc<TileTable>,
}

impl TileAssembler {
    pub fn new(table: Arc<TileTable>) -> Self {
        Self { table }
    }

    pub fn total_tile_count(&self) -> usize {
        self.table.len()
    }

    /// Applies every tile of `batch` to `buffer`.
    ///
    /// The batch is validated as a whole before any pixel is written, so a
    /// rejected batch leaves the buffer untouched.
    pub fn apply_tile_batch(
        &self,
        buffer: &mut FrameBuffer,
        batch: &TileBatch,
    ) -> Result<BatchApplied, AssemblyError> {
        let total = self.table.len();
        if let Some(buffer_frame) = buffer.frame_index() {
            if buffer_frame != batch.frame_index {
                return Err(AssemblyError::FrameIndexMismatch {
                    buffer_frame,
                    batch_frame: batch.frame_index,
                });
            }
        }
        let attempted = buffer.completed_tile_count() + batch.len();
        if attempted > total {
            return Err(AssemblyError::CompletionOverflow { attempted, total });
        }

        let layout = self.table.layout();
        let expected_luma = layout.luma_tile_len();
        let expected_chroma = layout.chroma_tile_len();
        let mut delivered = buffer.delivered().clone();
        for tile in &batch.tiles {
            let sequential_index = tile.sequential_index;
            if self.table.get(sequential_index).is_none() {
                return Err(AssemblyError::UnknownTile { sequential_index });
            }
            let slot = sequential_index as usize - 1;
            if delivered[slot] {
                return Err(AssemblyError::DuplicateTile { sequential_index });
            }
            delivered.set(slot, true);
            let planes = [
                (PlaneKind::Luma, tile.payload.luma.len(), expected_luma),
                (PlaneKind::ChromaU, tile.payload.chroma_u.len(), expected_chroma),
                (PlaneKind::ChromaV, tile.payload.chroma_v.len(), expected_chroma),
            ];
            for (plane, actual, expected) in planes {
                if actual != expected {
                    return Err(AssemblyError::PayloadSizeMismatch {
                        sequential_index,
                        plane,
                        expected,
                        actual,
                    });
                }
            }
        }

        for tile in &batch.tiles {
            let Some(descriptor) = self.table.get(tile.sequential_index) else {
                continue;
            };
            buffer.write_luma_tile(descriptor.luma_origin, layout.tile_width(), &tile.payload.luma);
            buffer.write_chroma_tiles(
                descriptor.chroma_origin,
                layout.chroma_tile_width(),
                &tile.payload.chroma_u,
                &tile.payload.chroma_v,
            );
        }
        buffer.commit_delivery(delivered, batch.len(), batch.frame_index);

        let completed = buffer.completed_tile_count();
        if completed == total {
            Ok(BatchApplied::FrameComplete)
        } else {
            Ok(BatchApplied::Partial { completed, total })
        }
    }

    /// Applies `batch` to the pool's preparing buffer and marks it ready when
    /// its last tile lands.
    pub fn assemble(
        &self,
        pool: &mut FrameBufferPool,
        batch: &TileBatch,
    ) -> Result<AssemblyOutcome, AssemblyError> {
        let buffer = pool.acquire_preparing_buffer()?;
        match self.apply_tile_batch(buffer, batch)? {
            BatchApplied::Partial { completed, total } => {
                Ok(AssemblyOutcome::Partial { completed, total })
            }
            BatchApplied::FrameComplete => {
                let buffer = pool.mark_ready()?;
                Ok(AssemblyOutcome::FrameReady {
                    buffer,
                    frame_index: batch.frame_index,
                })
            }
        }
    }
}
