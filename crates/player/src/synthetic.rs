//! In-process decode layer producing deterministic tiles with staggered
//! completion times.

use std::time::{Duration, Instant};

use model::{GridInfo, StreamHandle, TileHandle, TilePosition};
use protocol::{FieldOfViewHint, PollStatus, TilePayload};
use tile_polling::{DecodeError, TileDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticStream {
    pub grid: GridInfo,
    pub frames: u64,
    /// Upper bound of the per-tile decode delay, measured from the first poll
    /// of a frame.
    pub max_tile_delay: Duration,
}

pub struct SyntheticDecoder {
    stream: SyntheticStream,
    handle: Option<StreamHandle>,
    tile_count: u32,
    current_frame: Option<(u64, Instant)>,
}

impl SyntheticDecoder {
    pub fn new(stream: SyntheticStream) -> Self {
        Self {
            stream,
            handle: None,
            tile_count: 0,
            current_frame: None,
        }
    }

    /// Deterministic delay in `0..=max_tile_delay` for one tile of one frame.
    pub fn tile_delay(&self, sequential_index: u32, frame_index: u64) -> Duration {
        const STEPS: u64 = 16;
        let step = (sequential_index as u64 * 37 + frame_index * 11) % (STEPS + 1);
        self.stream
            .max_tile_delay
            .mul_f64(step as f64 / STEPS as f64)
    }

    /// Luma byte every pixel of a tile carries.
    pub fn luma_value(sequential_index: u32, frame_index: u64) -> u8 {
        (frame_index as u8)
            .wrapping_mul(16)
            .wrapping_add(sequential_index as u8)
    }

    fn payload(&self, sequential_index: u32, frame_index: u64) -> TilePayload {
        let grid = self.stream.grid;
        let tile_width = (grid.frame_width / grid.cols) as usize;
        let tile_height = (grid.frame_height / grid.rows) as usize;
        TilePayload::filled(
            tile_width * tile_height,
            (tile_width / 2) * (tile_height / 2),
            Self::luma_value(sequential_index, frame_index),
            sequential_index as u8,
            frame_index as u8,
        )
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<(), String> {
        match self.handle {
            Some(handle) if handle == stream => Ok(()),
            Some(_) => Err(format!("unknown stream {stream:?}")),
            None => Err("stream not opened".to_owned()),
        }
    }
}

impl TileDecoder for SyntheticDecoder {
    fn open_stream(&mut self, url: &str) -> Result<StreamHandle, DecodeError> {
        if url.is_empty() {
            return Err(DecodeError::OpenStream {
                url: url.to_owned(),
                message: "empty stream url".to_owned(),
            });
        }
        let handle = StreamHandle(1);
        self.handle = Some(handle);
        log::debug!(target: "synthetic", "opened {url}");
        Ok(handle)
    }

    fn grid_info(&self, stream: StreamHandle) -> Result<GridInfo, DecodeError> {
        self.check_stream(stream)
            .map_err(|message| DecodeError::GridInfo { stream, message })?;
        Ok(self.stream.grid)
    }

    fn create_tile_stream(
        &mut self,
        stream: StreamHandle,
        _position: TilePosition,
        sequential_index: u32,
    ) -> Result<TileHandle, DecodeError> {
        self.check_stream(stream)
            .map_err(|message| DecodeError::TileStream {
                sequential_index,
                message,
            })?;
        self.tile_count = self.tile_count.max(sequential_index);
        Ok(TileHandle(sequential_index as u64))
    }

    fn poll_tile(
        &mut self,
        handle: TileHandle,
        frame_index: u64,
        _batch_index: u64,
    ) -> Result<PollStatus, DecodeError> {
        let sequential_index = handle.0 as u32;
        if sequential_index == 0 || sequential_index > self.tile_count {
            return Err(DecodeError::Poll {
                handle,
                frame_index,
                message: "tile handle was never created".to_owned(),
            });
        }
        if frame_index >= self.stream.frames {
            return Ok(PollStatus::EndOfStream);
        }
        let started = match self.current_frame {
            Some((frame, started)) if frame == frame_index => started,
            _ => {
                let now = Instant::now();
                self.current_frame = Some((frame_index, now));
                now
            }
        };
        if started.elapsed() < self.tile_delay(sequential_index, frame_index) {
            return Ok(PollStatus::Pending);
        }
        Ok(PollStatus::Ready(self.payload(sequential_index, frame_index)))
    }

    fn notify_field_of_view(&mut self, hint: FieldOfViewHint) {
        log::debug!(target: "synthetic", "field of view at tile ({}, {})", hint.col, hint.row);
    }
}
