use model::{GridInfo, StreamHandle, TileHandle, TilePosition};
use protocol::{FieldOfViewHint, PollStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("failed to open stream {url}: {message}")]
    OpenStream { url: String, message: String },
    #[error("stream {stream:?} did not report a tile grid: {message}")]
    GridInfo {
        stream: StreamHandle,
        message: String,
    },
    #[error("failed to create decode stream for tile {sequential_index}: {message}")]
    TileStream {
        sequential_index: u32,
        message: String,
    },
    #[error("poll of tile handle {handle:?} for frame {frame_index} failed: {message}")]
    Poll {
        handle: TileHandle,
        frame_index: u64,
        message: String,
    },
}

/// The external decode/streaming layer.
///
/// Stream setup calls happen once on the presentation thread; afterwards the
/// decoder moves to the polling worker, which is the only caller of
/// [`TileDecoder::poll_tile`] and [`TileDecoder::notify_field_of_view`].
pub trait TileDecoder: Send + 'static {
    fn open_stream(&mut self, url: &str) -> Result<StreamHandle, DecodeError>;

    fn grid_info(&self, stream: StreamHandle) -> Result<GridInfo, DecodeError>;

    /// Called once per tile, in sequential order, while the descriptor table
    /// is built.
    fn create_tile_stream(
        &mut self,
        stream: StreamHandle,
        position: TilePosition,
        sequential_index: u32,
    ) -> Result<TileHandle, DecodeError>;

    /// Playback is about to start.
    fn prefetch(&mut self, _stream: StreamHandle) {}

    /// Reports whether the tile's payload for `frame_index` is available.
    fn poll_tile(
        &mut self,
        handle: TileHandle,
        frame_index: u64,
        batch_index: u64,
    ) -> Result<PollStatus, DecodeError>;

    /// Viewing-direction hint. Implementations may ignore it.
    fn notify_field_of_view(&mut self, _hint: FieldOfViewHint) {}
}
