//! Messages that cross the boundary between the tile polling worker and the
//! presentation thread.

use std::fmt;

use model::TilePosition;
use smallvec::SmallVec;

/// Batches up to this size stay inline in the hand-off channel slot.
pub const INLINE_BATCH_TILES: usize = 8;

/// Decoded pixel planes of one tile, rows tightly packed.
/// Luma is `tile_width * tile_height`; each chroma plane is a quarter of that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePayload {
    pub luma: Vec<u8>,
    pub chroma_u: Vec<u8>,
    pub chroma_v: Vec<u8>,
}

impl TilePayload {
    pub fn filled(luma_len: usize, chroma_len: usize, luma: u8, chroma_u: u8, chroma_v: u8) -> Self {
        Self {
            luma: vec![luma; luma_len],
            chroma_u: vec![chroma_u; chroma_len],
            chroma_v: vec![chroma_v; chroma_len],
        }
    }
}

/// Result of asking the decode layer whether one tile of one frame is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Ready(TilePayload),
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyTile {
    pub sequential_index: u32,
    pub payload: TilePayload,
}

pub type BatchTiles = SmallVec<[ReadyTile; INLINE_BATCH_TILES]>;

/// Tiles reported ready together by one polling pass, in ascending
/// sequential index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBatch {
    pub frame_index: u64,
    pub batch_index: u64,
    pub tiles: BatchTiles,
}

impl TileBatch {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn sequential_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.tiles.iter().map(|tile| tile.sequential_index)
    }
}

/// Why the hand-off channel was marked complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionReason {
    EndOfStream,
    Cancelled,
    DecodeFailed(String),
    ProtocolViolation(String),
}

impl CompletionReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompletionReason::ProtocolViolation(_))
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionReason::EndOfStream => write!(formatter, "end of stream"),
            CompletionReason::Cancelled => write!(formatter, "cancelled"),
            CompletionReason::DecodeFailed(message) => {
                write!(formatter, "decode failed: {message}")
            }
            CompletionReason::ProtocolViolation(message) => {
                write!(formatter, "protocol violation: {message}")
            }
        }
    }
}

/// Viewing-direction hint forwarded to the decode layer. Fire and forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldOfViewHint {
    pub col: u32,
    pub row: u32,
}

impl From<TilePosition> for FieldOfViewHint {
    fn from(position: TilePosition) -> Self {
        Self {
            col: position.col,
            row: position.row,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn only_protocol_violations_are_fatal() {
        assert!(!CompletionReason::EndOfStream.is_fatal());
        assert!(!CompletionReason::Cancelled.is_fatal());
        assert!(!CompletionReason::DecodeFailed("io".to_owned()).is_fatal());
        assert!(CompletionReason::ProtocolViolation("dup".to_owned()).is_fatal());
    }

    #[test]
    fn batch_reports_indices_in_collection_order() {
        let payload = TilePayload::filled(4, 1, 0, 127, 127);
        let batch = TileBatch {
            frame_index: 3,
            batch_index: 7,
            tiles: smallvec![
                ReadyTile {
                    sequential_index: 1,
                    payload: payload.clone(),
                },
                ReadyTile {
                    sequential_index: 2,
                    payload,
                },
            ],
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.sequential_indices().collect::<Vec<_>>(), vec![1, 2]);
    }
}
