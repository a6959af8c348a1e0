use bitvec::prelude::{BitVec, Lsb0};
use model::{GridLayout, PixelOrigin};

/// Luma value of a black pixel.
pub const BLACK_LUMA: u8 = 0;
/// Chroma value that carries no color.
pub const NEUTRAL_CHROMA: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameBufferId(pub u32);

/// Borrowed view of one assembled frame.
#[derive(Debug, Clone, Copy)]
pub struct FramePlanes<'a> {
    pub width: u32,
    pub height: u32,
    pub luma: &'a [u8],
    pub chroma_u: &'a [u8],
    pub chroma_v: &'a [u8],
}

/// Reusable container for one full frame: three planes plus per-tile
/// completion bookkeeping.
#[derive(Debug)]
pub struct FrameBuffer {
    id: FrameBufferId,
    width: u32,
    height: u32,
    luma: Box<[u8]>,
    chroma_u: Box<[u8]>,
    chroma_v: Box<[u8]>,
    completed_tile_count: usize,
    // bit (sequential_index - 1) is set once that tile landed in this buffer
    delivered: BitVec<usize, Lsb0>,
    frame_index: Option<u64>,
}

impl FrameBuffer {
    pub fn new(id: FrameBufferId, layout: &GridLayout) -> Self {
        Self {
            id,
            width: layout.frame_width(),
            height: layout.frame_height(),
            luma: vec![BLACK_LUMA; layout.luma_plane_len()].into_boxed_slice(),
            chroma_u: vec![NEUTRAL_CHROMA; layout.chroma_plane_len()].into_boxed_slice(),
            chroma_v: vec![NEUTRAL_CHROMA; layout.chroma_plane_len()].into_boxed_slice(),
            completed_tile_count: 0,
            delivered: BitVec::repeat(false, layout.tile_count()),
            frame_index: None,
        }
    }

    pub fn id(&self) -> FrameBufferId {
        self.id
    }

    pub fn completed_tile_count(&self) -> usize {
        self.completed_tile_count
    }

    /// Decode frame index of the tiles written into this buffer, if any.
    pub fn frame_index(&self) -> Option<u64> {
        self.frame_index
    }

    pub fn planes(&self) -> FramePlanes<'_> {
        FramePlanes {
            width: self.width,
            height: self.height,
            luma: &self.luma,
            chroma_u: &self.chroma_u,
            chroma_v: &self.chroma_v,
        }
    }

    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    pub fn chroma_u(&self) -> &[u8] {
        &self.chroma_u
    }

    pub fn chroma_v(&self) -> &[u8] {
        &self.chroma_v
    }

    pub(crate) fn delivered(&self) -> &BitVec<usize, Lsb0> {
        &self.delivered
    }

    pub(crate) fn commit_delivery(
        &mut self,
        delivered: BitVec<usize, Lsb0>,
        added_tiles: usize,
        frame_index: u64,
    ) {
        self.delivered = delivered;
        self.completed_tile_count += added_tiles;
        self.frame_index = Some(frame_index);
    }

    /// Called when the buffer leaves the preparing slot for the ready queue.
    pub(crate) fn reset_completion(&mut self) {
        self.completed_tile_count = 0;
        self.delivered.fill(false);
    }

    /// Called when the buffer is rotated back into the preparing slot.
    pub(crate) fn begin_preparing(&mut self) {
        self.reset_completion();
        self.frame_index = None;
    }

    pub(crate) fn write_luma_tile(&mut self, origin: PixelOrigin, tile_width: u32, source: &[u8]) {
        copy_tile_rows(&mut self.luma, self.width, origin, tile_width, source);
    }

    pub(crate) fn write_chroma_tiles(
        &mut self,
        origin: PixelOrigin,
        tile_width: u32,
        source_u: &[u8],
        source_v: &[u8],
    ) {
        let chroma_width = self.width / 2;
        copy_tile_rows(&mut self.chroma_u, chroma_width, origin, tile_width, source_u);
        copy_tile_rows(&mut self.chroma_v, chroma_width, origin, tile_width, source_v);
    }
}

fn copy_tile_rows(
    plane: &mut [u8],
    plane_width: u32,
    origin: PixelOrigin,
    tile_width: u32,
    source: &[u8],
) {
    let plane_width = plane_width as usize;
    let tile_width = tile_width as usize;
    for (row, source_row) in source.chunks_exact(tile_width).enumerate() {
        let start = (origin.y as usize + row) * plane_width + origin.x as usize;
        plane[start..start + tile_width].copy_from_slice(source_row);
    }
}
