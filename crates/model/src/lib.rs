use std::sync::Arc;

use thiserror::Error;

/// Native plane slots reserved per tile: luma, chroma U, chroma V.
pub const PLANES_PER_TILE: u32 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TilePosition {
    pub col: u32,
    pub row: u32,
}

impl TilePosition {
    pub const fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// Opaque stream reference handed out by the decode layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Opaque per-tile reference into the decode layer.
/// Created once per tile for the lifetime of a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TileHandle(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PixelOrigin {
    pub x: u32,
    pub y: u32,
}

/// Grid geometry as reported by the decode layer, before validation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GridInfo {
    pub cols: u32,
    pub rows: u32,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlaneKind {
    Luma,
    ChromaU,
    ChromaV,
}

impl PlaneKind {
    pub const ALL: [PlaneKind; 3] = [PlaneKind::Luma, PlaneKind::ChromaU, PlaneKind::ChromaV];

    const fn slot_offset(self) -> u32 {
        match self {
            PlaneKind::Luma => 0,
            PlaneKind::ChromaU => 1,
            PlaneKind::ChromaV => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GridLayoutError {
    #[error("tile grid must have at least one column and one row (got {cols}x{rows})")]
    EmptyGrid { cols: u32, rows: u32 },
    #[error("frame size must be non-zero (got {width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("frame width {frame_width} is not divisible by {cols} tile columns")]
    WidthNotDivisible { frame_width: u32, cols: u32 },
    #[error("frame height {frame_height} is not divisible by {rows} tile rows")]
    HeightNotDivisible { frame_height: u32, rows: u32 },
    #[error("tile size {tile_width}x{tile_height} must be even for exact chroma offsets")]
    OddTileSize { tile_width: u32, tile_height: u32 },
    #[error("tile grid {cols}x{rows} exceeds the supported tile count")]
    TooManyTiles { cols: u32, rows: u32 },
    #[error("tile position is outside the grid")]
    TileIndexOutOfBounds,
}

/// Validated tile grid. Everything derived from it is exact integer arithmetic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GridLayout {
    info: GridInfo,
    tile_width: u32,
    tile_height: u32,
}

impl GridLayout {
    pub fn new(info: GridInfo) -> Result<Self, GridLayoutError> {
        let GridInfo {
            cols,
            rows,
            frame_width,
            frame_height,
        } = info;
        if cols == 0 || rows == 0 {
            return Err(GridLayoutError::EmptyGrid { cols, rows });
        }
        if frame_width == 0 || frame_height == 0 {
            return Err(GridLayoutError::EmptyFrame {
                width: frame_width,
                height: frame_height,
            });
        }
        if frame_width % cols != 0 {
            return Err(GridLayoutError::WidthNotDivisible { frame_width, cols });
        }
        if frame_height % rows != 0 {
            return Err(GridLayoutError::HeightNotDivisible { frame_height, rows });
        }
        let tile_width = frame_width / cols;
        let tile_height = frame_height / rows;
        if tile_width % 2 != 0 || tile_height % 2 != 0 {
            return Err(GridLayoutError::OddTileSize {
                tile_width,
                tile_height,
            });
        }
        // plane slot indices are (sequential_index - 1) * 3 and must stay in u32
        let max_tiles = (u32::MAX / PLANES_PER_TILE) as u64;
        if cols as u64 * rows as u64 > max_tiles {
            return Err(GridLayoutError::TooManyTiles { cols, rows });
        }
        Ok(Self {
            info,
            tile_width,
            tile_height,
        })
    }

    pub fn info(&self) -> GridInfo {
        self.info
    }

    pub fn cols(&self) -> u32 {
        self.info.cols
    }

    pub fn rows(&self) -> u32 {
        self.info.rows
    }

    pub fn frame_width(&self) -> u32 {
        self.info.frame_width
    }

    pub fn frame_height(&self) -> u32 {
        self.info.frame_height
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn chroma_tile_width(&self) -> u32 {
        self.tile_width / 2
    }

    pub fn chroma_tile_height(&self) -> u32 {
        self.tile_height / 2
    }

    pub fn chroma_frame_width(&self) -> u32 {
        self.info.frame_width / 2
    }

    pub fn chroma_frame_height(&self) -> u32 {
        self.info.frame_height / 2
    }

    pub const fn tile_count(&self) -> usize {
        self.info.cols as usize * self.info.rows as usize
    }

    pub fn luma_plane_len(&self) -> usize {
        self.info.frame_width as usize * self.info.frame_height as usize
    }

    pub fn chroma_plane_len(&self) -> usize {
        self.chroma_frame_width() as usize * self.chroma_frame_height() as usize
    }

    pub fn luma_tile_len(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize
    }

    pub fn chroma_tile_len(&self) -> usize {
        self.chroma_tile_width() as usize * self.chroma_tile_height() as usize
    }

    pub fn contains(&self, position: TilePosition) -> bool {
        position.col < self.info.cols && position.row < self.info.rows
    }

    /// 1-based row-major index used for stable tile ordering.
    pub fn sequential_index(&self, position: TilePosition) -> Result<u32, GridLayoutError> {
        if !self.contains(position) {
            return Err(GridLayoutError::TileIndexOutOfBounds);
        }
        Ok(position.row * self.info.cols + position.col + 1)
    }

    pub fn position(&self, sequential_index: u32) -> Result<TilePosition, GridLayoutError> {
        if sequential_index == 0 || sequential_index as usize > self.tile_count() {
            return Err(GridLayoutError::TileIndexOutOfBounds);
        }
        let zero_based = sequential_index - 1;
        Ok(TilePosition {
            col: zero_based % self.info.cols,
            row: zero_based / self.info.cols,
        })
    }

    pub fn luma_origin(&self, position: TilePosition) -> PixelOrigin {
        PixelOrigin {
            x: position.col * self.tile_width,
            y: position.row * self.tile_height,
        }
    }

    pub fn chroma_origin(&self, position: TilePosition) -> PixelOrigin {
        PixelOrigin {
            x: position.col * self.chroma_tile_width(),
            y: position.row * self.chroma_tile_height(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TileDescriptor {
    pub position: TilePosition,
    pub sequential_index: u32,
    pub plane_slot_index: u32,
    pub luma_origin: PixelOrigin,
    pub chroma_origin: PixelOrigin,
    pub decode_handle: TileHandle,
}

impl TileDescriptor {
    pub fn plane_slot(&self, plane: PlaneKind) -> u32 {
        self.plane_slot_index + plane.slot_offset()
    }
}

/// Immutable descriptor table, precomputed once at stream open and shared
/// read-only between the polling worker and the foreground assembler.
#[derive(Debug)]
pub struct TileTable {
    layout: GridLayout,
    // descriptors[i].sequential_index == i + 1
    descriptors: Box<[TileDescriptor]>,
}

impl TileTable {
    /// Builds the table in sequential order, asking `create_handle` for each
    /// tile's decode handle exactly once.
    pub fn build<E>(
        layout: GridLayout,
        mut create_handle: impl FnMut(TilePosition, u32) -> Result<TileHandle, E>,
    ) -> Result<Arc<Self>, E> {
        let mut descriptors = Vec::with_capacity(layout.tile_count());
        for row in 0..layout.rows() {
            for col in 0..layout.cols() {
                let position = TilePosition { col, row };
                let sequential_index = row * layout.cols() + col + 1;
                let decode_handle = create_handle(position, sequential_index)?;
                descriptors.push(TileDescriptor {
                    position,
                    sequential_index,
                    plane_slot_index: (sequential_index - 1) * PLANES_PER_TILE,
                    luma_origin: layout.luma_origin(position),
                    chroma_origin: layout.chroma_origin(position),
                    decode_handle,
                });
            }
        }
        Ok(Arc::new(Self {
            layout,
            descriptors: descriptors.into_boxed_slice(),
        }))
    }

    #[cfg(feature = "test-helpers")]
    pub fn with_sequential_handles(layout: GridLayout) -> Arc<Self> {
        let result: Result<Arc<Self>, std::convert::Infallible> =
            Self::build(layout, |_, sequential_index| {
                Ok(TileHandle(sequential_index as u64))
            });
        match result {
            Ok(table) => table,
            Err(never) => match never {},
        }
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[TileDescriptor] {
        &self.descriptors
    }

    pub fn iter(&self) -> impl Iterator<Item = &TileDescriptor> + '_ {
        self.descriptors.iter()
    }

    pub fn get(&self, sequential_index: u32) -> Option<&TileDescriptor> {
        let slot = (sequential_index as usize).checked_sub(1)?;
        self.descriptors.get(slot)
    }
}
