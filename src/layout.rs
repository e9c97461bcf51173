//! Volume layout - how a 3-D volume is divided into cubic chunks

use crate::error::{Result, VolError};
use crate::utils::format_bytes;
use serde::{Deserialize, Serialize};

/// Largest accepted extent along any axis
pub const MAX_DIMENSION: usize = 10_000;

/// Smallest accepted chunk edge
pub const MIN_CHUNK_DIM: usize = 16;

/// Largest accepted chunk edge
pub const MAX_CHUNK_DIM: usize = 1024;

/// Default chunk edge
pub const DEFAULT_CHUNK_DIM: usize = 256;

/// Position of a chunk in the chunk grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub cx: usize,
    pub cy: usize,
    pub cz: usize,
}

impl ChunkCoord {
    pub fn new(cx: usize, cy: usize, cz: usize) -> Self {
        Self { cx, cy, cz }
    }
}

/// Shape of a chunked volume.
///
/// Chunk indices run x fastest: `index = cx + cy * cnt_x + cz * cnt_x * cnt_y`.
/// Every file this crate writes or reads orders its chunk payloads this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub chunk_dim: usize,
}

impl ChunkLayout {
    /// Create a validated layout
    pub fn new(width: usize, height: usize, depth: usize, chunk_dim: usize) -> Result<Self> {
        let layout = Self {
            width,
            height,
            depth,
            chunk_dim,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Layout derived from a chunk grid; extents are chunk-aligned
    pub fn from_chunk_counts(chunk_dim: usize, counts: [usize; 3]) -> Result<Self> {
        validate_chunk_dim(chunk_dim)?;
        let max_count = MAX_DIMENSION.div_ceil(chunk_dim);
        if counts.iter().any(|&c| c == 0 || c > max_count) {
            return Err(VolError::Configuration(format!(
                "chunk counts {:?} outside 1..={} for chunk dim {}",
                counts, max_count, chunk_dim
            )));
        }
        Ok(Self {
            width: counts[0] * chunk_dim,
            height: counts[1] * chunk_dim,
            depth: counts[2] * chunk_dim,
            chunk_dim,
        })
    }

    /// Check the sanity bounds on extents and chunk edge
    pub fn validate(&self) -> Result<()> {
        validate_chunk_dim(self.chunk_dim)?;
        for (name, value) in [
            ("width", self.width),
            ("height", self.height),
            ("depth", self.depth),
        ] {
            if value == 0 || value > MAX_DIMENSION {
                return Err(VolError::Configuration(format!(
                    "{} {} outside 1..={}",
                    name, value, MAX_DIMENSION
                )));
            }
        }
        Ok(())
    }

    /// Same chunk grid with extents rounded up to whole chunks
    pub fn aligned(&self) -> Self {
        let [cx, cy, cz] = self.chunk_counts();
        Self {
            width: cx * self.chunk_dim,
            height: cy * self.chunk_dim,
            depth: cz * self.chunk_dim,
            chunk_dim: self.chunk_dim,
        }
    }

    /// Number of chunks along x, y and z
    pub fn chunk_counts(&self) -> [usize; 3] {
        [
            self.width.div_ceil(self.chunk_dim),
            self.height.div_ceil(self.chunk_dim),
            self.depth.div_ceil(self.chunk_dim),
        ]
    }

    pub fn total_chunks(&self) -> usize {
        self.chunk_counts().iter().product()
    }

    /// Bytes in one chunk payload
    pub fn chunk_volume(&self) -> usize {
        self.chunk_dim * self.chunk_dim * self.chunk_dim
    }

    /// Bytes of all chunk payloads, excluding any header
    pub fn raw_data_size(&self) -> u64 {
        self.total_chunks() as u64 * self.chunk_volume() as u64
    }

    /// Voxels in one Z slice
    pub fn slice_len(&self) -> usize {
        self.width * self.height
    }

    /// Linear index of a chunk, x fastest. `coord` must lie inside the grid.
    pub fn chunk_index(&self, coord: ChunkCoord) -> usize {
        let [cnt_x, cnt_y, cnt_z] = self.chunk_counts();
        debug_assert!(
            coord.cx < cnt_x && coord.cy < cnt_y && coord.cz < cnt_z,
            "chunk {:?} outside a {}x{}x{} grid",
            coord,
            cnt_x,
            cnt_y,
            cnt_z
        );
        coord.cx + coord.cy * cnt_x + coord.cz * cnt_x * cnt_y
    }

    /// Inverse of [`chunk_index`](Self::chunk_index); `index` must be below `total_chunks()`
    pub fn chunk_coord(&self, index: usize) -> ChunkCoord {
        debug_assert!(
            index < self.total_chunks(),
            "chunk index {} outside 0..{}",
            index,
            self.total_chunks()
        );
        let [cnt_x, cnt_y, _] = self.chunk_counts();
        let layer = cnt_x * cnt_y;
        ChunkCoord {
            cx: index % cnt_x,
            cy: (index % layer) / cnt_x,
            cz: index / layer,
        }
    }

    /// Resolve a voxel to `(chunk index, offset inside the chunk)`
    pub fn locate(&self, x: usize, y: usize, z: usize) -> Result<(usize, usize)> {
        if !self.is_in_bounds(x, y, z) {
            return Err(VolError::OutOfBounds(format!(
                "voxel ({}, {}, {}) outside {}x{}x{}",
                x, y, z, self.width, self.height, self.depth
            )));
        }
        let cd = self.chunk_dim;
        let chunk = self.chunk_index(ChunkCoord::new(x / cd, y / cd, z / cd));
        let offset = (z % cd) * cd * cd + (y % cd) * cd + (x % cd);
        Ok((chunk, offset))
    }

    pub fn is_in_bounds(&self, x: usize, y: usize, z: usize) -> bool {
        x < self.width && y < self.height && z < self.depth
    }

    /// Voxel ranges `[start, end)` a chunk covers, clipped to the volume
    pub fn chunk_data_range(&self, coord: ChunkCoord) -> [(usize, usize); 3] {
        let cd = self.chunk_dim;
        let clip = |c: usize, extent: usize| {
            let start = c * cd;
            (start, (start + cd).min(extent))
        };
        [
            clip(coord.cx, self.width),
            clip(coord.cy, self.height),
            clip(coord.cz, self.depth),
        ]
    }

    pub fn summary(&self) -> String {
        let [cx, cy, cz] = self.chunk_counts();
        format!(
            "{} x {} x {} voxels, chunk {} ({} x {} x {} = {} chunks), {} raw",
            self.width,
            self.height,
            self.depth,
            self.chunk_dim,
            cx,
            cy,
            cz,
            self.total_chunks(),
            format_bytes(self.raw_data_size())
        )
    }
}

fn validate_chunk_dim(chunk_dim: usize) -> Result<()> {
    if !(MIN_CHUNK_DIM..=MAX_CHUNK_DIM).contains(&chunk_dim) {
        return Err(VolError::Configuration(format!(
            "chunk dim {} outside {}..={}",
            chunk_dim, MIN_CHUNK_DIM, MAX_CHUNK_DIM
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_layout() -> ChunkLayout {
        ChunkLayout::new(1000, 800, 500, 64).unwrap()
    }

    #[test]
    fn test_chunk_counts() {
        let layout = create_test_layout();
        assert_eq!(layout.chunk_counts(), [16, 13, 8]);
        assert_eq!(layout.total_chunks(), 16 * 13 * 8);
    }

    #[test]
    fn test_ct_reference_volume() {
        let layout = ChunkLayout::new(300, 300, 300, 256).unwrap();
        assert_eq!(layout.chunk_counts(), [2, 2, 2]);
        assert_eq!(layout.total_chunks(), 8);
        assert_eq!(layout.raw_data_size(), 134_217_728);
    }

    #[test]
    fn test_chunk_index_bijection() {
        let layout = ChunkLayout::new(300, 170, 90, 32).unwrap();
        let [cx, cy, cz] = layout.chunk_counts();
        let mut seen = vec![false; layout.total_chunks()];
        for z in 0..cz {
            for y in 0..cy {
                for x in 0..cx {
                    let coord = ChunkCoord::new(x, y, z);
                    let index = layout.chunk_index(coord);
                    assert!(!seen[index], "index {} produced twice", index);
                    seen[index] = true;
                    assert_eq!(layout.chunk_coord(index), coord);
                }
            }
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_locate() {
        let layout = ChunkLayout::new(100, 100, 100, 16).unwrap();
        assert_eq!(layout.locate(0, 0, 0).unwrap(), (0, 0));
        // x=17 -> chunk cx=1, local 1; y=2; z=3
        let (chunk, offset) = layout.locate(17, 2, 3).unwrap();
        assert_eq!(chunk, 1);
        assert_eq!(offset, 3 * 256 + 2 * 16 + 1);
        assert!(matches!(
            layout.locate(100, 0, 0),
            Err(VolError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_chunk_data_range() {
        let layout = create_test_layout();
        assert_eq!(
            layout.chunk_data_range(ChunkCoord::new(0, 0, 0)),
            [(0, 64), (0, 64), (0, 64)]
        );
        // Last chunk should be trimmed
        assert_eq!(
            layout.chunk_data_range(ChunkCoord::new(15, 12, 7)),
            [(960, 1000), (768, 800), (448, 500)]
        );
    }

    #[test]
    fn test_validation_bounds() {
        assert!(ChunkLayout::new(0, 10, 10, 16).is_err());
        assert!(ChunkLayout::new(10_001, 10, 10, 16).is_err());
        assert!(ChunkLayout::new(10, 10, 10, 8).is_err());
        assert!(ChunkLayout::new(10, 10, 10, 2048).is_err());
        assert!(ChunkLayout::new(10_000, 1, 1, 1024).is_ok());
    }

    #[test]
    fn test_from_chunk_counts_is_aligned() {
        let layout = ChunkLayout::from_chunk_counts(64, [2, 3, 1]).unwrap();
        assert_eq!((layout.width, layout.height, layout.depth), (128, 192, 64));
        assert_eq!(layout, layout.aligned());
        assert!(ChunkLayout::from_chunk_counts(64, [0, 1, 1]).is_err());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "outside 0..8")]
    fn test_chunk_coord_rejects_index_past_grid() {
        let layout = ChunkLayout::new(300, 300, 300, 256).unwrap();
        layout.chunk_coord(8);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "outside a 2x2x2 grid")]
    fn test_chunk_index_rejects_coord_past_grid() {
        let layout = ChunkLayout::new(300, 300, 300, 256).unwrap();
        layout.chunk_index(ChunkCoord::new(2, 0, 0));
    }
}
