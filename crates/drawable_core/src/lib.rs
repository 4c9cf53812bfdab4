//! The common drawable header shared by layers, layer masks, and channels,
//! plus the blend-mode and preview machinery layered on top of it.

use std::fmt;

use pixel_region::{PixelRegion, PixelRegionError, Rect};
use tile_store::{TileManager, TileStoreError, Validator};

mod channel;
mod layer;

pub use channel::{Channel, CombineOp};
pub use layer::{ApplyMaskMode, FloatTarget, FloatingSelRecord, Layer, LayerMask};

slotmap::new_key_type! {
    pub struct ImageId;
    pub struct LayerId;
    pub struct ChannelId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawableError {
    InvalidArgument,
    OutOfRange,
}

impl fmt::Display for DrawableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawableError::InvalidArgument => write!(f, "invalid drawable argument"),
            DrawableError::OutOfRange => write!(f, "coordinates out of range"),
        }
    }
}

impl std::error::Error for DrawableError {}

impl From<TileStoreError> for DrawableError {
    fn from(e: TileStoreError) -> Self {
        match e {
            TileStoreError::OutOfRange => DrawableError::OutOfRange,
            TileStoreError::InvalidArgument => DrawableError::InvalidArgument,
        }
    }
}

impl From<PixelRegionError> for DrawableError {
    fn from(_: PixelRegionError) -> Self {
        DrawableError::OutOfRange
    }
}

/// Pixel storage layout, derived from the owning image's base type plus
/// whether this drawable carries its own alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PixelType {
    Rgb,
    Rgba,
    Gray,
    GrayAlpha,
    Indexed,
    IndexedAlpha,
}

impl PixelType {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelType::Rgb => 3,
            PixelType::Rgba => 4,
            PixelType::Gray => 1,
            PixelType::GrayAlpha => 2,
            PixelType::Indexed => 1,
            PixelType::IndexedAlpha => 2,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelType::Rgba | PixelType::GrayAlpha | PixelType::IndexedAlpha
        )
    }

    pub fn with_alpha(self) -> PixelType {
        match self {
            PixelType::Rgb => PixelType::Rgba,
            PixelType::Gray => PixelType::GrayAlpha,
            PixelType::Indexed => PixelType::IndexedAlpha,
            already_alpha => already_alpha,
        }
    }
}

/// The fourteen layer compositing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BlendMode {
    Normal,
    Dissolve,
    Behind,
    Multiply,
    Screen,
    Overlay,
    Difference,
    Addition,
    Subtract,
    DarkenOnly,
    LightenOnly,
    Hue,
    Saturation,
    Color,
    Value,
}

const PREVIEW_TARGET: u32 = 64;

/// Largest subsample factor `s >= 1` such that `PREVIEW_TARGET * 2 * s` still
/// stays under `drawable_dim`; used to pick the stride a box filter walks
/// when regenerating a preview.
fn subsample_factor(drawable_dim: u32) -> u32 {
    let mut s = 1;
    while PREVIEW_TARGET * 2 * (s + 1) < drawable_dim {
        s += 1;
    }
    s
}

/// A small box-filtered subsample of a drawable's pixels, regenerated on
/// demand and invalidated by every mutator.
pub struct Preview {
    width: u32,
    height: u32,
    bpp: u32,
    buffer: Vec<u8>,
    valid: bool,
}

impl Preview {
    fn new(bpp: u32) -> Self {
        Self {
            width: 0,
            height: 0,
            bpp,
            buffer: Vec::new(),
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Rebuilds the preview from `source` if it is stale. Box-filters each
    /// `s x s` source block (where `s` is the subsample factor) into one
    /// preview pixel.
    fn regenerate(&mut self, source: &TileManager, full_width: u32, full_height: u32) {
        if self.valid {
            return;
        }
        let sx = subsample_factor(full_width);
        let sy = subsample_factor(full_height);
        let pw = (full_width / sx).max(1);
        let ph = (full_height / sy).max(1);
        let bpp = self.bpp as usize;
        let mut buffer = vec![0u8; pw as usize * ph as usize * bpp];

        for py in 0..ph {
            for px in 0..pw {
                let mut accum = vec![0u32; bpp];
                let mut count = 0u32;
                for dy in 0..sy {
                    let y = py * sy + dy;
                    if y >= full_height {
                        continue;
                    }
                    for dx in 0..sx {
                        let x = px * sx + dx;
                        if x >= full_width {
                            continue;
                        }
                        if let Ok((tx, ty)) = source.tile_containing(x, y) {
                            if let Ok(handle) = source.get_tile(tx, ty, false, false) {
                                let geom = handle.geometry();
                                let local_x = x - geom.origin_x;
                                let local_y = y - geom.origin_y;
                                let offset = (local_y as usize * geom.rowstride())
                                    + (local_x as usize * bpp);
                                let data = handle.data();
                                for c in 0..bpp {
                                    accum[c] += data[offset + c] as u32;
                                }
                                count += 1;
                            }
                        }
                    }
                }
                if count > 0 {
                    let out_offset = (py as usize * pw as usize + px as usize) * bpp;
                    for c in 0..bpp {
                        buffer[out_offset + c] = (accum[c] / count) as u8;
                    }
                }
            }
        }

        self.width = pw;
        self.height = ph;
        self.buffer = buffer;
        self.valid = true;
    }
}

/// Fields shared by every drawable kind: layers, layer masks, and channels.
pub struct DrawableHeader {
    pub owner: ImageId,
    pub name: String,
    pub visible: bool,
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
    pub tiles: TileManager,
    pub preview: Preview,
}

impl DrawableHeader {
    pub fn new(
        owner: ImageId,
        name: impl Into<String>,
        width: u32,
        height: u32,
        pixel_type: PixelType,
    ) -> Result<Self, DrawableError> {
        if width == 0 || height == 0 {
            return Err(DrawableError::InvalidArgument);
        }
        let tiles = TileManager::new(width, height, pixel_type.bytes_per_pixel())?;
        Ok(Self {
            owner,
            name: name.into(),
            visible: true,
            offset_x: 0,
            offset_y: 0,
            width,
            height,
            pixel_type,
            tiles,
            preview: Preview::new(pixel_type.bytes_per_pixel()),
        })
    }

    pub fn set_validator(&mut self, validator: Option<Validator>) {
        self.tiles.set_validator(validator);
    }

    /// Every mutating operation routes its rectangle-of-effect through
    /// here: it clips to the drawable's own bounds and marks the preview
    /// stale.
    pub fn mark_dirty(&mut self, _rect: Rect) {
        self.preview.invalidate();
    }

    pub fn full_rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    pub fn region(&self, rect: Rect, writable: bool) -> Result<PixelRegion<'_>, DrawableError> {
        let clipped = rect.clipped_to(self.width, self.height);
        Ok(PixelRegion::new(&self.tiles, clipped, writable)?)
    }

    pub fn preview(&mut self) -> &Preview {
        self.preview.regenerate(&self.tiles, self.width, self.height);
        &self.preview
    }
}

/// One run of a boundary trace: a horizontal or vertical segment between
/// two lattice points, the unit the marching-squares walk emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundarySegment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawable_header_rejects_zero_dimensions() {
        let owner = ImageId::default();
        assert_eq!(
            DrawableHeader::new(owner, "layer", 0, 10, PixelType::Rgba).unwrap_err(),
            DrawableError::InvalidArgument
        );
    }

    #[test]
    fn pixel_type_with_alpha_adds_a_channel() {
        assert_eq!(PixelType::Rgb.with_alpha(), PixelType::Rgba);
        assert_eq!(PixelType::Gray.with_alpha(), PixelType::GrayAlpha);
        assert_eq!(PixelType::Rgba.with_alpha(), PixelType::Rgba);
    }

    #[test]
    fn preview_regenerates_lazily_and_caches() {
        let owner = ImageId::default();
        let mut header =
            DrawableHeader::new(owner, "layer", 256, 256, PixelType::Gray).unwrap();
        {
            let region = header.region(header.full_rect(), true).unwrap();
            for chunk in region.iter() {
                for row in 0..chunk.height() {
                    chunk.row_mut(row).fill(200);
                }
            }
        }
        header.mark_dirty(header.full_rect());
        let preview = header.preview();
        assert!(preview.is_valid());
        assert!(preview.width() > 0 && preview.width() < 256);
        assert!(preview.data().iter().all(|&b| b == 200));
    }

    #[test]
    fn subsample_factor_grows_with_drawable_size() {
        assert_eq!(subsample_factor(64), 1);
        assert!(subsample_factor(4096) >= 1);
    }
}
