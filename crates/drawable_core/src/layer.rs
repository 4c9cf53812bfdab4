use pixel_region::{Rect, register_regions};

use crate::{BlendMode, ChannelId, DrawableError, DrawableHeader, ImageId, LayerId, PixelType};

/// Identifies whichever drawable a floating selection is currently glued
/// to: either a layer or a channel (selection masks can be floated too).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatTarget {
    Layer(LayerId),
    Channel(ChannelId),
}

/// State carried by a layer while it is a floating selection: its own
/// backing-store tiles, a one-way reference to the drawable it will
/// eventually be anchored or converted against, and whether it has ever
/// been composited onto that target yet (`initial`).
pub struct FloatingSelRecord {
    pub backing_store: tile_store::TileManager,
    pub target: FloatTarget,
    pub initial: bool,
    pub boundary: Option<Vec<crate::BoundarySegment>>,
}

/// Which way `Layer::apply_mask` resolves an attached mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMaskMode {
    Apply,
    Discard,
}

/// A grayscale mask of identical extents to the layer it belongs to.
pub struct LayerMask {
    pub header: DrawableHeader,
}

impl LayerMask {
    pub fn new(owner: ImageId, width: u32, height: u32) -> Result<Self, DrawableError> {
        Ok(Self {
            header: DrawableHeader::new(owner, "mask", width, height, PixelType::Gray)?,
        })
    }
}

pub struct Layer {
    pub header: DrawableHeader,
    pub opacity: u8,
    pub blend_mode: BlendMode,
    pub linked: bool,
    pub preserve_alpha: bool,
    pub apply_mask: bool,
    pub edit_mask: bool,
    pub show_mask: bool,
    pub mask: Option<LayerMask>,
    pub floating_sel: Option<FloatingSelRecord>,
}

impl Layer {
    pub fn new(
        owner: ImageId,
        name: impl Into<String>,
        width: u32,
        height: u32,
        pixel_type: PixelType,
    ) -> Result<Self, DrawableError> {
        Ok(Self {
            header: DrawableHeader::new(owner, name, width, height, pixel_type)?,
            opacity: 255,
            blend_mode: BlendMode::Normal,
            linked: false,
            preserve_alpha: false,
            apply_mask: true,
            edit_mask: false,
            show_mask: false,
            mask: None,
            floating_sel: None,
        })
    }

    /// Deep copy: new tile storage, pixel contents duplicated, mask
    /// duplicated if present. Never carries over a floating-sel record.
    pub fn copy(&self, new_owner: ImageId) -> Result<Layer, DrawableError> {
        let mut out = Layer::new(
            new_owner,
            format!("{} copy", self.header.name),
            self.header.width,
            self.header.height,
            self.header.pixel_type,
        )?;
        out.header.offset_x = self.header.offset_x;
        out.header.offset_y = self.header.offset_y;
        out.opacity = self.opacity;
        out.blend_mode = self.blend_mode;
        out.linked = self.linked;
        out.preserve_alpha = self.preserve_alpha;
        out.apply_mask = self.apply_mask;
        out.edit_mask = self.edit_mask;
        out.show_mask = self.show_mask;
        copy_pixels(&self.header, &mut out.header)?;
        if let Some(mask) = &self.mask {
            let mut new_mask = LayerMask::new(new_owner, mask.header.width, mask.header.height)?;
            copy_pixels(&mask.header, &mut new_mask.header)?;
            out.mask = Some(new_mask);
        }
        Ok(out)
    }

    /// Moves the layer (and its mask, lock-step) by `(dx, dy)` in image
    /// space. Pixel storage is untouched; only the offset moves.
    pub fn translate(&mut self, dx: i32, dy: i32) {
        self.header.offset_x += dx;
        self.header.offset_y += dy;
        if let Some(mask) = &mut self.mask {
            mask.header.offset_x += dx;
            mask.header.offset_y += dy;
        }
        self.header.preview.invalidate();
    }

    /// Extends or crops the layer's own canvas to `(new_width,
    /// new_height)` around reference point `(offx, offy)`: existing pixel
    /// `(x, y)` lands at `(x + offx, y + offy)` in the resized canvas, and
    /// anything that falls outside it is dropped. Newly introduced area is
    /// left transparent if the layer has an alpha channel, else filled
    /// with `fill` (one pixel's worth of bytes in the layer's own pixel
    /// format).
    /// Returns the layer's previous `DrawableHeader` so callers that track
    /// undo (`Image::layer_resize`) can swap it back in later.
    pub fn resize(&mut self, new_width: u32, new_height: u32, offx: i32, offy: i32, fill: &[u8]) -> Result<DrawableHeader, DrawableError> {
        let mut fresh = DrawableHeader::new(
            self.header.owner,
            self.header.name.clone(),
            new_width,
            new_height,
            self.header.pixel_type,
        )?;
        if !self.header.pixel_type.has_alpha() {
            fill_header(&mut fresh, fill)?;
        }
        copy_pixels_offset(&self.header, &mut fresh, offx, offy)?;
        let prior = std::mem::replace(&mut self.header, fresh);
        if let Some(mask) = &mut self.mask {
            let mut fresh_mask = DrawableHeader::new(
                mask.header.owner,
                mask.header.name.clone(),
                new_width,
                new_height,
                mask.header.pixel_type,
            )?;
            copy_pixels_offset(&mask.header, &mut fresh_mask, offx, offy)?;
            mask.header = fresh_mask;
        }
        Ok(prior)
    }

    /// Nearest-neighbor resample to `(new_width, new_height)`.
    pub fn scale(&mut self, new_width: u32, new_height: u32) -> Result<(), DrawableError> {
        if new_width == 0 || new_height == 0 {
            return Err(DrawableError::InvalidArgument);
        }
        let mut fresh = DrawableHeader::new(
            self.header.owner,
            self.header.name.clone(),
            new_width,
            new_height,
            self.header.pixel_type,
        )?;
        scale_pixels(&self.header, &mut fresh)?;
        self.header = fresh;
        Ok(())
    }

    pub fn add_alpha(&mut self) -> Result<(), DrawableError> {
        if self.header.pixel_type.has_alpha() {
            return Ok(());
        }
        let new_type = self.header.pixel_type.with_alpha();
        let mut fresh = DrawableHeader::new(
            self.header.owner,
            self.header.name.clone(),
            self.header.width,
            self.header.height,
            new_type,
        )?;
        let old_bpp = self.header.pixel_type.bytes_per_pixel() as usize;
        let region_src = self.header.region(self.header.full_rect(), false)?;
        let region_dst = fresh.region(fresh.full_rect(), true)?;
        let mut cursor = register_regions(&[&region_src, &region_dst])?;
        while let Some(chunks) = cursor.process() {
            let (src, dst) = (&chunks[0], &chunks[1]);
            let new_bpp = new_type.bytes_per_pixel() as usize;
            for row in 0..src.height() {
                let src_row = src.row(row);
                let mut dst_row = dst.row_mut(row);
                for x in 0..src.width() as usize {
                    for c in 0..old_bpp {
                        dst_row[x * new_bpp + c] = src_row[x * old_bpp + c];
                    }
                    dst_row[x * new_bpp + old_bpp] = 255;
                }
            }
        }
        self.header = fresh;
        Ok(())
    }

    pub fn add_mask(&mut self) -> Result<(), DrawableError> {
        if self.mask.is_some() {
            return Err(DrawableError::InvalidArgument);
        }
        self.mask = Some(LayerMask::new(
            self.header.owner,
            self.header.width,
            self.header.height,
        )?);
        Ok(())
    }

    /// Resolves the layer's mask one way or the other: `Apply` multiplies
    /// it into alpha (promoting the layer to an alpha type first if
    /// needed), `Discard` just drops it unapplied. Either way the mask is
    /// gone afterward.
    pub fn apply_mask(&mut self, mode: ApplyMaskMode) -> Result<(), DrawableError> {
        let mask = self.mask.take().ok_or(DrawableError::InvalidArgument)?;
        if mode == ApplyMaskMode::Discard {
            return Ok(());
        }
        if !self.header.pixel_type.has_alpha() {
            self.add_alpha()?;
        }
        let bpp = self.header.pixel_type.bytes_per_pixel() as usize;
        let alpha_offset = bpp - 1;
        let region = self.header.region(self.header.full_rect(), true)?;
        let mask_region = mask.header.region(mask.header.full_rect(), false)?;
        let mut cursor = register_regions(&[&region, &mask_region])?;
        while let Some(chunks) = cursor.process() {
            let (layer_chunk, mask_chunk) = (&chunks[0], &chunks[1]);
            for row in 0..layer_chunk.height() {
                let mask_row = mask_chunk.row(row);
                let mut layer_row = layer_chunk.row_mut(row);
                for x in 0..layer_chunk.width() as usize {
                    let m = mask_row[x] as u32;
                    let a = layer_row[x * bpp + alpha_offset] as u32;
                    layer_row[x * bpp + alpha_offset] = ((a * m) / 255) as u8;
                }
            }
        }
        self.header.mark_dirty(Rect::new(0, 0, self.header.width, self.header.height));
        Ok(())
    }
}

/// Fills every pixel of `header` with `fill` (one pixel's worth of bytes).
fn fill_header(header: &mut DrawableHeader, fill: &[u8]) -> Result<(), DrawableError> {
    let bpp = header.pixel_type.bytes_per_pixel() as usize;
    if fill.len() != bpp {
        return Err(DrawableError::InvalidArgument);
    }
    let region = header.region(header.full_rect(), true)?;
    for chunk in region.iter() {
        for row in 0..chunk.height() {
            let mut data = chunk.row_mut(row);
            for x in 0..chunk.width() as usize {
                data[x * bpp..x * bpp + bpp].copy_from_slice(fill);
            }
        }
    }
    Ok(())
}

/// Copies `src` into `dst` such that `src`'s pixel `(x, y)` lands at
/// `(x + offx, y + offy)` in `dst`; the overlap is clipped to both
/// extents. Used by `resize`, which re-anchors a layer's content around
/// an arbitrary reference point instead of always aligning at `(0, 0)`.
fn copy_pixels_offset(src: &DrawableHeader, dst: &mut DrawableHeader, offx: i32, offy: i32) -> Result<(), DrawableError> {
    let sx0 = (-offx).max(0);
    let sy0 = (-offy).max(0);
    let sx1 = (src.width as i32).min(dst.width as i32 - offx);
    let sy1 = (src.height as i32).min(dst.height as i32 - offy);
    if sx1 <= sx0 || sy1 <= sy0 {
        return Ok(());
    }
    let w = (sx1 - sx0) as u32;
    let h = (sy1 - sy0) as u32;
    let src_rect = Rect::new(sx0 as u32, sy0 as u32, w, h);
    let dst_rect = Rect::new((sx0 + offx) as u32, (sy0 + offy) as u32, w, h);
    let region_src = src.region(src_rect, false)?;
    let region_dst = dst.region(dst_rect, true)?;
    let mut cursor = register_regions(&[&region_src, &region_dst])?;
    while let Some(chunks) = cursor.process() {
        let (s, d) = (&chunks[0], &chunks[1]);
        for row in 0..s.height() {
            d.row_mut(row).copy_from_slice(&s.row(row));
        }
    }
    Ok(())
}

fn copy_pixels(src: &DrawableHeader, dst: &mut DrawableHeader) -> Result<(), DrawableError> {
    let w = src.width.min(dst.width);
    let h = src.height.min(dst.height);
    if w == 0 || h == 0 {
        return Ok(());
    }
    let region_src = src.region(Rect::new(0, 0, w, h), false)?;
    let region_dst = dst.region(Rect::new(0, 0, w, h), true)?;
    let mut cursor = register_regions(&[&region_src, &region_dst])?;
    while let Some(chunks) = cursor.process() {
        let (s, d) = (&chunks[0], &chunks[1]);
        for row in 0..s.height() {
            d.row_mut(row).copy_from_slice(&s.row(row));
        }
    }
    Ok(())
}

fn scale_pixels(src: &DrawableHeader, dst: &mut DrawableHeader) -> Result<(), DrawableError> {
    let bpp = src.pixel_type.bytes_per_pixel() as usize;
    let (sw, sh) = (src.width, src.height);
    let (dw, dh) = (dst.width, dst.height);
    let region_dst = dst.region(dst.full_rect(), true)?;
    for chunk in region_dst.iter() {
        for row in 0..chunk.height() {
            let dst_y = chunk.image_y + row;
            let src_y = (dst_y as u64 * sh as u64 / dh as u64) as u32;
            let (tile_y_src, ..) = src.tiles.tile_containing(0, src_y.min(sh - 1))?;
            let mut out_row = chunk.row_mut(row);
            for x in 0..chunk.width() {
                let dst_x = chunk.image_x + x;
                let src_x = (dst_x as u64 * sw as u64 / dw as u64) as u32;
                let (tile_x_src, _) = src.tiles.tile_containing(src_x.min(sw - 1), 0)?;
                let handle = src.tiles.get_tile(tile_x_src, tile_y_src, false, false)?;
                let geom = handle.geometry();
                let lx = src_x.min(sw - 1) - geom.origin_x;
                let ly = src_y.min(sh - 1) - geom.origin_y;
                let data = handle.data();
                let off = (ly as usize * geom.rowstride()) + (lx as usize * bpp);
                for c in 0..bpp {
                    out_row[x as usize * bpp + c] = data[off + c];
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelType;

    #[test]
    fn discard_mask_drops_it_without_touching_alpha() {
        let mut layer = Layer::new(ImageId::default(), "l", 4, 4, PixelType::Rgb).unwrap();
        layer.add_mask().unwrap();
        layer.apply_mask(ApplyMaskMode::Discard).unwrap();
        assert!(layer.mask.is_none());
        assert_eq!(layer.header.pixel_type, PixelType::Rgb);
    }

    #[test]
    fn new_layer_starts_fully_opaque_and_normal_blend() {
        let layer = Layer::new(ImageId::default(), "l", 16, 16, PixelType::Rgba).unwrap();
        assert_eq!(layer.opacity, 255);
        assert_eq!(layer.blend_mode, BlendMode::Normal);
    }

    #[test]
    fn translate_moves_layer_and_mask_lock_step() {
        let mut layer = Layer::new(ImageId::default(), "l", 16, 16, PixelType::Rgba).unwrap();
        layer.add_mask().unwrap();
        layer.translate(4, -2);
        assert_eq!(layer.header.offset_x, 4);
        assert_eq!(layer.header.offset_y, -2);
        assert_eq!(layer.mask.as_ref().unwrap().header.offset_x, 4);
        assert_eq!(layer.mask.as_ref().unwrap().header.offset_y, -2);
    }

    #[test]
    fn add_alpha_preserves_existing_pixels_and_sets_full_alpha() {
        let mut layer = Layer::new(ImageId::default(), "l", 8, 8, PixelType::Rgb).unwrap();
        {
            let region = layer.header.region(layer.header.full_rect(), true).unwrap();
            for chunk in region.iter() {
                for row in 0..chunk.height() {
                    chunk.row_mut(row).fill(100);
                }
            }
        }
        layer.add_alpha().unwrap();
        assert_eq!(layer.header.pixel_type, PixelType::Rgba);
        let region = layer.header.region(layer.header.full_rect(), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                let data = chunk.row(row);
                for px in data.chunks(4) {
                    assert_eq!(px, [100, 100, 100, 255]);
                }
            }
        }
    }

    #[test]
    fn apply_mask_multiplies_alpha_and_drops_mask() {
        let mut layer = Layer::new(ImageId::default(), "l", 8, 8, PixelType::Rgba).unwrap();
        layer.add_mask().unwrap();
        {
            let region = layer.header.region(layer.header.full_rect(), true).unwrap();
            for chunk in region.iter() {
                for row in 0..chunk.height() {
                    chunk.row_mut(row).fill(255);
                }
            }
            let mask = layer.mask.as_ref().unwrap();
            let mask_region = mask.header.region(mask.header.full_rect(), true).unwrap();
            for chunk in mask_region.iter() {
                for row in 0..chunk.height() {
                    chunk.row_mut(row).fill(128);
                }
            }
        }
        layer.apply_mask(ApplyMaskMode::Apply).unwrap();
        assert!(layer.mask.is_none());
        let region = layer.header.region(layer.header.full_rect(), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                let data = chunk.row(row);
                for px in data.chunks(4) {
                    assert_eq!(px[3], (255u32 * 128 / 255) as u8);
                }
            }
        }
    }

    #[test]
    fn resize_crops_pixels_outside_the_new_canvas() {
        let mut layer = Layer::new(ImageId::default(), "l", 8, 8, PixelType::Gray).unwrap();
        {
            let region = layer.header.region(layer.header.full_rect(), true).unwrap();
            for chunk in region.iter() {
                for row in 0..chunk.height() {
                    chunk.row_mut(row).fill(42);
                }
            }
        }
        layer.resize(4, 4, 0, 0, &[0]).unwrap();
        assert_eq!(layer.header.width, 4);
        let region = layer.header.region(layer.header.full_rect(), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                assert!(chunk.row(row).iter().all(|&b| b == 42));
            }
        }
    }

    #[test]
    fn resize_around_reference_point_shifts_content() {
        let mut layer = Layer::new(ImageId::default(), "l", 4, 4, PixelType::Gray).unwrap();
        {
            let region = layer.header.region(layer.header.full_rect(), true).unwrap();
            for chunk in region.iter() {
                for row in 0..chunk.height() {
                    chunk.row_mut(row).fill(9);
                }
            }
        }
        layer.resize(8, 8, 2, 2, &[0]).unwrap();
        let region = layer.header.region(Rect::new(2, 2, 4, 4), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                assert!(chunk.row(row).iter().all(|&b| b == 9));
            }
        }
        let region = layer.header.region(Rect::new(0, 0, 2, 8), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                assert!(chunk.row(row).iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn resize_fills_new_area_with_background_when_no_alpha() {
        let mut layer = Layer::new(ImageId::default(), "l", 2, 2, PixelType::Rgb).unwrap();
        layer.resize(4, 4, 0, 0, &[10, 20, 30]).unwrap();
        let region = layer.header.region(Rect::new(2, 0, 2, 4), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                for px in chunk.row(row).chunks(3) {
                    assert_eq!(px, [10, 20, 30]);
                }
            }
        }
    }
}
