//! The floating-selection protocol (§4.7): `attach`/`rigor`/`relax`/
//! `composite`/`anchor`/`to_layer`, gluing a floating [`Layer`] to an
//! underlying drawable through a backing store that preserves the pixels
//! the float currently obscures.

use std::cell::RefCell;
use std::fmt;

use drawable_core::{DrawableHeader, FloatingSelRecord, Layer, LayerId, PixelType};
use pixel_region::{PixelRegion, Rect};
use tile_store::TileManager;
use undo_engine::UndoKind;

pub use drawable_core::FloatTarget;

use crate::blend::{blend_rgb, pixel_to_rgb, read_rect_bytes, write_rect_bytes, write_rgb_to_pixel};
use crate::undo_records::{FsRelaxPayload, FsRigorPayload, FsToLayerPayload, PixelPatchPayload, TargetCell};
use crate::{ColorMap, Image, ImageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatingSelError {
    NotFloating,
    TypeMismatch,
    NotFound,
}

impl fmt::Display for FloatingSelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloatingSelError::NotFloating => write!(f, "layer is not a floating selection"),
            FloatingSelError::TypeMismatch => {
                write!(f, "cannot create a new layer from a floating selection on a channel or mask")
            }
            FloatingSelError::NotFound => write!(f, "no such layer"),
        }
    }
}

impl std::error::Error for FloatingSelError {}

impl From<FloatingSelError> for ImageError {
    fn from(e: FloatingSelError) -> Self {
        match e {
            FloatingSelError::NotFloating | FloatingSelError::NotFound => ImageError::IllegalState,
            FloatingSelError::TypeMismatch => ImageError::TypeMismatch,
        }
    }
}

fn read_tilemanager_rect(tm: &TileManager, rect: Rect) -> Vec<u8> {
    let bpp = tm.bpp() as usize;
    let mut buf = vec![0u8; rect.w as usize * rect.h as usize * bpp];
    if rect.is_empty() {
        return buf;
    }
    if let Ok(region) = PixelRegion::new(tm, rect, false) {
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                let local_y = (chunk.image_y + row - rect.y) as usize;
                let local_x0 = (chunk.image_x - rect.x) as usize;
                let data = chunk.row(row);
                let dst_off = (local_y * rect.w as usize + local_x0) * bpp;
                buf[dst_off..dst_off + data.len()].copy_from_slice(&data);
            }
        }
    }
    buf
}

fn write_tilemanager_rect(tm: &TileManager, rect: Rect, bytes: &[u8]) {
    let bpp = tm.bpp() as usize;
    if rect.is_empty() {
        return;
    }
    if let Ok(region) = PixelRegion::new(tm, rect, true) {
        for chunk in region.iter() {
            let len = chunk.width() as usize * bpp;
            for row in 0..chunk.height() {
                let local_y = (chunk.image_y + row - rect.y) as usize;
                let local_x0 = (chunk.image_x - rect.x) as usize;
                let src_off = (local_y * rect.w as usize + local_x0) * bpp;
                chunk.row_mut(row).copy_from_slice(&bytes[src_off..src_off + len]);
            }
        }
    }
}

/// The target-space rectangle a float at `(ox, oy, w, h)` currently
/// covers. Negative offsets are clamped to the origin: every spec
/// scenario keeps floats within their target's extent, and this keeps the
/// backing store's coordinate frame a plain `(0, 0, w, h)` throughout.
fn float_target_rect(ox: i32, oy: i32, w: u32, h: u32) -> Rect {
    Rect::new(ox.max(0) as u32, oy.max(0) as u32, w, h)
}

/// Blends `layer`'s own pixels over `target`'s pixels within `rect`
/// (target-space), using the layer's opacity and blend mode — the same
/// per-pixel math [`crate::blend::composite_layer`] uses to build the
/// projection, but writing directly into another drawable's native pixel
/// format instead of an RGBA8 canvas. Per invariant I-2 a floating
/// selection's pixel type always matches its target's.
fn composite_layer_onto_target(
    layer: &Layer,
    target: &mut DrawableHeader,
    colormap: &Option<ColorMap>,
    rect: Rect,
) {
    let bpp = layer.header.pixel_type.bytes_per_pixel() as usize;
    let has_alpha = layer.header.pixel_type.has_alpha();
    let opacity_fraction = layer.opacity as f64 / 255.0;
    let layer_rect = Rect::new(
        (rect.x as i32 - layer.header.offset_x).max(0) as u32,
        (rect.y as i32 - layer.header.offset_y).max(0) as u32,
        rect.w,
        rect.h,
    );
    let (Ok(src_region), Ok(dst_region)) = (layer.header.region(layer_rect, false), target.region(rect, true))
    else {
        return;
    };
    let Ok(mut cursor) = pixel_region::register_regions(&[&src_region, &dst_region]) else { return };
    while let Some(chunks) = cursor.process() {
        let (s, d) = (&chunks[0], &chunks[1]);
        for row in 0..s.height() {
            let src_row = s.row(row);
            let mut dst_row = d.row_mut(row);
            for x in 0..s.width() as usize {
                let px = &src_row[x * bpp..x * bpp + bpp];
                let (rgb, alpha_byte) = pixel_to_rgb(px, layer.header.pixel_type, colormap);
                let alpha_fraction = (if has_alpha { alpha_byte as f64 / 255.0 } else { 1.0 }) * opacity_fraction;
                if alpha_fraction <= 0.0 {
                    continue;
                }
                let dst_px = &mut dst_row[x * bpp..x * bpp + bpp];
                let (dst_rgb, dst_alpha_byte) = pixel_to_rgb(dst_px, target.pixel_type, colormap);
                let base = [dst_rgb[0] as f64 / 255.0, dst_rgb[1] as f64 / 255.0, dst_rgb[2] as f64 / 255.0];
                let top = [rgb[0] as f64 / 255.0, rgb[1] as f64 / 255.0, rgb[2] as f64 / 255.0];
                let blended = blend_rgb(base, top, layer.blend_mode);
                let dst_a = dst_alpha_byte as f64 / 255.0;
                let out_a = alpha_fraction + dst_a * (1.0 - alpha_fraction);
                let mut out_rgb = [0u8; 3];
                for c in 0..3 {
                    let out_c = if out_a > 0.0 {
                        (blended[c] * alpha_fraction + base[c] * dst_a * (1.0 - alpha_fraction)) / out_a
                    } else {
                        0.0
                    };
                    out_rgb[c] = (out_c * 255.0).round().clamp(0.0, 255.0) as u8;
                }
                let out_alpha = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
                write_rgb_to_pixel(dst_px, target.pixel_type, out_rgb, out_alpha, colormap);
            }
        }
    }
    target.mark_dirty(rect);
}

impl Image {
    fn target_cell(&self, target: FloatTarget) -> Option<TargetCell> {
        TargetCell::from_target(&self.layers, &self.channels, target)
    }

    /// Attaches `layer` as a floating selection glued to `target`. Any
    /// float already active is anchored first (§4.7).
    pub fn floating_sel_attach(&mut self, mut layer: Layer, target: FloatTarget) -> Result<LayerId, ImageError> {
        if let Some(existing) = self.floating_selection() {
            self.floating_sel_anchor(existing)?;
        }
        let target_cell = self.target_cell(target).ok_or(ImageError::NotFound)?;
        let bpp = target_cell.with_header(|h| h.pixel_type.bytes_per_pixel());
        let backing = TileManager::new(layer.header.width, layer.header.height, bpp)?;
        layer.floating_sel = Some(FloatingSelRecord {
            backing_store: backing,
            target,
            initial: true,
            boundary: None,
        });
        let id = self.add_layer(layer);
        *self.floating_sel.borrow_mut() = Some(id);
        self.floating_sel_rigor(id, true)?;
        Ok(id)
    }

    /// Snapshots the target rectangle the float currently obscures into
    /// its backing store (§4.7 "rigor").
    pub fn floating_sel_rigor(&mut self, layer_id: LayerId, push_undo: bool) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        let (target, ox, oy, w, h) = {
            let layer = cell.borrow();
            let record = layer.floating_sel.as_ref().ok_or(FloatingSelError::NotFloating)?;
            (record.target, layer.header.offset_x, layer.header.offset_y, layer.header.width, layer.header.height)
        };
        let target_cell = self.target_cell(target).ok_or(ImageError::NotFound)?;
        let rect = float_target_rect(ox, oy, w, h);
        let backing_rect = Rect::new(0, 0, w, h);

        let target_bytes = target_cell.with_header(|hdr| read_rect_bytes(hdr, rect));
        let backing_before = {
            let layer = cell.borrow();
            let record = layer.floating_sel.as_ref().expect("checked above");
            read_tilemanager_rect(&record.backing_store, backing_rect)
        };
        {
            let layer = cell.borrow();
            let record = layer.floating_sel.as_ref().expect("checked above");
            write_tilemanager_rect(&record.backing_store, backing_rect, &target_bytes);
        }
        let prior_initial = {
            let mut layer = cell.borrow_mut();
            let record = layer.floating_sel.as_mut().expect("checked above");
            std::mem::replace(&mut record.initial, true)
        };

        if push_undo {
            self.undo.push(
                UndoKind::FsRigorUndo,
                Some(Box::new(FsRigorPayload {
                    layer: cell.clone(),
                    snapshot: RefCell::new(backing_before),
                    initial: prior_initial,
                })),
                (w * h) as usize,
                true,
            );
        }
        Ok(())
    }

    /// If the float has been composited since its last rigor (`initial ==
    /// false`), restores the backing store's contents onto the target
    /// (§4.7 "relax").
    pub fn floating_sel_relax(&mut self, layer_id: LayerId, push_undo: bool) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        let (target, ox, oy, w, h, initial) = {
            let layer = cell.borrow();
            let record = layer.floating_sel.as_ref().ok_or(FloatingSelError::NotFloating)?;
            (
                record.target,
                layer.header.offset_x,
                layer.header.offset_y,
                layer.header.width,
                layer.header.height,
                record.initial,
            )
        };
        if initial {
            return Ok(());
        }
        let target_cell = self.target_cell(target).ok_or(ImageError::NotFound)?;
        let rect = float_target_rect(ox, oy, w, h);
        let backing_rect = Rect::new(0, 0, w, h);

        let before = target_cell.with_header(|hdr| read_rect_bytes(hdr, rect));
        let backing_bytes = {
            let layer = cell.borrow();
            let record = layer.floating_sel.as_ref().expect("checked above");
            read_tilemanager_rect(&record.backing_store, backing_rect)
        };
        target_cell.with_header_mut(|hdr| write_rect_bytes(hdr, rect, &backing_bytes));
        {
            let mut layer = cell.borrow_mut();
            let record = layer.floating_sel.as_mut().expect("checked above");
            record.initial = true;
        }

        if push_undo {
            self.undo.push(
                UndoKind::FsRelaxUndo,
                Some(Box::new(FsRelaxPayload {
                    layer: cell.clone(),
                    target: target_cell,
                    rect,
                    snapshot: RefCell::new(before),
                    initial: false,
                })),
                (rect.w * rect.h) as usize,
                true,
            );
        }
        Ok(())
    }

    /// Blends the float onto its target at its current position (§4.7
    /// "composite"). Restores from the backing store first if the float
    /// had already been composited elsewhere, then (if visible)
    /// re-snapshots the freshly touched rectangle and blends the float's
    /// pixels over it through the normal blend pipeline.
    pub fn floating_sel_composite(&mut self, layer_id: LayerId, push_undo: bool) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        let (target, ox, oy, w, h, visible, initial) = {
            let layer = cell.borrow();
            let record = layer.floating_sel.as_ref().ok_or(FloatingSelError::NotFloating)?;
            (
                record.target,
                layer.header.offset_x,
                layer.header.offset_y,
                layer.header.width,
                layer.header.height,
                layer.header.visible,
                record.initial,
            )
        };
        let target_cell = self.target_cell(target).ok_or(ImageError::NotFound)?;
        let rect = float_target_rect(ox, oy, w, h);
        let backing_rect = Rect::new(0, 0, w, h);

        let before = target_cell.with_header(|hdr| read_rect_bytes(hdr, rect));

        if !initial {
            let backing_bytes = {
                let layer = cell.borrow();
                let record = layer.floating_sel.as_ref().expect("checked above");
                read_tilemanager_rect(&record.backing_store, backing_rect)
            };
            target_cell.with_header_mut(|hdr| write_rect_bytes(hdr, rect, &backing_bytes));
        }

        if visible {
            let current = target_cell.with_header(|hdr| read_rect_bytes(hdr, rect));
            {
                let layer = cell.borrow();
                let record = layer.floating_sel.as_ref().expect("checked above");
                write_tilemanager_rect(&record.backing_store, backing_rect, &current);
            }
            let colormap = self.colormap.borrow().clone();
            target_cell.with_header_mut(|hdr| {
                let layer = cell.borrow();
                composite_layer_onto_target(&layer, hdr, &colormap, rect);
            });
        }

        {
            let mut layer = cell.borrow_mut();
            let record = layer.floating_sel.as_mut().expect("checked above");
            record.initial = false;
        }

        if push_undo {
            self.undo.push(
                UndoKind::ImageUndo,
                Some(Box::new(PixelPatchPayload {
                    target: target_cell,
                    rect,
                    snapshot: RefCell::new(before),
                })),
                (rect.w * rect.h) as usize,
                true,
            );
        }
        Ok(())
    }

    /// Anchors the float: relaxes, composites one final time, removes the
    /// layer, and clears `floating_sel`, all inside one `FS_ANCHOR_UNDO`
    /// group (§4.7 "anchor").
    pub fn floating_sel_anchor(&mut self, layer_id: LayerId) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        if cell.borrow().floating_sel.is_none() {
            return Err(FloatingSelError::NotFloating.into());
        }
        self.undo.group_start(UndoKind::FsAnchorUndo);
        self.floating_sel_relax(layer_id, true)?;
        self.floating_sel_composite(layer_id, true)?;
        self.remove_layer(layer_id)?;
        *self.floating_sel.borrow_mut() = None;
        self.selection.borrow_mut().invalidate_caches();
        self.undo.group_end();
        Ok(())
    }

    /// Removes the float without compositing it: relaxes (restoring the
    /// target to its pre-paste pixels) and discards the layer.
    pub fn floating_sel_remove(&mut self, layer_id: LayerId) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        if cell.borrow().floating_sel.is_none() {
            return Err(FloatingSelError::NotFloating.into());
        }
        self.floating_sel_relax(layer_id, true)?;
        self.remove_layer(layer_id)?;
        *self.floating_sel.borrow_mut() = None;
        self.selection.borrow_mut().invalidate_caches();
        Ok(())
    }

    /// Promotes a float to an ordinary layer: relaxes once, then detaches
    /// its [`FloatingSelRecord`] and clears the image's floating-sel
    /// pointer, pushing `FS_TO_LAYER_UNDO` carrying the detached record.
    /// Rejected (`TypeMismatch`) when the float's target is a channel.
    pub fn floating_sel_to_layer(&mut self, layer_id: LayerId) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        {
            let layer = cell.borrow();
            let record = layer.floating_sel.as_ref().ok_or(FloatingSelError::NotFloating)?;
            if matches!(record.target, FloatTarget::Channel(_)) {
                return Err(FloatingSelError::TypeMismatch.into());
            }
        }
        self.floating_sel_relax(layer_id, true)?;
        let detached = {
            let mut layer = cell.borrow_mut();
            layer.floating_sel.take()
        };
        let pointer_prior = *self.floating_sel.borrow();
        *self.floating_sel.borrow_mut() = None;
        self.undo.push(
            UndoKind::FsToLayerUndo,
            Some(Box::new(FsToLayerPayload {
                layer: cell.clone(),
                floating_sel: self.floating_sel.clone(),
                layer_id,
                detached: RefCell::new(detached),
                pointer_prior,
            })),
            0,
            true,
        );
        Ok(())
    }

    /// §4.8: extracts a cut of `drawable` through the current selection
    /// into a fresh layer and attaches it as a floating selection, inside
    /// a `FLOAT_MASK` group. Fails `EmptyRegion` when the selection does
    /// not intersect the drawable. The selection mask itself is left
    /// unchanged; the float's own boundary becomes the displayed
    /// selection.
    pub fn mask_float(&mut self, drawable_id: LayerId, offx: i32, offy: i32) -> Result<LayerId, ImageError> {
        let cell = self.layer(drawable_id).ok_or(ImageError::NotFound)?;
        let (dw, dh, dox, doy, pixel_type) = {
            let layer = cell.borrow();
            (layer.header.width, layer.header.height, layer.header.offset_x, layer.header.offset_y, layer.header.pixel_type)
        };
        let drawable_rect = float_target_rect(dox, doy, dw, dh);
        let sel_bounds = self.selection.borrow_mut().bounds()?;
        let cut_rect = sel_bounds.intersect(drawable_rect);
        if cut_rect.is_empty() {
            return Err(ImageError::EmptyRegion);
        }

        self.undo.group_start(UndoKind::FloatMaskUndo);
        let mut float_layer = Layer::new(self.id, "Floating Selection", cut_rect.w, cut_rect.h, pixel_type)?;
        float_layer.header.offset_x = cut_rect.x as i32 + offx;
        float_layer.header.offset_y = cut_rect.y as i32 + offy;
        {
            let layer = cell.borrow();
            let local_rect = Rect::new(
                (cut_rect.x as i32 - dox).max(0) as u32,
                (cut_rect.y as i32 - doy).max(0) as u32,
                cut_rect.w,
                cut_rect.h,
            );
            let bytes = read_rect_bytes(&layer.header, local_rect);
            write_rect_bytes(&mut float_layer.header, Rect::new(0, 0, cut_rect.w, cut_rect.h), &bytes);
        }
        let id = self.floating_sel_attach(float_layer, FloatTarget::Layer(drawable_id))?;
        self.undo.group_end();
        Ok(id)
    }

    /// §4.9: extracts the selected pixels of `drawable` into a fresh
    /// [`TileManager`], optionally clearing them afterward. Bytes per
    /// pixel follow the target type: `Rgba` for RGB-family drawables,
    /// `GrayAlpha` for GRAY-family, `IndexedAlpha` when `keep_indexed` and
    /// the drawable is indexed, else `Rgba`. With no active selection the
    /// whole drawable is extracted.
    pub fn mask_extract(
        &mut self,
        drawable_id: LayerId,
        cut: bool,
        keep_indexed: bool,
    ) -> Result<TileManager, ImageError> {
        let cell = self.layer(drawable_id).ok_or(ImageError::NotFound)?;
        let (dw, dh, dox, doy, pixel_type) = {
            let layer = cell.borrow();
            (layer.header.width, layer.header.height, layer.header.offset_x, layer.header.offset_y, layer.header.pixel_type)
        };
        let drawable_rect = float_target_rect(dox, doy, dw, dh);
        let has_selection = !self.mask_is_empty();
        let extract_rect = if has_selection {
            let sel_bounds = self.selection.borrow_mut().bounds()?;
            let r = sel_bounds.intersect(drawable_rect);
            if r.is_empty() {
                return Err(ImageError::EmptyRegion);
            }
            r
        } else {
            drawable_rect
        };

        let out_type = match pixel_type {
            PixelType::Rgb | PixelType::Rgba => PixelType::Rgba,
            PixelType::Gray | PixelType::GrayAlpha => PixelType::GrayAlpha,
            PixelType::Indexed | PixelType::IndexedAlpha => {
                if keep_indexed {
                    PixelType::IndexedAlpha
                } else {
                    PixelType::Rgba
                }
            }
        };
        let local_rect = Rect::new(
            (extract_rect.x as i32 - dox).max(0) as u32,
            (extract_rect.y as i32 - doy).max(0) as u32,
            extract_rect.w,
            extract_rect.h,
        );
        let mut out = TileManager::new(extract_rect.w, extract_rect.h, out_type.bytes_per_pixel())?;
        {
            let layer = cell.borrow();
            copy_into_tilemanager(&layer.header, local_rect, &mut out, pixel_type, &self.colormap.borrow())?;
        }

        if cut {
            if has_selection && extract_rect == drawable_rect {
                self.remove_layer(drawable_id)?;
            } else {
                let before = {
                    let layer = cell.borrow();
                    read_rect_bytes(&layer.header, local_rect)
                };
                let zero = vec![0u8; before.len()];
                {
                    let mut layer = cell.borrow_mut();
                    write_rect_bytes(&mut layer.header, local_rect, &zero);
                }
                self.undo.push(
                    UndoKind::ImageUndo,
                    Some(Box::new(PixelPatchPayload {
                        target: TargetCell::Layer(cell.clone()),
                        rect: local_rect,
                        snapshot: RefCell::new(before),
                    })),
                    (local_rect.w * local_rect.h) as usize,
                    true,
                );
            }
        }
        Ok(out)
    }
}

/// Reads `local_rect` out of `src` (in `src`'s own pixel type) and writes
/// it into `out` (a fresh `TileManager` at `out`'s own, possibly wider,
/// pixel type), converting through RGB+alpha when the types differ.
fn copy_into_tilemanager(
    src: &DrawableHeader,
    local_rect: Rect,
    out: &mut TileManager,
    src_type: PixelType,
    colormap: &Option<ColorMap>,
) -> Result<(), ImageError> {
    let out_type_bpp = out.bpp() as usize;
    let src_bpp = src_type.bytes_per_pixel() as usize;
    let region_src = src.region(local_rect, false)?;
    let dst_rect = Rect::new(0, 0, local_rect.w, local_rect.h);
    let region_dst = PixelRegion::new(out, dst_rect, true)?;
    let mut cursor = pixel_region::register_regions(&[&region_src, &region_dst])?;
    let out_type = if out_type_bpp == 4 {
        PixelType::Rgba
    } else if out_type_bpp == 2 {
        PixelType::GrayAlpha
    } else {
        PixelType::IndexedAlpha
    };
    while let Some(chunks) = cursor.process() {
        let (s, d) = (&chunks[0], &chunks[1]);
        for row in 0..s.height() {
            let src_row = s.row(row);
            let mut dst_row = d.row_mut(row);
            for x in 0..s.width() as usize {
                let px = &src_row[x * src_bpp..x * src_bpp + src_bpp];
                let (rgb, alpha) = pixel_to_rgb(px, src_type, colormap);
                let dst_px = &mut dst_row[x * out_type_bpp..x * out_type_bpp + out_type_bpp];
                write_rgb_to_pixel(dst_px, out_type, rgb, alpha, colormap);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BaseType, Image};
    use drawable_core::{ImageId, PixelType};

    fn fill(layer: &Layer, value: u8) {
        let region = layer.header.region(layer.header.full_rect(), true).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                chunk.row_mut(row).fill(value);
            }
        }
    }

    #[test]
    fn attach_snapshots_obscured_pixels_into_the_backing_store() {
        let mut image = Image::new(ImageId::default(), 10, 10, BaseType::Rgb).unwrap();
        let mut base = Layer::new(image.id(), "base", 10, 10, PixelType::Rgba).unwrap();
        fill(&base, 7);
        let base_id = image.add_layer(base);

        let mut float = Layer::new(image.id(), "float", 4, 4, PixelType::Rgba).unwrap();
        float.header.offset_x = 3;
        float.header.offset_y = 3;
        fill(&float, 200);
        let float_id = image.floating_sel_attach(float, FloatTarget::Layer(base_id)).unwrap();

        assert_eq!(image.floating_selection(), Some(float_id));
        let cell = image.layer(float_id).unwrap();
        let layer = cell.borrow();
        let record = layer.floating_sel.as_ref().unwrap();
        let backing = read_tilemanager_rect(&record.backing_store, Rect::new(0, 0, 4, 4));
        assert!(backing.iter().all(|&b| b == 7));
    }

    #[test]
    fn anchor_blends_float_into_target_and_clears_floating_sel() {
        let mut image = Image::new(ImageId::default(), 10, 10, BaseType::Rgb).unwrap();
        let mut base = Layer::new(image.id(), "base", 10, 10, PixelType::Rgba).unwrap();
        fill(&base, 50);
        let base_id = image.add_layer(base);

        let mut float = Layer::new(image.id(), "float", 4, 4, PixelType::Rgba).unwrap();
        float.header.offset_x = 3;
        float.header.offset_y = 3;
        fill(&float, 200);
        let float_id = image.floating_sel_attach(float, FloatTarget::Layer(base_id)).unwrap();

        image.floating_sel_anchor(float_id).unwrap();

        assert_eq!(image.floating_selection(), None);
        assert!(image.layer(float_id).is_none());
        let base_cell = image.layer(base_id).unwrap();
        let base_layer = base_cell.borrow();
        let region = base_layer.header.region(Rect::new(3, 3, 4, 4), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                for px in chunk.row(row).chunks(4) {
                    assert_eq!(px, [200, 200, 200, 255]);
                }
            }
        }
    }

    #[test]
    fn remove_without_anchor_restores_target_bit_for_bit() {
        let mut image = Image::new(ImageId::default(), 10, 10, BaseType::Rgb).unwrap();
        let mut base = Layer::new(image.id(), "base", 10, 10, PixelType::Rgba).unwrap();
        fill(&base, 88);
        let base_id = image.add_layer(base);
        let before = {
            let cell = image.layer(base_id).unwrap();
            let layer = cell.borrow();
            read_rect_bytes(&layer.header, layer.header.full_rect())
        };

        let mut float = Layer::new(image.id(), "float", 4, 4, PixelType::Rgba).unwrap();
        float.header.offset_x = 2;
        float.header.offset_y = 2;
        fill(&float, 10);
        let float_id = image.floating_sel_attach(float, FloatTarget::Layer(base_id)).unwrap();
        image.floating_sel_composite(float_id, true).unwrap();
        image.floating_sel_remove(float_id).unwrap();

        let cell = image.layer(base_id).unwrap();
        let layer = cell.borrow();
        let after = read_rect_bytes(&layer.header, layer.header.full_rect());
        assert_eq!(before, after);
    }

    #[test]
    fn to_layer_on_channel_target_is_rejected() {
        let mut image = Image::new(ImageId::default(), 8, 8, BaseType::Gray).unwrap();
        let channel_id = image.channel_new("selection copy", 100, (0, 0, 0)).unwrap();
        let mut float = Layer::new(image.id(), "float", 4, 4, PixelType::Gray).unwrap();
        fill(&float, 5);
        let float_id = image
            .floating_sel_attach(float, FloatTarget::Channel(channel_id))
            .unwrap();
        assert_eq!(image.floating_sel_to_layer(float_id).unwrap_err(), ImageError::TypeMismatch);
    }

    #[test]
    fn mask_float_fails_empty_region_outside_drawable() {
        let mut image = Image::new(ImageId::default(), 20, 20, BaseType::Rgb).unwrap();
        let base = Layer::new(image.id(), "base", 4, 4, PixelType::Rgba).unwrap();
        let base_id = image.add_layer(base);
        image
            .mask_combine_rect(drawable_core::CombineOp::Replace, Rect::new(10, 10, 4, 4))
            .unwrap();
        assert_eq!(
            image.mask_float(base_id, 0, 0).unwrap_err(),
            ImageError::EmptyRegion
        );
    }

    #[test]
    fn mask_extract_whole_drawable_when_no_selection() {
        let mut image = Image::new(ImageId::default(), 6, 6, BaseType::Rgb).unwrap();
        let mut base = Layer::new(image.id(), "base", 6, 6, PixelType::Rgb).unwrap();
        fill(&base, 33);
        let base_id = image.add_layer(base);
        let cut = image.mask_extract(base_id, false, false).unwrap();
        assert_eq!(cut.width(), 6);
        assert_eq!(cut.height(), 6);
        assert_eq!(cut.bpp(), 4);
    }
}
