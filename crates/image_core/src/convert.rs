//! Base-type conversion: `convert_to_rgb` / `convert_to_grayscale` /
//! `convert_to_indexed[_palette]`. Each rebuilds every layer's pixel
//! storage at the new [`PixelType`] and swaps the image's base type and
//! colormap, all inside one `CONVERT_TYPE_UNDO` group so a single
//! `undo_pop` reverts every layer, the base type, and the colormap
//! together.

use std::cell::RefCell;

use drawable_core::{DrawableHeader, PixelType};
use indexed_quantize::DitherMode;
use undo_engine::UndoKind;

use crate::blend::{pixel_to_rgb, write_rgb_to_pixel};
use crate::undo_records;
use crate::{BaseType, ColorMap, Image, ImageError};

/// `palette_type` discriminant for `convert_to_indexed_palette` (§6):
/// `MAKE_PALETTE(0)`, `REUSE_PALETTE(1)`, `WEB_PALETTE(2)`,
/// `MONO_PALETTE(3)`, `CUSTOM_PALETTE(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteType {
    MakePalette,
    ReusePalette,
    WebPalette,
    MonoPalette,
    CustomPalette,
}

/// Reads a drawable's own pixels into a dense RGBA8 buffer, resolving
/// indexed storage through `colormap`. Used both to sample layers for
/// palette construction and to feed the dithering remap passes, which
/// all operate on RGBA8.
fn layer_rgba(header: &DrawableHeader, colormap: &Option<ColorMap>) -> Vec<u8> {
    let bpp = header.pixel_type.bytes_per_pixel() as usize;
    let (w, h) = (header.width as usize, header.height as usize);
    let mut out = vec![0u8; w * h * 4];
    let Ok(region) = header.region(header.full_rect(), false) else {
        return out;
    };
    for chunk in region.iter() {
        for row in 0..chunk.height() {
            let y = (chunk.image_y + row) as usize;
            let data = chunk.row(row);
            for col in 0..chunk.width() as usize {
                let x = chunk.image_x as usize + col;
                let px = &data[col * bpp..col * bpp + bpp];
                let (rgb, alpha) = pixel_to_rgb(px, header.pixel_type, colormap);
                let o = (y * w + x) * 4;
                out[o..o + 3].copy_from_slice(&rgb);
                out[o + 3] = alpha;
            }
        }
    }
    out
}

/// Rebuilds `header`'s tile storage at `new_type`, converting every pixel
/// through the RGB+alpha pivot (`pixel_to_rgb`/`write_rgb_to_pixel`
/// already used by compositing). Offsets, name and visibility carry over;
/// the preview starts invalid, as any fresh `DrawableHeader` does.
fn rebuild_header(
    header: &DrawableHeader,
    new_type: PixelType,
    colormap_in: &Option<ColorMap>,
) -> Result<DrawableHeader, ImageError> {
    let mut fresh = DrawableHeader::new(header.owner, header.name.clone(), header.width, header.height, new_type)?;
    fresh.visible = header.visible;
    fresh.offset_x = header.offset_x;
    fresh.offset_y = header.offset_y;
    let bpp_in = header.pixel_type.bytes_per_pixel() as usize;
    let bpp_out = new_type.bytes_per_pixel() as usize;
    let src = header.region(header.full_rect(), false)?;
    let dst = fresh.region(fresh.full_rect(), true)?;
    let mut cursor = pixel_region::register_regions(&[&src, &dst])?;
    while let Some(chunks) = cursor.process() {
        let (s, d) = (&chunks[0], &chunks[1]);
        for row in 0..s.height() {
            let src_row = s.row(row);
            let mut dst_row = d.row_mut(row);
            for x in 0..s.width() as usize {
                let px = &src_row[x * bpp_in..x * bpp_in + bpp_in];
                let (rgb, alpha) = pixel_to_rgb(px, header.pixel_type, colormap_in);
                let dst_px = &mut dst_row[x * bpp_out..x * bpp_out + bpp_out];
                write_rgb_to_pixel(dst_px, new_type, rgb, alpha, &None);
            }
        }
    }
    Ok(fresh)
}

impl Image {
    /// §6 `convert_to_rgb`: promotes every layer to RGB(+alpha) storage
    /// and drops the colormap. A no-op when already RGB.
    pub fn convert_to_rgb(&mut self) -> Result<(), ImageError> {
        if self.base_type() == BaseType::Rgb {
            return Ok(());
        }
        self.convert_base_type(BaseType::Rgb)
    }

    /// §6 `convert_to_grayscale`: demotes every layer to GRAY(+alpha)
    /// storage via the luminance weighting `write_rgb_to_pixel` already
    /// applies, and drops the colormap. A no-op when already grayscale.
    pub fn convert_to_grayscale(&mut self) -> Result<(), ImageError> {
        if self.base_type() == BaseType::Gray {
            return Ok(());
        }
        self.convert_base_type(BaseType::Gray)
    }

    fn convert_base_type(&mut self, new_base: BaseType) -> Result<(), ImageError> {
        let old_colormap = self.colormap.borrow().clone();
        let prior_base = self.base_type();
        self.undo.group_start(UndoKind::ConvertTypeUndo);
        self.undo.push(
            UndoKind::GimageMod,
            Some(Box::new(undo_records::ImageModPayload {
                width: self.width_cell.clone(),
                height: self.height_cell.clone(),
                base_type: self.base_type.clone(),
                prior: (self.width(), self.height(), prior_base),
            })),
            0,
            true,
        );
        *self.base_type.borrow_mut() = new_base;
        let prior_colormap = self.colormap.borrow().clone();
        *self.colormap.borrow_mut() = None;
        self.undo.push(
            UndoKind::ImageModUndo,
            Some(Box::new(undo_records::ColormapPayload { colormap: self.colormap.clone(), prior: prior_colormap })),
            0,
            true,
        );

        for id in self.layer_order() {
            let cell = self.layer(id).expect("id came from layer_order");
            let with_alpha = cell.borrow().header.pixel_type.has_alpha();
            let new_type = new_base.layer_pixel_type(with_alpha);
            let fresh = rebuild_header(&cell.borrow().header, new_type, &old_colormap)?;
            let bytes = (fresh.width * fresh.height) as usize;
            let prior = std::mem::replace(&mut cell.borrow_mut().header, fresh);
            self.undo.push(
                UndoKind::LayerMod,
                Some(Box::new(undo_records::LayerModPayload { layer: cell.clone(), prior: RefCell::new(Some(prior)) })),
                bytes,
                true,
            );
        }
        self.undo.group_end();
        Ok(())
    }

    /// §6 `convert_to_indexed`: shorthand for `convert_to_indexed_palette`
    /// with `palette_type = MakePalette`.
    pub fn convert_to_indexed(&mut self, dither: DitherMode, num_colors: usize) -> Result<(), ImageError> {
        self.convert_to_indexed_palette(dither, PaletteType::MakePalette, num_colors, None)
    }

    /// §6 `convert_to_indexed_palette`. `custom_palette` is required (and
    /// only consulted) when `palette_type == CustomPalette`;
    /// `ReusePalette` requires the image to already carry a colormap
    /// (round-tripping an indexed image through a different dither mode).
    pub fn convert_to_indexed_palette(
        &mut self,
        dither: DitherMode,
        palette_type: PaletteType,
        num_colors: usize,
        custom_palette: Option<&ColorMap>,
    ) -> Result<(), ImageError> {
        if self.base_type() == BaseType::Indexed {
            return Err(ImageError::IllegalState);
        }
        let is_gray = self.base_type() == BaseType::Gray;
        let old_colormap = self.colormap.borrow().clone();
        let layer_ids = self.layer_order();

        let palette: Vec<[u8; 3]> = match palette_type {
            PaletteType::WebPalette => indexed_quantize::web_palette(),
            PaletteType::MonoPalette => indexed_quantize::mono_palette(),
            PaletteType::CustomPalette => {
                let cmap = custom_palette.ok_or(ImageError::InvalidArgument)?;
                if cmap.entries.is_empty() {
                    return Err(ImageError::InvalidArgument);
                }
                cmap.entries.iter().map(|&(r, g, b)| [r, g, b]).collect()
            }
            PaletteType::ReusePalette => {
                let cmap = old_colormap.as_ref().ok_or(ImageError::InvalidArgument)?;
                cmap.entries.iter().map(|&(r, g, b)| [r, g, b]).collect()
            }
            PaletteType::MakePalette => {
                if num_colors == 0 || num_colors > 256 {
                    return Err(ImageError::InvalidArgument);
                }
                if is_gray {
                    let mut samples = Vec::new();
                    for &id in &layer_ids {
                        let cell = self.layer(id).expect("id came from layer_order");
                        let rgba = layer_rgba(&cell.borrow().header, &old_colormap);
                        samples.extend(rgba.chunks_exact(4).filter(|px| px[3] >= 128).map(|px| px[0]));
                    }
                    let (gray, _fast) = indexed_quantize::build_palette_gray(&samples, num_colors)?;
                    gray.into_iter().map(|g| [g, g, g]).collect()
                } else {
                    let mut samples = Vec::new();
                    for &id in &layer_ids {
                        let cell = self.layer(id).expect("id came from layer_order");
                        let rgba = layer_rgba(&cell.borrow().header, &old_colormap);
                        samples.extend(rgba.chunks_exact(4).filter(|px| px[3] >= 128).map(|px| [px[0], px[1], px[2]]));
                    }
                    let (rgb, _fast) = indexed_quantize::build_palette_rgb(&samples, num_colors)?;
                    rgb
                }
            }
        };
        if palette.is_empty() {
            return Err(ImageError::InvalidArgument);
        }
        let new_colormap = ColorMap { entries: palette.iter().map(|&[r, g, b]| (r, g, b)).collect() };
        let mut cache = indexed_quantize::InverseColormapCache::new(palette);

        let prior_base = self.base_type();
        self.undo.group_start(UndoKind::ConvertTypeUndo);
        self.undo.push(
            UndoKind::GimageMod,
            Some(Box::new(undo_records::ImageModPayload {
                width: self.width_cell.clone(),
                height: self.height_cell.clone(),
                base_type: self.base_type.clone(),
                prior: (self.width(), self.height(), prior_base),
            })),
            0,
            true,
        );
        *self.base_type.borrow_mut() = BaseType::Indexed;
        let prior_colormap = self.colormap.borrow().clone();
        *self.colormap.borrow_mut() = Some(new_colormap);
        self.undo.push(
            UndoKind::ImageModUndo,
            Some(Box::new(undo_records::ColormapPayload { colormap: self.colormap.clone(), prior: prior_colormap })),
            0,
            true,
        );

        for &id in &layer_ids {
            let cell = self.layer(id).expect("id came from layer_order");
            let (with_alpha, width, height) = {
                let layer = cell.borrow();
                (layer.header.pixel_type.has_alpha(), layer.header.width, layer.header.height)
            };
            let new_type = if with_alpha { PixelType::IndexedAlpha } else { PixelType::Indexed };
            let rgba = layer_rgba(&cell.borrow().header, &old_colormap);
            let (indices, alphas) = indexed_quantize::remap_image(width, height, &rgba, &mut cache, dither);

            let (owner, name, visible, offset_x, offset_y) = {
                let layer = cell.borrow();
                (
                    layer.header.owner,
                    layer.header.name.clone(),
                    layer.header.visible,
                    layer.header.offset_x,
                    layer.header.offset_y,
                )
            };
            let mut fresh = DrawableHeader::new(owner, name, width, height, new_type)?;
            fresh.visible = visible;
            fresh.offset_x = offset_x;
            fresh.offset_y = offset_y;
            let bpp_out = new_type.bytes_per_pixel() as usize;
            {
                let region = fresh.region(fresh.full_rect(), true)?;
                for chunk in region.iter() {
                    for row in 0..chunk.height() {
                        let y = (chunk.image_y + row) as usize;
                        let mut dst_row = chunk.row_mut(row);
                        for col in 0..chunk.width() as usize {
                            let x = chunk.image_x as usize + col;
                            let src_idx = y * width as usize + x;
                            let dst_px = &mut dst_row[col * bpp_out..col * bpp_out + bpp_out];
                            dst_px[0] = indices[src_idx];
                            if with_alpha {
                                dst_px[1] = alphas[src_idx];
                            }
                        }
                    }
                }
            }
            let bytes = (width * height) as usize;
            let prior = std::mem::replace(&mut cell.borrow_mut().header, fresh);
            self.undo.push(
                UndoKind::LayerMod,
                Some(Box::new(undo_records::LayerModPayload { layer: cell.clone(), prior: RefCell::new(Some(prior)) })),
                bytes,
                true,
            );
        }
        self.undo.group_end();
        Ok(())
    }
}

impl From<indexed_quantize::QuantizeError> for ImageError {
    fn from(_: indexed_quantize::QuantizeError) -> Self {
        ImageError::InvalidArgument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawable_core::{ImageId, Layer};

    fn fill_rgb(layer: &Layer, rgb: [u8; 3]) {
        let region = layer.header.region(layer.header.full_rect(), true).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                for px in chunk.row_mut(row).chunks_mut(3) {
                    px.copy_from_slice(&rgb);
                }
            }
        }
    }

    #[test]
    fn convert_to_grayscale_uses_luma_weighting() {
        let mut image = Image::new(ImageId::default(), 2, 2, BaseType::Rgb).unwrap();
        let mut layer = Layer::new(image.id(), "l", 2, 2, PixelType::Rgb).unwrap();
        fill_rgb(&layer, [255, 0, 0]);
        let id = image.add_layer(layer);
        image.convert_to_grayscale().unwrap();
        assert_eq!(image.base_type(), BaseType::Gray);
        let cell = image.layer(id).unwrap();
        let l = cell.borrow();
        assert_eq!(l.header.pixel_type, PixelType::Gray);
        let region = l.header.region(l.header.full_rect(), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                for &b in chunk.row(row) {
                    assert_eq!(b, 76); // 255 * 30 / 100
                }
            }
        }
    }

    #[test]
    fn convert_to_indexed_fast_path_matches_scenario_s4() {
        let mut image = Image::new(ImageId::default(), 2, 2, BaseType::Rgb).unwrap();
        let mut layer = Layer::new(image.id(), "l", 2, 2, PixelType::Rgba).unwrap();
        {
            let region = layer.header.region(layer.header.full_rect(), true).unwrap();
            let colors = [[255u8, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255], [255, 255, 255, 255]];
            let mut i = 0;
            for chunk in region.iter() {
                for row in 0..chunk.height() {
                    for px in chunk.row_mut(row).chunks_mut(4) {
                        px.copy_from_slice(&colors[i]);
                        i += 1;
                    }
                }
            }
        }
        image.add_layer(layer);
        image.convert_to_indexed(DitherMode::None, 4).unwrap();
        assert_eq!(image.base_type(), BaseType::Indexed);
        let cmap = image.colormap().unwrap();
        assert_eq!(cmap.entries.len(), 4);
        let mut sorted = cmap.entries.clone();
        sorted.sort();
        let mut expected = vec![(255u8, 0u8, 0u8), (0, 255, 0), (0, 0, 255), (255, 255, 255)];
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn reuse_palette_without_existing_colormap_is_rejected() {
        let mut image = Image::new(ImageId::default(), 2, 2, BaseType::Rgb).unwrap();
        assert_eq!(
            image
                .convert_to_indexed_palette(DitherMode::None, PaletteType::ReusePalette, 4, None)
                .unwrap_err(),
            ImageError::InvalidArgument
        );
    }

    #[test]
    fn converting_already_indexed_image_is_illegal() {
        let mut image = Image::new(ImageId::default(), 2, 2, BaseType::Gray).unwrap();
        image.convert_to_indexed(DitherMode::None, 2).unwrap();
        assert_eq!(
            image.convert_to_indexed(DitherMode::None, 2).unwrap_err(),
            ImageError::IllegalState
        );
    }
}
