//! Per-pixel compositing: the fourteen layer blend modes plus the `over`
//! operator that folds one layer's RGBA into a running projection.

use drawable_core::{BlendMode, DrawableHeader, Layer, PixelType};
use pixel_region::Rect;

use crate::ColorMap;

/// Reads `rect` (in the header's own local coordinates) out of its tile
/// storage into a dense row-major buffer, for stashing into a floating
/// selection's backing store or an undo payload's snapshot.
pub(crate) fn read_rect_bytes(header: &DrawableHeader, rect: Rect) -> Vec<u8> {
    let bpp = header.pixel_type.bytes_per_pixel() as usize;
    let mut buf = vec![0u8; rect.w as usize * rect.h as usize * bpp];
    if rect.w == 0 || rect.h == 0 {
        return buf;
    }
    if let Ok(region) = header.region(rect, false) {
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

/// Inverse of [`read_rect_bytes`]: writes a dense row-major buffer back
/// into `rect` and marks it dirty.
pub(crate) fn write_rect_bytes(header: &mut DrawableHeader, rect: Rect, bytes: &[u8]) {
    let bpp = header.pixel_type.bytes_per_pixel() as usize;
    if rect.w == 0 || rect.h == 0 {
        return;
    }
    if let Ok(region) = header.region(rect, true) {
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
    header.mark_dirty(rect);
}

fn lum(c: [f64; 3]) -> f64 {
    0.3 * c[0] + 0.59 * c[1] + 0.11 * c[2]
}

fn clip_color(mut c: [f64; 3]) -> [f64; 3] {
    let l = lum(c);
    let n = c.iter().cloned().fold(f64::INFINITY, f64::min);
    let x = c.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if n < 0.0 {
        for v in &mut c {
            *v = l + (*v - l) * l / (l - n);
        }
    }
    if x > 1.0 {
        for v in &mut c {
            *v = l + (*v - l) * (1.0 - l) / (x - l);
        }
    }
    c
}

fn set_lum(c: [f64; 3], l: f64) -> [f64; 3] {
    let d = l - lum(c);
    clip_color([c[0] + d, c[1] + d, c[2] + d])
}

fn sat(c: [f64; 3]) -> f64 {
    c.iter().cloned().fold(f64::NEG_INFINITY, f64::max) - c.iter().cloned().fold(f64::INFINITY, f64::min)
}

fn set_sat(mut c: [f64; 3], s: f64) -> [f64; 3] {
    let mut idx = [0usize, 1, 2];
    idx.sort_by(|&a, &b| c[a].partial_cmp(&c[b]).unwrap());
    let (min_i, mid_i, max_i) = (idx[0], idx[1], idx[2]);
    if c[max_i] > c[min_i] {
        c[mid_i] = (c[mid_i] - c[min_i]) * s / (c[max_i] - c[min_i]);
        c[max_i] = s;
    } else {
        c[mid_i] = 0.0;
        c[max_i] = 0.0;
    }
    c[min_i] = 0.0;
    c
}

fn rgb_to_hsv(c: [f64; 3]) -> (f64, f64, f64) {
    let (r, g, b) = (c[0], c[1], c[2]);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let v = max;
    let delta = max - min;
    let s = if max == 0.0 { 0.0 } else { delta / max };
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    (if h < 0.0 { h + 360.0 } else { h }, s, v)
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [f64; 3] {
    let c = v * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r1, g1, b1) = if hp < 1.0 {
        (c, x, 0.0)
    } else if hp < 2.0 {
        (x, c, 0.0)
    } else if hp < 3.0 {
        (0.0, c, x)
    } else if hp < 4.0 {
        (0.0, x, c)
    } else if hp < 5.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };
    let m = v - c;
    [r1 + m, g1 + m, b1 + m]
}

/// Blends `src` over `base` per `mode`, both in `[0,1]` per channel.
/// `Dissolve` and `Behind` are resolved by the caller before reaching here
/// (they depend on alpha/position, not pure color math).
pub fn blend_rgb(base: [f64; 3], src: [f64; 3], mode: BlendMode) -> [f64; 3] {
    match mode {
        BlendMode::Normal | BlendMode::Dissolve | BlendMode::Behind => src,
        BlendMode::Multiply => std::array::from_fn(|i| base[i] * src[i]),
        BlendMode::Screen => std::array::from_fn(|i| 1.0 - (1.0 - base[i]) * (1.0 - src[i])),
        BlendMode::Overlay => std::array::from_fn(|i| {
            if base[i] <= 0.5 {
                2.0 * base[i] * src[i]
            } else {
                1.0 - 2.0 * (1.0 - base[i]) * (1.0 - src[i])
            }
        }),
        BlendMode::Difference => std::array::from_fn(|i| (base[i] - src[i]).abs()),
        BlendMode::Addition => std::array::from_fn(|i| (base[i] + src[i]).min(1.0)),
        BlendMode::Subtract => std::array::from_fn(|i| (base[i] - src[i]).max(0.0)),
        BlendMode::DarkenOnly => std::array::from_fn(|i| base[i].min(src[i])),
        BlendMode::LightenOnly => std::array::from_fn(|i| base[i].max(src[i])),
        BlendMode::Hue => set_lum(set_sat(src, sat(base)), lum(base)),
        BlendMode::Saturation => set_lum(set_sat(base, sat(src)), lum(base)),
        BlendMode::Color => set_lum(src, lum(base)),
        BlendMode::Value => {
            let (h, s, _) = rgb_to_hsv(base);
            let (_, _, v) = rgb_to_hsv(src);
            hsv_to_rgb(h, s, v)
        }
    }
}

/// Composites one RGBA8 source pixel onto a running RGBA8 accumulator
/// using the classic `over` operator, after folding in layer opacity and
/// an optional mask multiplier (both already resolved to `[0,1]`
/// fractions by the caller).
pub fn composite_over(dst: &mut [u8; 4], src: [u8; 4], src_alpha_fraction: f64, mode: BlendMode) {
    if src_alpha_fraction <= 0.0 {
        return;
    }
    let dst_a = dst[3] as f64 / 255.0;
    let base = [dst[0] as f64 / 255.0, dst[1] as f64 / 255.0, dst[2] as f64 / 255.0];
    let top = [src[0] as f64 / 255.0, src[1] as f64 / 255.0, src[2] as f64 / 255.0];

    let eff_a = match mode {
        BlendMode::Behind => src_alpha_fraction * (1.0 - dst_a),
        _ => src_alpha_fraction,
    };
    if eff_a <= 0.0 {
        return;
    }
    let blended = blend_rgb(base, top, mode);
    let out_a = eff_a + dst_a * (1.0 - eff_a);
    for c in 0..3 {
        let out_c = if out_a > 0.0 {
            (blended[c] * eff_a + base[c] * dst_a * (1.0 - eff_a)) / out_a
        } else {
            0.0
        };
        dst[c] = (out_c * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}

/// Deterministic per-pixel coin flip used by `Dissolve`: a cheap xorshift
/// seeded from the pixel's image-space coordinates, so repeated renders of
/// a static image are stable.
pub fn dissolve_keeps_pixel(x: u32, y: u32, alpha_fraction: f64) -> bool {
    let mut state = (x as u64).wrapping_mul(0x9E3779B97F4A7C15) ^ ((y as u64) << 32 | y as u64);
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    let roll = (state % 1_000_000) as f64 / 1_000_000.0;
    roll < alpha_fraction
}

pub(crate) fn pixel_to_rgb(px: &[u8], pixel_type: PixelType, colormap: &Option<ColorMap>) -> ([u8; 3], u8) {
    match pixel_type {
        PixelType::Rgb => ([px[0], px[1], px[2]], 255),
        PixelType::Rgba => ([px[0], px[1], px[2]], px[3]),
        PixelType::Gray => ([px[0], px[0], px[0]], 255),
        PixelType::GrayAlpha => ([px[0], px[0], px[0]], px[1]),
        PixelType::Indexed => {
            let (r, g, b) = colormap
                .as_ref()
                .and_then(|c| c.entries.get(px[0] as usize))
                .copied()
                .unwrap_or((0, 0, 0));
            ([r, g, b], 255)
        }
        PixelType::IndexedAlpha => {
            let (r, g, b) = colormap
                .as_ref()
                .and_then(|c| c.entries.get(px[0] as usize))
                .copied()
                .unwrap_or((0, 0, 0));
            ([r, g, b], px[1])
        }
    }
}

/// Nearest palette entry to `rgb` by squared Euclidean distance. Used
/// where a continuous color must be written back into an `Indexed`
/// drawable (floating-selection composite onto an indexed target).
pub(crate) fn nearest_palette_index(rgb: [u8; 3], colormap: &Option<ColorMap>) -> u8 {
    let Some(cmap) = colormap else { return 0 };
    let mut best = 0u8;
    let mut best_dist = u32::MAX;
    for (i, &(r, g, b)) in cmap.entries.iter().enumerate().take(256) {
        let dr = r as i32 - rgb[0] as i32;
        let dg = g as i32 - rgb[1] as i32;
        let db = b as i32 - rgb[2] as i32;
        let dist = (dr * dr + dg * dg + db * db) as u32;
        if dist < best_dist {
            best_dist = dist;
            best = i as u8;
        }
    }
    best
}

fn luminance_byte(rgb: [u8; 3]) -> u8 {
    ((rgb[0] as u32 * 30 + rgb[1] as u32 * 59 + rgb[2] as u32 * 11) / 100) as u8
}

/// Inverse of [`pixel_to_rgb`]: writes an RGB+alpha color into `dst` in
/// whatever native format `pixel_type` calls for.
pub(crate) fn write_rgb_to_pixel(
    dst: &mut [u8],
    pixel_type: PixelType,
    rgb: [u8; 3],
    alpha: u8,
    colormap: &Option<ColorMap>,
) {
    match pixel_type {
        PixelType::Rgb => dst[..3].copy_from_slice(&rgb),
        PixelType::Rgba => {
            dst[..3].copy_from_slice(&rgb);
            dst[3] = alpha;
        }
        PixelType::Gray => dst[0] = luminance_byte(rgb),
        PixelType::GrayAlpha => {
            dst[0] = luminance_byte(rgb);
            dst[1] = alpha;
        }
        PixelType::Indexed => dst[0] = nearest_palette_index(rgb, colormap),
        PixelType::IndexedAlpha => {
            dst[0] = nearest_palette_index(rgb, colormap);
            dst[1] = alpha;
        }
    }
}

/// Reads one layer's pixels (applying offset, opacity, its own mask if
/// `apply_mask` is set, and blend mode) into a running RGBA8 canvas
/// accumulator. Colormap lookups only apply to `Indexed`/`IndexedAlpha`
/// pixel data.
pub fn composite_layer(
    layer: &Layer,
    colormap: &Option<ColorMap>,
    canvas_w: u32,
    canvas_h: u32,
    out: &mut [u8],
) {
    let header = &layer.header;
    let bpp = header.pixel_type.bytes_per_pixel() as usize;
    let has_alpha = header.pixel_type.has_alpha();
    let Ok(region) = header.region(header.full_rect(), false) else { return };

    let mask_bytes = if layer.apply_mask {
        layer.mask.as_ref().and_then(|mask| {
            let mr = mask.header.region(mask.header.full_rect(), false).ok()?;
            let w = mask.header.width as usize;
            let mut buf = vec![0u8; w * mask.header.height as usize];
            for chunk in mr.iter() {
                for row in 0..chunk.height() {
                    let y = (chunk.image_y + row) as usize;
                    let x0 = chunk.image_x as usize;
                    let data = chunk.row(row);
                    buf[y * w + x0..y * w + x0 + data.len()].copy_from_slice(&data);
                }
            }
            Some(buf)
        })
    } else {
        None
    };

    let opacity_fraction = layer.opacity as f64 / 255.0;

    for chunk in region.iter() {
        for row in 0..chunk.height() {
            let y = chunk.image_y + row;
            let data = chunk.row(row);
            for col in 0..chunk.width() as usize {
                let x = chunk.image_x + col as u32;
                let dst_x = x as i64 + header.offset_x as i64;
                let dst_y = y as i64 + header.offset_y as i64;
                if dst_x < 0 || dst_y < 0 || dst_x >= canvas_w as i64 || dst_y >= canvas_h as i64 {
                    continue;
                }
                let px = &data[col * bpp..col * bpp + bpp];
                let (rgb, alpha_byte) = pixel_to_rgb(px, header.pixel_type, colormap);
                let mut alpha_fraction = if has_alpha { alpha_byte as f64 / 255.0 } else { 1.0 };
                alpha_fraction *= opacity_fraction;
                if let Some(mask_bytes) = &mask_bytes {
                    let midx = y as usize * header.width as usize + x as usize;
                    alpha_fraction *= mask_bytes[midx] as f64 / 255.0;
                }
                if layer.blend_mode == BlendMode::Dissolve {
                    if !dissolve_keeps_pixel(dst_x as u32, dst_y as u32, alpha_fraction) {
                        continue;
                    }
                    alpha_fraction = 1.0;
                }
                let out_idx = (dst_y as usize * canvas_w as usize + dst_x as usize) * 4;
                let mut dst_px = [out[out_idx], out[out_idx + 1], out[out_idx + 2], out[out_idx + 3]];
                composite_over(&mut dst_px, [rgb[0], rgb[1], rgb[2], 255], alpha_fraction, layer.blend_mode);
                out[out_idx..out_idx + 4].copy_from_slice(&dst_px);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_mode_replaces_base_color() {
        assert_eq!(blend_rgb([0.2, 0.2, 0.2], [0.8, 0.1, 0.5], BlendMode::Normal), [0.8, 0.1, 0.5]);
    }

    #[test]
    fn multiply_of_white_is_identity() {
        let result = blend_rgb([0.3, 0.6, 0.9], [1.0, 1.0, 1.0], BlendMode::Multiply);
        for (r, b) in result.iter().zip([0.3, 0.6, 0.9].iter()) {
            assert!((r - b).abs() < 1e-9);
        }
    }

    #[test]
    fn screen_of_black_is_identity() {
        let result = blend_rgb([0.3, 0.6, 0.9], [0.0, 0.0, 0.0], BlendMode::Screen);
        for (r, b) in result.iter().zip([0.3, 0.6, 0.9].iter()) {
            assert!((r - b).abs() < 1e-9);
        }
    }

    #[test]
    fn composite_over_opaque_full_replace() {
        let mut dst = [10, 20, 30, 255];
        composite_over(&mut dst, [200, 100, 50, 255], 1.0, BlendMode::Normal);
        assert_eq!(dst, [200, 100, 50, 255]);
    }

    #[test]
    fn composite_over_zero_alpha_is_noop() {
        let mut dst = [10, 20, 30, 255];
        composite_over(&mut dst, [200, 100, 50, 255], 0.0, BlendMode::Normal);
        assert_eq!(dst, [10, 20, 30, 255]);
    }

    #[test]
    fn composite_over_half_alpha_blends_midway() {
        let mut dst = [0, 0, 0, 255];
        composite_over(&mut dst, [200, 200, 200, 255], 0.5, BlendMode::Normal);
        assert_eq!(dst, [100, 100, 100, 255]);
    }
}
