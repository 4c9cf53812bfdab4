//! Palette construction and remap for converting an RGB or grayscale
//! drawable to an indexed one: median-cut box splitting over a 6/6/5-bit
//! histogram, the fixed web and mono palettes, an inverse-colormap cache
//! that amortizes nearest-color search over 8x8x8-cell boxes, and the
//! no-dither / Floyd-Steinberg / nondestructive remap passes.

use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizeError {
    InvalidArgument,
}

impl fmt::Display for QuantizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantizeError::InvalidArgument => write!(f, "invalid quantizer argument"),
        }
    }
}

impl std::error::Error for QuantizeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DitherMode {
    None,
    FloydSteinberg,
    Nondestructive,
}

// The inverse-colormap cache is keyed by the same 6/6/5-bit cell grid the
// RGB palette histogram uses, so a palette built from one can seed a cache
// used for the other.
const R_BITS: u32 = 6;
const G_BITS: u32 = 6;
const B_BITS: u32 = 5;
const R_SHIFT: u32 = 8 - R_BITS;
const G_SHIFT: u32 = 8 - G_BITS;
const B_SHIFT: u32 = 8 - B_BITS;
const R_CELLS: usize = 1 << R_BITS;
const G_CELLS: usize = 1 << G_BITS;
const B_CELLS: usize = 1 << B_BITS;

fn rgb_cell(r: u8, g: u8, b: u8) -> (usize, usize, usize) {
    ((r >> R_SHIFT) as usize, (g >> G_SHIFT) as usize, (b >> B_SHIFT) as usize)
}

fn cell_linear((rc, gc, bc): (usize, usize, usize)) -> usize {
    (rc * G_CELLS + gc) * B_CELLS + bc
}

fn cell_edges(cell: usize, shift: u32) -> (u8, u8) {
    let lo = (cell as u32) << shift;
    let span = 1u32 << shift;
    let hi = (lo + span - 1).min(255);
    (lo as u8, hi as u8)
}

fn cell_center(cell: usize, shift: u32) -> i32 {
    let lo = (cell as u32) << shift;
    let span = 1u32 << shift;
    (lo + span / 2) as i32
}

/// Fixed 216-color 6x6x6 cube, population-independent.
pub fn web_palette() -> Vec<[u8; 3]> {
    const LEVELS: [u8; 6] = [0, 51, 102, 153, 204, 255];
    let mut out = Vec::with_capacity(216);
    for &r in &LEVELS {
        for &g in &LEVELS {
            for &b in &LEVELS {
                out.push([r, g, b]);
            }
        }
    }
    out
}

/// Exact {black, white}.
pub fn mono_palette() -> Vec<[u8; 3]> {
    vec![[0, 0, 0], [255, 255, 255]]
}

/// Builds a gray palette of at most `max_colors` representative
/// intensities from a 256-bucket histogram via median-cut, or the exact
/// distinct set when it already fits. Returns `(palette, is_fast_path)`.
pub fn build_palette_gray(samples: &[u8], max_colors: usize) -> Result<(Vec<u8>, bool), QuantizeError> {
    if max_colors == 0 {
        return Err(QuantizeError::InvalidArgument);
    }
    let mut hist = [0u64; 256];
    let mut distinct: HashSet<u8> = HashSet::new();
    for &v in samples {
        hist[v as usize] += 1;
        distinct.insert(v);
    }
    if distinct.len() <= max_colors {
        let mut palette: Vec<u8> = distinct.into_iter().collect();
        palette.sort_unstable();
        return Ok((palette, true));
    }

    let mut boxes: Vec<(usize, usize)> = vec![(0, 255)];
    let half = max_colors / 2;
    let mut splits_done = 0usize;
    while boxes.len() < max_colors {
        let use_population = splits_done < half;
        let pick = boxes
            .iter()
            .enumerate()
            .filter(|(_, &(lo, hi))| hi > lo)
            .max_by_key(|(_, &(lo, hi))| {
                if use_population {
                    hist[lo..=hi].iter().sum::<u64>()
                } else {
                    let extent = (hi - lo + 1) as u64;
                    extent * extent
                }
            });
        let Some((i, &(lo, hi))) = pick else { break };
        let mid = lo + (hi - lo) / 2;
        boxes[i] = (lo, mid);
        boxes.insert(i + 1, (mid + 1, hi));
        splits_done += 1;
    }

    let palette = boxes
        .into_iter()
        .map(|(lo, hi)| {
            let mut wsum = 0u64;
            let mut count = 0u64;
            for v in lo..=hi {
                wsum += hist[v] * v as u64;
                count += hist[v];
            }
            if count == 0 { ((lo + hi) / 2) as u8 } else { (wsum / count) as u8 }
        })
        .collect();
    Ok((palette, false))
}

#[derive(Clone, Copy)]
struct RgbBox {
    r: (usize, usize),
    g: (usize, usize),
    b: (usize, usize),
}

impl RgbBox {
    fn full() -> Self {
        Self { r: (0, R_CELLS - 1), g: (0, G_CELLS - 1), b: (0, B_CELLS - 1) }
    }

    fn splittable(&self) -> bool {
        self.r.1 > self.r.0 || self.g.1 > self.g.0 || self.b.1 > self.b.0
    }

    /// Sum-of-squared-extents stand-in for "2-norm volume".
    fn volume(&self) -> u64 {
        let re = (self.r.1 - self.r.0 + 1) as u64;
        let ge = (self.g.1 - self.g.0 + 1) as u64;
        let be = (self.b.1 - self.b.0 + 1) as u64;
        re * re + ge * ge + be * be
    }

    /// Splits at the midpoint of the longest axis after scaling extents
    /// by (30, 59, 11) — the luma-like weighting the spec calls for.
    fn split(&self) -> (RgbBox, RgbBox) {
        let extents = [
            (self.r.1 - self.r.0) as f64 * 30.0,
            (self.g.1 - self.g.0) as f64 * 59.0,
            (self.b.1 - self.b.0) as f64 * 11.0,
        ];
        let splittable = [self.r.1 > self.r.0, self.g.1 > self.g.0, self.b.1 > self.b.0];
        let mut axis = 0;
        let mut best = -1.0;
        for i in 0..3 {
            if splittable[i] && extents[i] > best {
                best = extents[i];
                axis = i;
            }
        }
        let mut lo = *self;
        let mut hi = *self;
        match axis {
            0 => {
                let mid = self.r.0 + (self.r.1 - self.r.0) / 2;
                lo.r = (self.r.0, mid);
                hi.r = (mid + 1, self.r.1);
            }
            1 => {
                let mid = self.g.0 + (self.g.1 - self.g.0) / 2;
                lo.g = (self.g.0, mid);
                hi.g = (mid + 1, self.g.1);
            }
            _ => {
                let mid = self.b.0 + (self.b.1 - self.b.0) / 2;
                lo.b = (self.b.0, mid);
                hi.b = (mid + 1, self.b.1);
            }
        }
        (lo, hi)
    }
}

struct RgbHistogram {
    count: Vec<u64>,
    rsum: Vec<u64>,
    gsum: Vec<u64>,
    bsum: Vec<u64>,
}

impl RgbHistogram {
    fn build(samples: &[[u8; 3]]) -> Self {
        let n = R_CELLS * G_CELLS * B_CELLS;
        let mut hist = Self { count: vec![0; n], rsum: vec![0; n], gsum: vec![0; n], bsum: vec![0; n] };
        for &[r, g, b] in samples {
            let idx = cell_linear(rgb_cell(r, g, b));
            hist.count[idx] += 1;
            hist.rsum[idx] += r as u64;
            hist.gsum[idx] += g as u64;
            hist.bsum[idx] += b as u64;
        }
        hist
    }

    fn population(&self, b: &RgbBox) -> u64 {
        let mut total = 0u64;
        for r in b.r.0..=b.r.1 {
            for g in b.g.0..=b.g.1 {
                for bb in b.b.0..=b.b.1 {
                    total += self.count[cell_linear((r, g, bb))];
                }
            }
        }
        total
    }

    fn centroid(&self, b: &RgbBox) -> [u8; 3] {
        let (mut rs, mut gs, mut bs, mut count) = (0u64, 0u64, 0u64, 0u64);
        for r in b.r.0..=b.r.1 {
            for g in b.g.0..=b.g.1 {
                for bb in b.b.0..=b.b.1 {
                    let idx = cell_linear((r, g, bb));
                    rs += self.rsum[idx];
                    gs += self.gsum[idx];
                    bs += self.bsum[idx];
                    count += self.count[idx];
                }
            }
        }
        if count == 0 {
            let mid = |axis: (usize, usize), shift| cell_center((axis.0 + axis.1) / 2, shift) as u8;
            [mid(b.r, R_SHIFT), mid(b.g, G_SHIFT), mid(b.b, B_SHIFT)]
        } else {
            [(rs / count) as u8, (gs / count) as u8, (bs / count) as u8]
        }
    }
}

/// Builds an RGB palette of at most `max_colors` entries. `samples` should
/// already exclude transparent pixels (opacity < 128 per the alpha rule).
/// Returns `(palette, is_fast_path)`; the fast path fires when the input
/// contains no more than `max_colors` distinct colors, in which case the
/// palette is exactly that enumerated set (median-cut is skipped).
pub fn build_palette_rgb(samples: &[[u8; 3]], max_colors: usize) -> Result<(Vec<[u8; 3]>, bool), QuantizeError> {
    if max_colors == 0 {
        return Err(QuantizeError::InvalidArgument);
    }
    let mut distinct: HashSet<[u8; 3]> = HashSet::new();
    let mut fits = true;
    for &c in samples {
        distinct.insert(c);
        if distinct.len() > max_colors {
            fits = false;
            break;
        }
    }
    if fits {
        return Ok((distinct.into_iter().collect(), true));
    }

    let hist = RgbHistogram::build(samples);
    let mut boxes = vec![RgbBox::full()];
    let half = max_colors / 2;
    let mut splits_done = 0usize;
    while boxes.len() < max_colors {
        let use_population = splits_done < half;
        let pick = boxes
            .iter()
            .enumerate()
            .filter(|(_, b)| b.splittable())
            .max_by_key(|(_, b)| if use_population { hist.population(b) } else { b.volume() });
        let Some((i, &b)) = pick else { break };
        let (lo, hi) = b.split();
        boxes[i] = lo;
        boxes.insert(i + 1, hi);
        splits_done += 1;
    }

    let palette = boxes.iter().map(|b| hist.centroid(b)).collect();
    Ok((palette, false))
}

fn axis_min_max(lo: u8, hi: u8, p: u8) -> (u32, u32) {
    let (lo, hi, p) = (lo as i32, hi as i32, p as i32);
    if p < lo {
        (((lo - p) * (lo - p)) as u32, ((hi - p) * (hi - p)) as u32)
    } else if p > hi {
        (((p - hi) * (p - hi)) as u32, ((p - lo) * (p - lo)) as u32)
    } else {
        let near = (p - lo) * (p - lo);
        let far = (hi - p) * (hi - p);
        (0, near.max(far) as u32)
    }
}

fn corner_distance(c: [u8; 3], r: (u8, u8), g: (u8, u8), b: (u8, u8)) -> (u32, u32) {
    let (rmin, rmax) = axis_min_max(r.0, r.1, c[0]);
    let (gmin, gmax) = axis_min_max(g.0, g.1, c[1]);
    let (bmin, bmax) = axis_min_max(b.0, b.1, c[2]);
    (rmin + gmin + bmin, rmax + gmax + bmax)
}

/// Nearest-palette-entry lookup keyed by the 6/6/5-bit histogram cell
/// containing the query color. A cache miss fills an entire 8x8x8-cell
/// box around the missed cell in one pass: palette entries farther than
/// the box's smallest worst-case distance are pruned, and every surviving
/// entry's distance to each cell's center decides that cell's fill —
/// the box-corner pruning GIMP's `fill_inverse_cmap` is built around,
/// minus its incremental-distance bookkeeping (direct squared distance
/// costs more per cell but is simpler and gives the same answer).
pub struct InverseColormapCache {
    palette: Vec<[u8; 3]>,
    cells: Vec<u16>,
}

const FILL_BOX: usize = 8;

impl InverseColormapCache {
    pub fn new(palette: Vec<[u8; 3]>) -> Self {
        Self { palette, cells: vec![0u16; R_CELLS * G_CELLS * B_CELLS] }
    }

    pub fn palette(&self) -> &[[u8; 3]] {
        &self.palette
    }

    pub fn nearest(&mut self, rgb: [u8; 3]) -> u8 {
        if self.palette.len() <= 1 {
            return 0;
        }
        let coords = rgb_cell(rgb[0], rgb[1], rgb[2]);
        let idx = cell_linear(coords);
        if self.cells[idx] == 0 {
            self.fill_box(coords);
        }
        (self.cells[idx] - 1) as u8
    }

    fn fill_box(&mut self, (rc, gc, bc): (usize, usize, usize)) {
        let r0 = (rc / FILL_BOX) * FILL_BOX;
        let g0 = (gc / FILL_BOX) * FILL_BOX;
        let b0 = (bc / FILL_BOX) * FILL_BOX;
        let r1 = (r0 + FILL_BOX).min(R_CELLS) - 1;
        let g1 = (g0 + FILL_BOX).min(G_CELLS) - 1;
        let b1 = (b0 + FILL_BOX).min(B_CELLS) - 1;

        let r_edges = (cell_edges(r0, R_SHIFT).0, cell_edges(r1, R_SHIFT).1);
        let g_edges = (cell_edges(g0, G_SHIFT).0, cell_edges(g1, G_SHIFT).1);
        let b_edges = (cell_edges(b0, B_SHIFT).0, cell_edges(b1, B_SHIFT).1);

        let mut min_of_max = u32::MAX;
        let mut bounds = Vec::with_capacity(self.palette.len());
        for &p in &self.palette {
            let (min_d, max_d) = corner_distance(p, r_edges, g_edges, b_edges);
            bounds.push(min_d);
            min_of_max = min_of_max.min(max_d);
        }
        let candidates: Vec<(usize, [u8; 3])> = self
            .palette
            .iter()
            .enumerate()
            .zip(bounds.iter())
            .filter(|(_, &min_d)| min_d <= min_of_max)
            .map(|((i, &c), _)| (i, c))
            .collect();

        for r in r0..=r1 {
            let rv = cell_center(r, R_SHIFT);
            for g in g0..=g1 {
                let gv = cell_center(g, G_SHIFT);
                for b in b0..=b1 {
                    let bv = cell_center(b, B_SHIFT);
                    let mut best_i = candidates[0].0;
                    let mut best_d = u32::MAX;
                    for &(i, c) in &candidates {
                        let dr = rv - c[0] as i32;
                        let dg = gv - c[1] as i32;
                        let db = bv - c[2] as i32;
                        let d = (dr * dr + dg * dg + db * db) as u32;
                        if d < best_d {
                            best_d = d;
                            best_i = i;
                        }
                    }
                    self.cells[cell_linear((r, g, b))] = (best_i + 1) as u16;
                }
            }
        }
    }
}

/// Maps a signed color delta in `[-255, 255]` to `[-32, 32]`: 1:1 up to
/// +-16, 1:2 out to +-48, saturating beyond that. Used to keep
/// Floyd-Steinberg's diffused error from overshooting into a visibly
/// wrong neighbor color.
pub fn range_limit(delta: i32) -> i32 {
    let sign = delta.signum();
    let a = delta.abs();
    let limited = if a <= 16 { a } else if a <= 48 { 16 + (a - 16) / 2 } else { 32 };
    sign * limited
}

/// One pixel's alpha resolved per the "opacity < 128 => transparent,
/// else 255" rule used throughout the quantizer.
pub fn resolved_alpha(alpha: u8) -> u8 {
    if alpha < 128 { 0 } else { 255 }
}

/// Remaps a dense RGBA8 buffer to indices against `cache`, with no
/// dithering. Transparent pixels (alpha < 128) are still looked up —
/// "an alpha pixel skipped from histogram on construction is still
/// mapped on remap" — and get alpha 0 in the output; everything else
/// gets alpha 255.
pub fn remap_no_dither(width: u32, height: u32, rgba: &[u8], cache: &mut InverseColormapCache) -> (Vec<u8>, Vec<u8>) {
    let (w, h) = (width as usize, height as usize);
    let mut indices = vec![0u8; w * h];
    let mut alphas = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let o = (y * w + x) * 4;
            alphas[y * w + x] = resolved_alpha(rgba[o + 3]);
            indices[y * w + x] = cache.nearest([rgba[o], rgba[o + 1], rgba[o + 2]]);
        }
    }
    (indices, alphas)
}

/// Linear-probe remap used when the active palette is exactly the set of
/// colors present (the fast path): every pixel's color is already a
/// palette entry, so dithering would only perturb an already-exact
/// image. Falls back to `cache` on a color that (unexpectedly) isn't an
/// exact match.
pub fn remap_nondestructive(
    width: u32,
    height: u32,
    rgba: &[u8],
    palette: &[[u8; 3]],
    cache: &mut InverseColormapCache,
) -> (Vec<u8>, Vec<u8>) {
    let (w, h) = (width as usize, height as usize);
    let mut indices = vec![0u8; w * h];
    let mut alphas = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let o = (y * w + x) * 4;
            alphas[y * w + x] = resolved_alpha(rgba[o + 3]);
            let rgb = [rgba[o], rgba[o + 1], rgba[o + 2]];
            indices[y * w + x] = match palette.iter().position(|&c| c == rgb) {
                Some(i) => i as u8,
                None => cache.nearest(rgb),
            };
        }
    }
    (indices, alphas)
}

/// Floyd-Steinberg remap: forward error buffers per row, serpentine scan
/// direction, residual computed against whatever color the cache actually
/// chose (not the unclamped ideal), matching the spec's "re-cache;
/// distribute residual error" ordering.
pub fn remap_floyd_steinberg(width: u32, height: u32, rgba: &[u8], cache: &mut InverseColormapCache) -> (Vec<u8>, Vec<u8>) {
    let (w, h) = (width as usize, height as usize);
    let mut indices = vec![0u8; w * h];
    let mut alphas = vec![0u8; w * h];
    let mut cur_err = vec![[0i32; 3]; w];
    let mut next_err = vec![[0i32; 3]; w];

    for y in 0..h {
        let forward = y % 2 == 0;
        let xs: Vec<usize> = if forward { (0..w).collect() } else { (0..w).rev().collect() };
        for x in xs {
            let o = (y * w + x) * 4;
            alphas[y * w + x] = resolved_alpha(rgba[o + 3]);
            let err = cur_err[x];
            let mut adjusted = [0u8; 3];
            for c in 0..3 {
                let v = rgba[o + c] as i32 + range_limit(err[c]);
                adjusted[c] = v.clamp(0, 255) as u8;
            }
            let idx = cache.nearest(adjusted);
            indices[y * w + x] = idx;
            let chosen = cache.palette()[idx as usize];

            let (fwd, back, fwd_down) = if forward {
                (x.checked_add(1), x.checked_sub(1), x.checked_add(1))
            } else {
                (x.checked_sub(1), x.checked_add(1), x.checked_sub(1))
            };
            for c in 0..3 {
                let residual = adjusted[c] as i32 - chosen[c] as i32;
                if let Some(fx) = fwd.filter(|&fx| fx < w) {
                    cur_err[fx][c] += residual * 7 / 16;
                }
                if let Some(bx) = back.filter(|&bx| bx < w) {
                    next_err[bx][c] += residual * 3 / 16;
                }
                next_err[x][c] += residual * 5 / 16;
                if let Some(fx) = fwd_down.filter(|&fx| fx < w) {
                    next_err[fx][c] += residual * 1 / 16;
                }
            }
        }
        std::mem::swap(&mut cur_err, &mut next_err);
        for e in next_err.iter_mut() {
            *e = [0; 3];
        }
    }

    (indices, alphas)
}

/// Runs the remap pass named by `dither` over a dense RGBA8 buffer.
pub fn remap_image(
    width: u32,
    height: u32,
    rgba: &[u8],
    cache: &mut InverseColormapCache,
    dither: DitherMode,
) -> (Vec<u8>, Vec<u8>) {
    match dither {
        DitherMode::None => remap_no_dither(width, height, rgba, cache),
        DitherMode::FloydSteinberg => remap_floyd_steinberg(width, height, rgba, cache),
        DitherMode::Nondestructive => {
            let palette = cache.palette().to_vec();
            remap_nondestructive(width, height, rgba, &palette, cache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_fast_path_returns_exact_distinct_set() {
        let samples = [10u8, 10, 200, 200, 50];
        let (palette, fast) = build_palette_gray(&samples, 8).unwrap();
        assert!(fast);
        let mut expected = vec![10u8, 50, 200];
        expected.sort_unstable();
        assert_eq!(palette, expected);
    }

    #[test]
    fn gray_median_cut_respects_requested_count() {
        let mut samples = Vec::new();
        for v in 0..=255u8 {
            samples.push(v);
        }
        let (palette, fast) = build_palette_gray(&samples, 16).unwrap();
        assert!(!fast);
        assert_eq!(palette.len(), 16);
    }

    #[test]
    fn rgb_fast_path_is_exact_permutation_of_input_colors() {
        let samples = [[255u8, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255]];
        let (palette, fast) = build_palette_rgb(&samples, 4).unwrap();
        assert!(fast);
        let mut sorted_palette = palette.clone();
        sorted_palette.sort();
        let mut sorted_samples: Vec<[u8; 3]> = samples.to_vec();
        sorted_samples.sort();
        assert_eq!(sorted_palette, sorted_samples);
    }

    #[test]
    fn rgb_fast_path_every_pixel_maps_to_its_own_color() {
        let samples = [[255u8, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255]];
        let (palette, fast) = build_palette_rgb(&samples, 4).unwrap();
        assert!(fast);
        let mut cache = InverseColormapCache::new(palette.clone());
        for &c in &samples {
            let idx = cache.nearest(c);
            assert_eq!(palette[idx as usize], c);
        }
    }

    #[test]
    fn rgb_median_cut_respects_requested_count() {
        let mut samples = Vec::new();
        for r in (0..=255u16).step_by(17) {
            for g in (0..=255u16).step_by(33) {
                samples.push([r as u8, g as u8, (r ^ g) as u8]);
            }
        }
        let (palette, fast) = build_palette_rgb(&samples, 8).unwrap();
        assert!(!fast);
        assert_eq!(palette.len(), 8);
    }

    #[test]
    fn web_palette_has_216_entries_and_mono_has_two() {
        assert_eq!(web_palette().len(), 216);
        assert_eq!(mono_palette(), vec![[0, 0, 0], [255, 255, 255]]);
    }

    #[test]
    fn range_limit_matches_piecewise_curve() {
        assert_eq!(range_limit(10), 10);
        assert_eq!(range_limit(16), 16);
        assert_eq!(range_limit(32), 24);
        assert_eq!(range_limit(48), 32);
        assert_eq!(range_limit(200), 32);
        assert_eq!(range_limit(-200), -32);
    }

    #[test]
    fn no_dither_remap_resolves_alpha_by_the_128_threshold() {
        let palette = vec![[255u8, 0, 0], [0, 255, 0]];
        let mut cache = InverseColormapCache::new(palette);
        let rgba = [255u8, 0, 0, 127, 0, 255, 0, 128];
        let (indices, alphas) = remap_no_dither(2, 1, &rgba, &mut cache);
        assert_eq!(alphas, vec![0, 255]);
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn floyd_steinberg_is_neutral_on_a_flat_image_already_in_the_palette() {
        let palette = vec![[10u8, 20, 30], [200, 210, 220]];
        let mut cache = InverseColormapCache::new(palette.clone());
        let mut rgba = Vec::new();
        for _ in 0..16 {
            rgba.extend_from_slice(&[10, 20, 30, 255]);
        }
        let (indices, _) = remap_floyd_steinberg(4, 4, &rgba, &mut cache);
        assert!(indices.iter().all(|&i| i == 0));
    }

    #[test]
    fn nondestructive_remap_keeps_exact_fast_path_colors_unperturbed() {
        let samples = [[255u8, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255]];
        let (palette, fast) = build_palette_rgb(&samples, 4).unwrap();
        assert!(fast);
        let mut cache = InverseColormapCache::new(palette.clone());
        let mut rgba = Vec::new();
        for &[r, g, b] in &samples {
            rgba.extend_from_slice(&[r, g, b, 255]);
        }
        let (indices, _) = remap_nondestructive(4, 1, &rgba, &palette, &mut cache);
        for (px, &idx) in samples.iter().zip(indices.iter()) {
            assert_eq!(palette[idx as usize], *px);
        }
    }
}
