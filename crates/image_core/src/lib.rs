//! The image: ordered layers and channels, the distinguished selection
//! channel, guides, parasites, quick-mask, and the undo engine that backs
//! every mutator. This is the facade C7 sits behind; `raster_core` wraps
//! many of these as a C-style action API.

mod blend;
mod convert;
mod floating_sel;
mod undo_records;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use drawable_core::{
    ApplyMaskMode, BoundarySegment, Channel, ChannelId, CombineOp, ImageId, Layer, LayerId, PixelType,
};
use pixel_region::{register_regions, Rect};
use slotmap::SlotMap;
use undo_engine::{Direction, UndoEngine, UndoEvent, UndoKind};

pub use blend::{blend_rgb, composite_over, dissolve_keeps_pixel};
pub use convert::PaletteType;
pub use floating_sel::{FloatTarget, FloatingSelError};
pub use indexed_quantize::DitherMode;
pub use undo_records::{ChannelCell, ChannelTable, LayerCell, LayerTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    InvalidArgument,
    NotFound,
    TypeMismatch,
    IllegalState,
    EmptyRegion,
    OutOfRange,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::InvalidArgument => write!(f, "invalid argument"),
            ImageError::NotFound => write!(f, "no such drawable, channel, or guide"),
            ImageError::TypeMismatch => write!(f, "incompatible drawable type"),
            ImageError::IllegalState => write!(f, "operation not legal in the current state"),
            ImageError::EmptyRegion => write!(f, "selection does not intersect the drawable"),
            ImageError::OutOfRange => write!(f, "coordinates out of range"),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<drawable_core::DrawableError> for ImageError {
    fn from(e: drawable_core::DrawableError) -> Self {
        match e {
            drawable_core::DrawableError::InvalidArgument => ImageError::InvalidArgument,
            drawable_core::DrawableError::OutOfRange => ImageError::OutOfRange,
        }
    }
}

impl From<pixel_region::PixelRegionError> for ImageError {
    fn from(_: pixel_region::PixelRegionError) -> Self {
        ImageError::OutOfRange
    }
}

impl From<tile_store::TileStoreError> for ImageError {
    fn from(_: tile_store::TileStoreError) -> Self {
        ImageError::OutOfRange
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BaseType {
    Rgb,
    Gray,
    Indexed,
}

impl BaseType {
    pub fn layer_pixel_type(self, with_alpha: bool) -> PixelType {
        match (self, with_alpha) {
            (BaseType::Rgb, false) => PixelType::Rgb,
            (BaseType::Rgb, true) => PixelType::Rgba,
            (BaseType::Gray, false) => PixelType::Gray,
            (BaseType::Gray, true) => PixelType::GrayAlpha,
            (BaseType::Indexed, false) => PixelType::Indexed,
            (BaseType::Indexed, true) => PixelType::IndexedAlpha,
        }
    }
}

/// Up to 256 RGB triples. Only meaningful when `base_type == Indexed`.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ColorMap {
    pub entries: Vec<(u8, u8, u8)>,
}

impl ColorMap {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() % 3 != 0 || bytes.len() > 768 {
            return Err(ImageError::InvalidArgument);
        }
        Ok(Self {
            entries: bytes.chunks(3).map(|c| (c[0], c[1], c[2])).collect(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.entries.iter().flat_map(|&(r, g, b)| [r, g, b]).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Unit {
    Inches,
    Millimeters,
    Points,
    Picas,
    Pixels,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    pub x: f64,
    pub y: f64,
    pub unit: Unit,
}

impl Default for Resolution {
    fn default() -> Self {
        Self { x: 72.0, y: 72.0, unit: Unit::Pixels }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GuideOrientation {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Guide {
    pub id: u32,
    pub orientation: GuideOrientation,
    pub position: i32,
    pub refcount: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Parasite {
    pub name: String,
    pub flags: u32,
    pub data: Vec<u8>,
}

struct QuickMaskState {
    channel_id: ChannelId,
    color: (u8, u8, u8),
}

/// How `Image::layer_create_mask` seeds a freshly attached mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskCreateMode {
    WhiteMask,
    BlackMask,
    AlphaMask,
}

/// Owner of the layer list, channel list, selection channel, colormap,
/// resolution, guides, parasites, active pointers, and the undo/redo
/// stacks. The one entry point every mutator in this crate addresses.
pub struct Image {
    id: ImageId,
    width: u32,
    height: u32,
    base_type: Rc<RefCell<BaseType>>,
    width_cell: Rc<RefCell<u32>>,
    height_cell: Rc<RefCell<u32>>,
    colormap: Rc<RefCell<Option<ColorMap>>>,
    resolution: Rc<RefCell<Resolution>>,
    filename: Option<String>,

    layers: LayerTable,
    layer_order: Rc<RefCell<Vec<LayerId>>>,
    channels: ChannelTable,
    channel_order: Rc<RefCell<Vec<ChannelId>>>,
    selection: ChannelCell,
    active_layer: Rc<RefCell<Option<LayerId>>>,
    active_channel: Rc<RefCell<Option<ChannelId>>>,
    floating_sel: Rc<RefCell<Option<LayerId>>>,
    activation_stack: Vec<LayerId>,

    guides: Rc<RefCell<Vec<Guide>>>,
    next_guide_id: u32,
    parasites: Rc<RefCell<Vec<Parasite>>>,
    next_tattoo: u32,

    quick_mask: Option<QuickMaskState>,

    undo: UndoEngine,
}

const DEFAULT_MAX_LEVELS: usize = 25;

/// A human-facing label for an undo/redo menu entry (`"Undo {name}"`).
fn undo_kind_name(kind: UndoKind) -> &'static str {
    match kind {
        UndoKind::ImageUndo => "Image",
        UndoKind::ImageModUndo => "Image Properties",
        UndoKind::MaskUndo => "Selection",
        UndoKind::LayerDisplaceUndo => "Move Layer",
        UndoKind::LayerMod => "Layer",
        UndoKind::LayerMaskAddUndo => "Add Layer Mask",
        UndoKind::LayerMaskRemoveUndo => "Remove Layer Mask",
        UndoKind::LayerAddUndo => "New Layer",
        UndoKind::LayerRemoveUndo => "Delete Layer",
        UndoKind::ChannelAddUndo => "New Channel",
        UndoKind::ChannelRemoveUndo => "Delete Channel",
        UndoKind::ChannelMod => "Channel",
        UndoKind::FsToLayerUndo => "Floating Selection to Layer",
        UndoKind::FsRigorUndo => "Float",
        UndoKind::FsRelaxUndo => "Float",
        UndoKind::FsAnchorUndo => "Anchor Floating Selection",
        UndoKind::FloatMaskUndo => "Float Selection",
        UndoKind::GimageMod => "Resize Image",
        UndoKind::GuideUndo => "Guide",
        UndoKind::ResolutionUndo => "Change Resolution",
        UndoKind::QmaskUndo => "Quick Mask",
        UndoKind::ParasiteUndo => "Parasite",
        UndoKind::LayerRenameUndo => "Rename Layer",
        UndoKind::ConvertTypeUndo => "Convert Image Type",
        UndoKind::CantUndo => "Unknown",
    }
}

/// Deep-copies a layer mask's pixel content into a fresh `LayerMask`, the
/// same tile-by-tile region copy `Layer::copy` uses for its own mask, so
/// `apply_layer_mask` can hand the undo payload a snapshot that survives
/// the original mask being consumed by `Layer::apply_mask`.
fn duplicate_mask(mask: &drawable_core::LayerMask, owner: ImageId) -> Result<drawable_core::LayerMask, ImageError> {
    let mut dup = drawable_core::LayerMask::new(owner, mask.header.width, mask.header.height)?;
    let src = mask.header.region(mask.header.full_rect(), false)?;
    let dst = dup.header.region(dup.header.full_rect(), true)?;
    let mut cursor = register_regions(&[&src, &dst])?;
    while let Some(chunks) = cursor.process() {
        let (s, d) = (&chunks[0], &chunks[1]);
        for row in 0..s.height() {
            d.row_mut(row).copy_from_slice(&s.row(row));
        }
    }
    Ok(dup)
}

impl Image {
    pub fn new(id: ImageId, width: u32, height: u32, base_type: BaseType) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidArgument);
        }
        let selection = Channel::new(id, width, height)?;
        Ok(Self {
            id,
            width,
            height,
            base_type: Rc::new(RefCell::new(base_type)),
            width_cell: Rc::new(RefCell::new(width)),
            height_cell: Rc::new(RefCell::new(height)),
            colormap: Rc::new(RefCell::new(None)),
            resolution: Rc::new(RefCell::new(Resolution::default())),
            filename: None,
            layers: Rc::new(RefCell::new(SlotMap::with_key())),
            layer_order: Rc::new(RefCell::new(Vec::new())),
            channels: Rc::new(RefCell::new(SlotMap::with_key())),
            channel_order: Rc::new(RefCell::new(Vec::new())),
            selection: Rc::new(RefCell::new(selection)),
            active_layer: Rc::new(RefCell::new(None)),
            active_channel: Rc::new(RefCell::new(None)),
            floating_sel: Rc::new(RefCell::new(None)),
            activation_stack: Vec::new(),
            guides: Rc::new(RefCell::new(Vec::new())),
            next_guide_id: 1,
            parasites: Rc::new(RefCell::new(Vec::new())),
            next_tattoo: 1,
            quick_mask: None,
            undo: UndoEngine::new(DEFAULT_MAX_LEVELS),
        })
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, filename: Option<String>) {
        self.filename = filename;
    }

    /// Hands out a fresh tattoo (a stable id that survives copy/paste,
    /// unlike the slotmap key, which is only stable within one session).
    pub fn new_tattoo(&mut self) -> u32 {
        let t = self.next_tattoo;
        self.next_tattoo += 1;
        t
    }

    /// Deep-copies every layer, channel, the selection, active pointers,
    /// and the colormap into a fresh `Image`. Undo history and guides are
    /// not carried over, matching a freshly opened document.
    pub fn duplicate(&self, new_id: ImageId) -> Result<Image, ImageError> {
        let mut out = Image::new(new_id, self.width(), self.height(), self.base_type())?;
        out.colormap = Rc::new(RefCell::new(self.colormap.borrow().clone()));
        out.resolution = Rc::new(RefCell::new(self.resolution()));
        out.filename = self.filename.clone();
        for &id in self.layer_order.borrow().iter().rev() {
            if let Some(cell) = self.layer(id) {
                let copy = cell.borrow().copy(new_id)?;
                out.add_layer(copy);
            }
        }
        out.set_active_layer(None)?;
        for &id in self.channel_order.borrow().iter().rev() {
            if let Some(cell) = self.channel(id) {
                let bytes = cell.borrow().snapshot_bytes()?;
                let mut copy = Channel::new(new_id, self.width(), self.height())?;
                copy.restore_bytes(&bytes)?;
                out.add_channel(copy);
            }
        }
        let sel_bytes = self.selection.borrow().snapshot_bytes()?;
        out.selection.borrow_mut().restore_bytes(&sel_bytes)?;
        out.undo.mark_clean();
        Ok(out)
    }

    /// Resizes the canvas to `(new_width, new_height)`, sliding every
    /// existing layer by `(offx, offy)` so its content stays put relative
    /// to the old canvas origin. The selection is reset to empty at the
    /// new extents (selections do not survive a canvas resize).
    pub fn resize(&mut self, new_width: u32, new_height: u32, offx: i32, offy: i32) -> Result<(), ImageError> {
        if new_width == 0 || new_height == 0 {
            return Err(ImageError::InvalidArgument);
        }
        let prior = (self.width(), self.height(), self.base_type());
        self.undo.push(
            UndoKind::GimageMod,
            Some(Box::new(undo_records::ImageModPayload {
                width: self.width_cell.clone(),
                height: self.height_cell.clone(),
                base_type: self.base_type.clone(),
                prior,
            })),
            0,
            true,
        );
        *self.width_cell.borrow_mut() = new_width;
        *self.height_cell.borrow_mut() = new_height;
        for &id in self.layer_order.borrow().iter() {
            if let Some(cell) = self.layer(id) {
                cell.borrow_mut().translate(offx, offy);
            }
        }
        let mut fresh = Channel::new(self.id, new_width, new_height)?;
        fresh.color = self.selection.borrow().color;
        *self.selection.borrow_mut() = fresh;
        Ok(())
    }

    /// Resamples every layer to `(new_width, new_height)` and resets the
    /// selection at the new extents.
    pub fn scale(&mut self, new_width: u32, new_height: u32) -> Result<(), ImageError> {
        if new_width == 0 || new_height == 0 {
            return Err(ImageError::InvalidArgument);
        }
        let prior = (self.width(), self.height(), self.base_type());
        self.undo.push(
            UndoKind::GimageMod,
            Some(Box::new(undo_records::ImageModPayload {
                width: self.width_cell.clone(),
                height: self.height_cell.clone(),
                base_type: self.base_type.clone(),
                prior,
            })),
            0,
            true,
        );
        *self.width_cell.borrow_mut() = new_width;
        *self.height_cell.borrow_mut() = new_height;
        for &id in self.layer_order.borrow().iter() {
            if let Some(cell) = self.layer(id) {
                cell.borrow_mut().scale(new_width, new_height)?;
            }
        }
        *self.selection.borrow_mut() = Channel::new(self.id, new_width, new_height)?;
        Ok(())
    }

    pub fn width(&self) -> u32 {
        *self.width_cell.borrow()
    }

    pub fn height(&self) -> u32 {
        *self.height_cell.borrow()
    }

    pub fn base_type(&self) -> BaseType {
        *self.base_type.borrow()
    }

    pub fn colormap(&self) -> Option<ColorMap> {
        self.colormap.borrow().clone()
    }

    pub fn set_colormap(&mut self, colormap: Option<ColorMap>) -> Result<(), ImageError> {
        if colormap.is_some() && self.base_type() != BaseType::Indexed {
            return Err(ImageError::TypeMismatch);
        }
        let prior = self.colormap.borrow().clone();
        *self.colormap.borrow_mut() = colormap;
        self.undo.push(
            UndoKind::ImageModUndo,
            Some(Box::new(undo_records::ColormapPayload { colormap: self.colormap.clone(), prior })),
            0,
            true,
        );
        Ok(())
    }

    pub fn resolution(&self) -> Resolution {
        *self.resolution.borrow()
    }

    pub fn set_resolution(&mut self, resolution: Resolution) {
        let prior = *self.resolution.borrow();
        *self.resolution.borrow_mut() = resolution;
        self.undo.push(
            UndoKind::ResolutionUndo,
            Some(Box::new(undo_records::ResolutionPayload {
                resolution: self.resolution.clone(),
                prior,
            })),
            std::mem::size_of::<Resolution>(),
            true,
        );
    }

    pub fn set_event_callback(&mut self, callback: Option<Box<dyn FnMut(UndoEvent)>>) {
        self.undo.set_event_callback(callback);
    }

    pub fn is_clean(&self) -> bool {
        self.undo.is_clean()
    }

    pub fn clean_all(&mut self) {
        self.undo.mark_clean();
    }

    pub fn enable_undo(&mut self) {
        self.undo.set_enabled(true);
    }

    pub fn disable_undo(&mut self) {
        self.undo.set_enabled(false);
    }

    pub fn undo_freeze(&mut self) {
        self.undo.freeze();
    }

    pub fn undo_thaw(&mut self) {
        self.undo.thaw();
    }

    pub fn undo_push_group_start(&mut self, kind: UndoKind) {
        self.undo.group_start(kind);
    }

    pub fn undo_push_group_end(&mut self) {
        self.undo.group_end();
    }

    /// IllegalState if a group is open, per §7.
    pub fn undo_pop(&mut self) -> Result<bool, ImageError> {
        if self.undo.is_group_open() {
            return Err(ImageError::IllegalState);
        }
        Ok(self.undo.pop(Direction::Undo))
    }

    pub fn undo_redo(&mut self) -> Result<bool, ImageError> {
        if self.undo.is_group_open() {
            return Err(ImageError::IllegalState);
        }
        Ok(self.undo.pop(Direction::Redo))
    }

    pub fn undo_levels(&self) -> usize {
        self.undo.levels()
    }

    pub fn undo_get_undo_name(&self) -> Option<&'static str> {
        self.undo.peek_kind(Direction::Undo).map(undo_kind_name)
    }

    pub fn undo_get_redo_name(&self) -> Option<&'static str> {
        self.undo.peek_kind(Direction::Redo).map(undo_kind_name)
    }

    /// Discards the entire undo and redo history, firing `UndoEvent::Freed`
    /// once through any registered event callback, which carries over to
    /// the fresh engine.
    pub fn undo_free(&mut self) {
        let max_levels = self.undo.max_levels();
        let mut callback = self.undo.take_event_callback();
        if let Some(cb) = &mut callback {
            cb(UndoEvent::Freed);
        }
        self.undo = UndoEngine::new(max_levels);
        self.undo.set_event_callback(callback);
    }

    // ---- layers ----

    pub fn layer(&self, id: LayerId) -> Option<LayerCell> {
        self.layers.borrow().get(id).cloned()
    }

    pub fn layer_order(&self) -> Vec<LayerId> {
        self.layer_order.borrow().clone()
    }

    pub fn active_layer(&self) -> Option<LayerId> {
        *self.active_layer.borrow()
    }

    pub fn set_active_layer(&mut self, id: Option<LayerId>) -> Result<(), ImageError> {
        if let Some(id) = id {
            if !self.layer_order.borrow().contains(&id) {
                return Err(ImageError::NotFound);
            }
        }
        *self.active_layer.borrow_mut() = id;
        Ok(())
    }

    pub fn floating_selection(&self) -> Option<LayerId> {
        *self.floating_sel.borrow()
    }

    /// Inserts `layer` at the top of the display order and pushes
    /// `LAYER_ADD_UNDO`. Returns the new layer's stable id.
    pub fn add_layer(&mut self, layer: Layer) -> LayerId {
        let id = self.layers.borrow_mut().insert(Rc::new(RefCell::new(layer)));
        let prior_active = *self.active_layer.borrow();
        self.layer_order.borrow_mut().insert(0, id);
        *self.active_layer.borrow_mut() = Some(id);
        self.undo.push(
            UndoKind::LayerAddUndo,
            Some(Box::new(undo_records::LayerPresencePayload {
                layers: self.layers.clone(),
                layer_order: self.layer_order.clone(),
                active_layer: self.active_layer.clone(),
                layer_id: id,
                position: 0,
                prior_active,
                undo_inserts: false,
                currently_absent: false,
            })),
            0,
            true,
        );
        id
    }

    pub fn remove_layer(&mut self, id: LayerId) -> Result<(), ImageError> {
        let mut order = self.layer_order.borrow_mut();
        let position = order.iter().position(|&l| l == id).ok_or(ImageError::NotFound)?;
        order.remove(position);
        drop(order);
        let prior_active = *self.active_layer.borrow();
        if prior_active == Some(id) {
            *self.active_layer.borrow_mut() = None;
        }
        self.undo.push(
            UndoKind::LayerRemoveUndo,
            Some(Box::new(undo_records::LayerPresencePayload {
                layers: self.layers.clone(),
                layer_order: self.layer_order.clone(),
                active_layer: self.active_layer.clone(),
                layer_id: id,
                position,
                prior_active,
                undo_inserts: true,
                currently_absent: true,
            })),
            0,
            true,
        );
        Ok(())
    }

    /// Extends or crops `id`'s own canvas to `(new_width, new_height)`
    /// around reference point `(offx, offy)`, filling newly introduced
    /// area with `background` when the layer has no alpha channel (§4.2).
    /// Pushes a whole-header `LAYER_MOD` undo.
    pub fn layer_resize(
        &mut self,
        id: LayerId,
        new_width: u32,
        new_height: u32,
        offx: i32,
        offy: i32,
        background: (u8, u8, u8),
    ) -> Result<(), ImageError> {
        if new_width == 0 || new_height == 0 {
            return Err(ImageError::InvalidArgument);
        }
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        let pixel_type = cell.borrow().header.pixel_type;
        let bpp = pixel_type.bytes_per_pixel() as usize;
        let mut fill = vec![0u8; bpp];
        blend::write_rgb_to_pixel(&mut fill, pixel_type, [background.0, background.1, background.2], 255, &self.colormap.borrow());
        let prior = cell.borrow_mut().resize(new_width, new_height, offx, offy, &fill)?;
        self.undo.push(
            UndoKind::LayerMod,
            Some(Box::new(undo_records::LayerModPayload { layer: cell.clone(), prior: RefCell::new(Some(prior)) })),
            (new_width * new_height) as usize,
            true,
        );
        Ok(())
    }

    /// Resamples layer `id` to `(new_width, new_height)`. Unlike
    /// `layer_resize`, this rebuilds tile storage from scratch, so only
    /// dirtiness is tracked (`LAYER_MOD` with no payload), matching
    /// `set_colormap`'s precedent for operations with no cheap undo.
    pub fn scale_layer(&mut self, id: LayerId, new_width: u32, new_height: u32) -> Result<(), ImageError> {
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        cell.borrow_mut().scale(new_width, new_height)?;
        self.undo.push(UndoKind::LayerMod, None, 0, true);
        Ok(())
    }

    /// Promotes layer `id` to carry an alpha channel, a no-op if it
    /// already does.
    pub fn layer_add_alpha(&mut self, id: LayerId) -> Result<(), ImageError> {
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        cell.borrow_mut().add_alpha()?;
        self.undo.push(UndoKind::LayerMod, None, 0, true);
        Ok(())
    }

    pub fn translate_layer(&mut self, id: LayerId, dx: i32, dy: i32) -> Result<(), ImageError> {
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        let offsets = (cell.borrow().header.offset_x, cell.borrow().header.offset_y);
        self.undo.push(
            UndoKind::LayerDisplaceUndo,
            Some(Box::new(undo_records::LayerDisplacePayload { layer: cell.clone(), offsets })),
            0,
            true,
        );
        cell.borrow_mut().translate(dx, dy);
        Ok(())
    }

    pub fn rename_layer(&mut self, id: LayerId, name: impl Into<String>) -> Result<(), ImageError> {
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        let old_name = cell.borrow().header.name.clone();
        self.undo.push(
            UndoKind::LayerRenameUndo,
            Some(Box::new(undo_records::LayerRenamePayload { layer: cell.clone(), name: old_name })),
            0,
            true,
        );
        cell.borrow_mut().header.name = name.into();
        Ok(())
    }

    pub fn add_layer_mask(&mut self, id: LayerId) -> Result<(), ImageError> {
        self.layer_create_mask(id, MaskCreateMode::WhiteMask)
    }

    /// Attaches a mask to `id`, seeded per `mode`: fully opaque, fully
    /// transparent, or copied from the layer's own alpha channel.
    pub fn layer_create_mask(&mut self, id: LayerId, mode: MaskCreateMode) -> Result<(), ImageError> {
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        if cell.borrow().mask.is_some() {
            return Err(ImageError::IllegalState);
        }
        self.undo.push(
            UndoKind::LayerMaskAddUndo,
            Some(Box::new(undo_records::LayerMaskPresencePayload { layer: cell.clone(), mask: RefCell::new(None) })),
            0,
            true,
        );
        let mut layer = cell.borrow_mut();
        layer.add_mask()?;
        let mask = layer.mask.as_mut().expect("just attached");
        match mode {
            MaskCreateMode::BlackMask => {}
            MaskCreateMode::WhiteMask => {
                let region = mask.header.region(mask.header.full_rect(), true)?;
                for chunk in region.iter() {
                    for row in 0..chunk.height() {
                        chunk.row_mut(row).fill(255);
                    }
                }
            }
            MaskCreateMode::AlphaMask => {
                if layer.header.pixel_type.has_alpha() {
                    let bpp = layer.header.pixel_type.bytes_per_pixel() as usize;
                    let alpha_offset = bpp - 1;
                    let src = layer.header.region(layer.header.full_rect(), false)?;
                    let dst = mask.header.region(mask.header.full_rect(), true)?;
                    let mut cursor = register_regions(&[&src, &dst])?;
                    while let Some(chunks) = cursor.process() {
                        let (s, d) = (&chunks[0], &chunks[1]);
                        for row in 0..s.height() {
                            let src_row = s.row(row);
                            let mut dst_row = d.row_mut(row);
                            for x in 0..s.width() as usize {
                                dst_row[x] = src_row[x * bpp + alpha_offset];
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Deep-copies `id` within the same image, adding the copy at the top
    /// and optionally promoting it to carry an alpha channel.
    pub fn layer_copy(&mut self, id: LayerId, add_alpha: bool) -> Result<LayerId, ImageError> {
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        let mut copy = cell.borrow().copy(self.id)?;
        if add_alpha {
            copy.add_alpha()?;
        }
        Ok(self.add_layer(copy))
    }

    pub fn apply_layer_mask(&mut self, id: LayerId, mode: ApplyMaskMode) -> Result<(), ImageError> {
        let cell = self.layer(id).ok_or(ImageError::NotFound)?;
        let duplicate = {
            let layer = cell.borrow();
            let mask = layer.mask.as_ref().ok_or(ImageError::IllegalState)?;
            duplicate_mask(mask, self.id)?
        };
        self.undo.push(
            UndoKind::LayerMaskRemoveUndo,
            Some(Box::new(undo_records::LayerMaskPresencePayload { layer: cell.clone(), mask: RefCell::new(Some(duplicate)) })),
            0,
            true,
        );
        cell.borrow_mut().apply_mask(mode)?;
        Ok(())
    }

    // ---- channels ----

    pub fn channel(&self, id: ChannelId) -> Option<ChannelCell> {
        self.channels.borrow().get(id).cloned()
    }

    pub fn channel_order(&self) -> Vec<ChannelId> {
        self.channel_order.borrow().clone()
    }

    /// Creates a new, empty channel with the given display name, opacity
    /// (a percentage, 0-100, converted to the byte scale the channel
    /// stores internally), and overlay color, and appends it.
    pub fn channel_new(&mut self, name: impl Into<String>, opacity_percent: u8, color: (u8, u8, u8)) -> Result<ChannelId, ImageError> {
        let mut channel = Channel::new(self.id, self.width(), self.height())?;
        channel.header.name = name.into();
        channel.opacity = ((opacity_percent.min(100) as u32 * 255) / 100) as u8;
        channel.color = color;
        channel.tattoo = self.new_tattoo();
        Ok(self.add_channel(channel))
    }

    pub fn channel_copy(&mut self, id: ChannelId) -> Result<ChannelId, ImageError> {
        let cell = self.channel(id).ok_or(ImageError::NotFound)?;
        let source = cell.borrow();
        let mut copy = Channel::new(self.id, self.width(), self.height())?;
        copy.header.name = format!("{} copy", source.header.name);
        copy.color = source.color;
        copy.opacity = source.opacity;
        copy.show_masked = source.show_masked;
        let bytes = source.snapshot_bytes()?;
        drop(source);
        copy.restore_bytes(&bytes)?;
        copy.tattoo = self.new_tattoo();
        Ok(self.add_channel(copy))
    }

    pub fn add_channel(&mut self, channel: Channel) -> ChannelId {
        let id = self.channels.borrow_mut().insert(Rc::new(RefCell::new(channel)));
        let prior_active = *self.active_channel.borrow();
        self.channel_order.borrow_mut().insert(0, id);
        *self.active_channel.borrow_mut() = Some(id);
        self.undo.push(
            UndoKind::ChannelAddUndo,
            Some(Box::new(undo_records::ChannelPresencePayload {
                channels: self.channels.clone(),
                channel_order: self.channel_order.clone(),
                active_channel: self.active_channel.clone(),
                channel_id: id,
                position: 0,
                prior_active,
                undo_inserts: false,
                currently_absent: false,
            })),
            0,
            true,
        );
        id
    }

    pub fn remove_channel(&mut self, id: ChannelId) -> Result<(), ImageError> {
        let mut order = self.channel_order.borrow_mut();
        let position = order.iter().position(|&c| c == id).ok_or(ImageError::NotFound)?;
        order.remove(position);
        drop(order);
        let prior_active = *self.active_channel.borrow();
        if prior_active == Some(id) {
            *self.active_channel.borrow_mut() = None;
        }
        self.undo.push(
            UndoKind::ChannelRemoveUndo,
            Some(Box::new(undo_records::ChannelPresencePayload {
                channels: self.channels.clone(),
                channel_order: self.channel_order.clone(),
                active_channel: self.active_channel.clone(),
                channel_id: id,
                position,
                prior_active,
                undo_inserts: true,
                currently_absent: true,
            })),
            0,
            true,
        );
        Ok(())
    }

    // ---- selection (the distinguished channel) ----

    fn push_mask_undo(&mut self) -> Result<(), ImageError> {
        let snapshot = self.selection.borrow().snapshot_bytes()?;
        self.undo.push(
            UndoKind::MaskUndo,
            Some(Box::new(undo_records::MaskPayload {
                channel: self.selection.clone(),
                snapshot: RefCell::new(snapshot),
                rect: Rect::new(0, 0, self.width(), self.height()),
            })),
            (self.width() * self.height()) as usize,
            true,
        );
        Ok(())
    }

    pub fn mask_is_empty(&self) -> bool {
        self.selection.borrow().is_empty()
    }

    pub fn mask_bounds(&self) -> Result<Rect, ImageError> {
        Ok(self.selection.borrow_mut().bounds()?)
    }

    pub fn mask_value(&self, x: u32, y: u32) -> Result<u8, ImageError> {
        if x >= self.width() || y >= self.height() {
            return Err(ImageError::OutOfRange);
        }
        let selection = self.selection.borrow();
        let bytes = selection.snapshot_bytes()?;
        Ok(bytes[(y * self.width() + x) as usize])
    }

    pub fn mask_combine_rect(&mut self, op: CombineOp, rect: Rect) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().combine_rect(rect, op)?;
        Ok(())
    }

    pub fn mask_combine_ellipse(
        &mut self,
        op: CombineOp,
        rect: Rect,
        antialias: bool,
    ) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().combine_ellipse(rect, op, antialias)?;
        Ok(())
    }

    pub fn mask_all(&mut self) -> Result<(), ImageError> {
        self.mask_combine_rect(CombineOp::Replace, Rect::new(0, 0, self.width(), self.height()))
    }

    pub fn mask_none(&mut self) -> Result<(), ImageError> {
        self.mask_clear()
    }

    pub fn mask_clear(&mut self) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().clear()?;
        Ok(())
    }

    pub fn mask_invert(&mut self) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().invert()?;
        Ok(())
    }

    pub fn mask_sharpen(&mut self) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().sharpen()?;
        Ok(())
    }

    pub fn mask_feather(&mut self, radius: u32) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().feather(radius, radius)?;
        Ok(())
    }

    pub fn mask_grow(&mut self, radius: u32) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().grow(radius)?;
        Ok(())
    }

    pub fn mask_shrink(&mut self, radius: u32) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().shrink(radius)?;
        Ok(())
    }

    pub fn mask_border(&mut self, radius: u32) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().border(radius)?;
        Ok(())
    }

    pub fn mask_translate(&mut self, dx: i32, dy: i32) -> Result<(), ImageError> {
        self.push_mask_undo()?;
        self.selection.borrow_mut().translate(dx, dy)?;
        Ok(())
    }

    pub fn mask_layer_alpha(&mut self, layer_id: LayerId) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        self.push_mask_undo()?;
        self.selection.borrow_mut().lift_layer_alpha(&cell.borrow().header)?;
        Ok(())
    }

    /// Loads the selection from `layer_id`'s attached layer mask.
    /// IllegalState if the layer has no mask.
    pub fn mask_layer_mask(&mut self, layer_id: LayerId) -> Result<(), ImageError> {
        let cell = self.layer(layer_id).ok_or(ImageError::NotFound)?;
        if cell.borrow().mask.is_none() {
            return Err(ImageError::IllegalState);
        }
        self.push_mask_undo()?;
        let layer = cell.borrow();
        let mask = layer.mask.as_ref().expect("checked above");
        self.selection.borrow_mut().lift_layer_mask(&mask.header)?;
        Ok(())
    }

    pub fn mask_load(&mut self, channel_id: ChannelId) -> Result<(), ImageError> {
        let cell = self.channel(channel_id).ok_or(ImageError::NotFound)?;
        self.push_mask_undo()?;
        self.selection.borrow_mut().load(&cell.borrow())?;
        Ok(())
    }

    /// Snapshots the current selection into a fresh channel appended to
    /// the channel list, returning its id.
    pub fn mask_save(&mut self) -> Result<ChannelId, ImageError> {
        let mut copy = Channel::new(self.id, self.width(), self.height())?;
        let bytes = self.selection.borrow().snapshot_bytes()?;
        copy.restore_bytes(&bytes)?;
        Ok(self.add_channel(copy))
    }

    pub fn mask_boundary(&self) -> Result<(Vec<BoundarySegment>, Vec<BoundarySegment>), ImageError> {
        Ok(self.selection.borrow_mut().boundary()?.clone())
    }

    /// Paints the selection's boundary onto `drawable_id` as a one-pixel
    /// black stroke. Real brush dynamics (width, color, blend mode) are a
    /// tool-layer concern sitting above this core, not reproduced here.
    pub fn mask_stroke(&mut self, drawable_id: LayerId) -> Result<(), ImageError> {
        let (segments, _) = self.mask_boundary()?;
        let cell = self.layer(drawable_id).ok_or(ImageError::NotFound)?;
        let mut layer = cell.borrow_mut();
        let bpp = layer.header.pixel_type.bytes_per_pixel() as usize;
        let (w, h) = (layer.header.width, layer.header.height);
        for seg in &segments {
            let lo_x = seg.x1.min(seg.x2).max(0) as u32;
            let hi_x = (seg.x1.max(seg.x2) as u32).min(w);
            let lo_y = seg.y1.min(seg.y2).max(0) as u32;
            let hi_y = (seg.y1.max(seg.y2) as u32).min(h);
            for y in lo_y..=hi_y.min(h.saturating_sub(1)) {
                for x in lo_x..=hi_x.min(w.saturating_sub(1)) {
                    if let Ok((tx, ty)) = layer.header.tiles.tile_containing(x, y) {
                        if let Ok(handle) = layer.header.tiles.get_tile(tx, ty, true, true) {
                            let geom = handle.geometry();
                            let lx = x - geom.origin_x;
                            let ly = y - geom.origin_y;
                            let offset = (ly as usize * geom.rowstride()) + (lx as usize * bpp);
                            handle.data_mut()[offset..offset + bpp].fill(0);
                        }
                    }
                }
            }
        }
        layer.header.mark_dirty(layer.header.full_rect());
        Ok(())
    }

    // ---- guides ----

    pub fn add_hguide(&mut self, y: i32) -> Result<u32, ImageError> {
        self.add_guide(GuideOrientation::Horizontal, y)
    }

    pub fn add_vguide(&mut self, x: i32) -> Result<u32, ImageError> {
        self.add_guide(GuideOrientation::Vertical, x)
    }

    fn add_guide(&mut self, orientation: GuideOrientation, position: i32) -> Result<u32, ImageError> {
        let limit = match orientation {
            GuideOrientation::Horizontal => self.height() as i32,
            GuideOrientation::Vertical => self.width() as i32,
        };
        if position < 0 || position > limit {
            return Err(ImageError::OutOfRange);
        }
        let id = self.next_guide_id;
        self.next_guide_id += 1;
        self.guides.borrow_mut().push(Guide { id, orientation, position, refcount: 0 });
        self.undo.push(
            UndoKind::GuideUndo,
            Some(Box::new(undo_records::GuidePayload { guides: self.guides.clone(), guide_id: id, prior: None })),
            0,
            true,
        );
        Ok(id)
    }

    pub fn delete_guide(&mut self, id: u32) -> Result<(), ImageError> {
        let prior = {
            let guides = self.guides.borrow();
            guides.iter().find(|g| g.id == id).cloned().ok_or(ImageError::NotFound)?
        };
        self.guides.borrow_mut().retain(|g| g.id != id);
        self.undo.push(
            UndoKind::GuideUndo,
            Some(Box::new(undo_records::GuidePayload { guides: self.guides.clone(), guide_id: id, prior: Some(prior) })),
            0,
            true,
        );
        Ok(())
    }

    pub fn findnext_guide(&self, prev_id: u32) -> Option<u32> {
        let guides = self.guides.borrow();
        if prev_id == 0 {
            guides.first().map(|g| g.id)
        } else {
            let idx = guides.iter().position(|g| g.id == prev_id)?;
            guides.get(idx + 1).map(|g| g.id)
        }
    }

    /// Every guide in insertion order, for callers that need to
    /// enumerate rather than walk `findnext_guide` one at a time.
    pub fn guides(&self) -> Vec<Guide> {
        self.guides.borrow().clone()
    }

    pub fn guide_orientation(&self, id: u32) -> Result<GuideOrientation, ImageError> {
        self.guides.borrow().iter().find(|g| g.id == id).map(|g| g.orientation).ok_or(ImageError::NotFound)
    }

    pub fn guide_position(&self, id: u32) -> Result<i32, ImageError> {
        self.guides.borrow().iter().find(|g| g.id == id).map(|g| g.position).ok_or(ImageError::NotFound)
    }

    // ---- parasites ----

    pub fn find_parasite(&self, name: &str) -> Option<Parasite> {
        self.parasites.borrow().iter().find(|p| p.name == name).cloned()
    }

    /// Every attached parasite, for callers (e.g. a save path) that need
    /// to enumerate rather than look one up by name.
    pub fn parasites(&self) -> Vec<Parasite> {
        self.parasites.borrow().clone()
    }

    pub fn attach_parasite(&mut self, parasite: Parasite) {
        let prior = self.find_parasite(&parasite.name);
        let name = parasite.name.clone();
        let mut parasites = self.parasites.borrow_mut();
        if let Some(slot) = parasites.iter_mut().find(|p| p.name == name) {
            *slot = parasite;
        } else {
            parasites.push(parasite);
        }
        drop(parasites);
        self.undo.push(
            UndoKind::ParasiteUndo,
            Some(Box::new(undo_records::ParasitePayload { parasites: self.parasites.clone(), name, prior })),
            0,
            true,
        );
    }

    pub fn detach_parasite(&mut self, name: &str) -> Result<(), ImageError> {
        let prior = self.find_parasite(name).ok_or(ImageError::NotFound)?;
        self.parasites.borrow_mut().retain(|p| p.name != name);
        self.undo.push(
            UndoKind::ParasiteUndo,
            Some(Box::new(undo_records::ParasitePayload {
                parasites: self.parasites.clone(),
                name: name.to_string(),
                prior: Some(prior),
            })),
            0,
            true,
        );
        Ok(())
    }

    // ---- quick mask (S3) ----

    pub fn quick_mask_active(&self) -> bool {
        self.quick_mask.is_some()
    }

    /// Creates a white "Qmask" channel at the top of the channel list,
    /// clears the selection, and remembers its id for `exit_quick_mask`.
    pub fn enter_quick_mask(&mut self, color: (u8, u8, u8)) -> Result<(), ImageError> {
        if self.quick_mask.is_some() {
            return Err(ImageError::IllegalState);
        }
        let mut qmask = Channel::new(self.id, self.width(), self.height())?;
        qmask.combine_rect(Rect::new(0, 0, self.width(), self.height()), CombineOp::Replace)?;
        let channel_id = self.add_channel(qmask);
        if let Some(cell) = self.channel(channel_id) {
            cell.borrow_mut().header.name = "Qmask".to_string();
        }
        self.mask_clear()?;
        self.quick_mask = Some(QuickMaskState { channel_id, color });
        self.undo.push(UndoKind::QmaskUndo, None, 0, true);
        Ok(())
    }

    /// Loads the selection directly from the Qmask channel's pixel
    /// values (a black pixel becomes selection value 0, white becomes
    /// 255) and removes the Qmask channel.
    pub fn exit_quick_mask(&mut self) -> Result<(), ImageError> {
        let state = self.quick_mask.take().ok_or(ImageError::IllegalState)?;
        let qmask_cell = self.channel(state.channel_id).ok_or(ImageError::NotFound)?;
        let qmask_bytes = qmask_cell.borrow().snapshot_bytes()?;
        self.push_mask_undo()?;
        self.selection.borrow_mut().restore_bytes(&qmask_bytes)?;
        self.remove_channel(state.channel_id)?;
        self.undo.push(UndoKind::QmaskUndo, None, 0, true);
        Ok(())
    }

    pub fn quick_mask_channel(&self) -> Option<ChannelId> {
        self.quick_mask.as_ref().map(|s| s.channel_id)
    }

    // ---- composition ----

    /// Renders the bottom-up composite of every visible layer into an
    /// RGBA8 buffer of `width * height * 4` bytes. The selection channel
    /// is not an input; `quick_mask_active` callers should overlay it
    /// separately as a colored translucent layer (§4.6).
    pub fn projection(&self) -> Vec<u8> {
        let (w, h) = (self.width(), self.height());
        let mut out = vec![0u8; (w as usize) * (h as usize) * 4];
        let order = self.layer_order.borrow();
        for &id in order.iter().rev() {
            let Some(cell) = self.layers.borrow().get(id).cloned() else { continue };
            let layer = cell.borrow();
            if !layer.header.visible {
                continue;
            }
            blend::composite_layer(&layer, &self.colormap.borrow(), w, h, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_image(w: u32, h: u32) -> Image {
        Image::new(ImageId::default(), w, h, BaseType::Rgb).unwrap()
    }

    #[test]
    fn channel_new_and_copy_each_get_a_distinct_tattoo() {
        let mut image = new_image(4, 4);
        let a = image.channel_new("a", 50, (0, 0, 0)).unwrap();
        let b = image.channel_copy(a).unwrap();
        let tattoo_a = image.channel(a).unwrap().borrow().tattoo;
        let tattoo_b = image.channel(b).unwrap().borrow().tattoo;
        assert_ne!(tattoo_a, 0);
        assert_ne!(tattoo_b, 0);
        assert_ne!(tattoo_a, tattoo_b);
    }

    #[test]
    fn apply_layer_mask_undo_restores_the_original_mask_content() {
        let mut image = new_image(4, 4);
        let layer = Layer::new(image.id(), "l", 4, 4, PixelType::Rgba).unwrap();
        let id = image.add_layer(layer);
        image.layer_create_mask(id, MaskCreateMode::WhiteMask).unwrap();
        {
            let cell = image.layer(id).unwrap();
            let mut layer = cell.borrow_mut();
            let mask = layer.mask.as_mut().unwrap();
            let region = mask.header.region(mask.header.full_rect(), true).unwrap();
            for chunk in region.iter() {
                for row in 0..chunk.height() {
                    chunk.row_mut(row).fill(77);
                }
            }
        }
        image.apply_layer_mask(id, ApplyMaskMode::Discard).unwrap();
        assert!(image.layer(id).unwrap().borrow().mask.is_none());

        image.undo_pop().unwrap();
        let cell = image.layer(id).unwrap();
        let layer = cell.borrow();
        let mask = layer.mask.as_ref().expect("undo restores the removed mask");
        let region = mask.header.region(mask.header.full_rect(), false).unwrap();
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                assert!(chunk.row(row).iter().all(|&b| b == 77));
            }
        }
    }

    #[test]
    fn mask_layer_mask_requires_a_mask_to_be_attached() {
        let mut image = new_image(4, 4);
        let layer = Layer::new(image.id(), "l", 4, 4, PixelType::Rgb).unwrap();
        let id = image.add_layer(layer);
        assert_eq!(image.mask_layer_mask(id).unwrap_err(), ImageError::IllegalState);
    }

    #[test]
    fn mask_layer_mask_loads_selection_from_mask_pixels() {
        let mut image = new_image(4, 4);
        let layer = Layer::new(image.id(), "l", 4, 4, PixelType::Rgb).unwrap();
        let id = image.add_layer(layer);
        image.layer_create_mask(id, MaskCreateMode::WhiteMask).unwrap();
        image.mask_layer_mask(id).unwrap();
        assert!(!image.mask_is_empty());
        assert_eq!(image.mask_value(0, 0).unwrap(), 255);
    }

    #[test]
    fn undo_names_reflect_the_next_action_each_direction_would_apply() {
        let mut image = new_image(4, 4);
        assert!(image.undo_get_undo_name().is_none());
        image.add_hguide(2).unwrap();
        assert_eq!(image.undo_get_undo_name(), Some("Guide"));
        assert!(image.undo_get_redo_name().is_none());
        image.undo_pop().unwrap();
        assert_eq!(image.undo_get_redo_name(), Some("Guide"));
    }

    #[test]
    fn undo_free_drops_all_history_but_keeps_undo_usable_afterward() {
        let mut image = new_image(4, 4);
        image.add_hguide(2).unwrap();
        image.add_hguide(3).unwrap();
        assert_eq!(image.undo_levels(), 2);
        image.undo_free();
        assert_eq!(image.undo_levels(), 0);
        assert!(!image.undo_pop().unwrap());
        image.add_vguide(1).unwrap();
        assert_eq!(image.undo_levels(), 1);
    }
}
