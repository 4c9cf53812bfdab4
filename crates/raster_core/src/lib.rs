//! The C-style action surface a host application drives: a registry of
//! opaque image handles wrapping [`image_core::Image`], plus the
//! per-layer/per-channel property accessors `Image` itself doesn't carry
//! (since those live on the drawable, not the image). Most of the actual
//! behavior already lives on `Image` -- this crate is the thin dispatch
//! layer a plugin host or file loader would actually link against,
//! grounded on `crates/document`'s `Document` (a `SlotMap`-keyed registry
//! of handles sitting in front of the real working types) and on
//! `crates/glaphica`'s `engine_core.rs` (a facade module re-exporting the
//! operations a frontend drives without exposing internal crate seams).

mod persist;

use std::fmt;

use drawable_core::{ApplyMaskMode, BoundarySegment, CombineOp, Layer};
use image_core::{
    BaseType, ColorMap, FloatTarget, GuideOrientation, Image, ImageError, MaskCreateMode, Parasite, PaletteType,
    Resolution,
};
use slotmap::SlotMap;
use undo_engine::{UndoEvent, UndoKind};

pub use drawable_core::{BlendMode, ChannelId, ImageId as ImageHandle, LayerId, PixelType};
pub use image_core::DitherMode;
pub use persist::{PersistedChannel, PersistedFloatingSel, PersistedGuide, PersistedImage, PersistedLayer, PersistedParasite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterError {
    NoSuchImage,
    Image(ImageError),
    Drawable(drawable_core::DrawableError),
}

impl fmt::Display for RasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterError::NoSuchImage => write!(f, "no such image handle"),
            RasterError::Image(e) => write!(f, "{e}"),
            RasterError::Drawable(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RasterError {}

impl From<ImageError> for RasterError {
    fn from(e: ImageError) -> Self {
        RasterError::Image(e)
    }
}

impl From<drawable_core::DrawableError> for RasterError {
    fn from(e: drawable_core::DrawableError) -> Self {
        RasterError::Drawable(e)
    }
}

/// Every open image, keyed by the same `ImageId` slotmap handle that
/// `Image::id()` reports about itself.
pub struct Registry {
    images: SlotMap<ImageHandle, Image>,
}

impl Registry {
    pub fn new() -> Self {
        Self { images: SlotMap::with_key() }
    }

    fn image(&self, handle: ImageHandle) -> Result<&Image, RasterError> {
        self.images.get(handle).ok_or(RasterError::NoSuchImage)
    }

    fn image_mut(&mut self, handle: ImageHandle) -> Result<&mut Image, RasterError> {
        self.images.get_mut(handle).ok_or(RasterError::NoSuchImage)
    }

    // ---- image lifecycle ----

    pub fn image_new(&mut self, width: u32, height: u32, base_type: BaseType) -> Result<ImageHandle, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::Image(ImageError::InvalidArgument));
        }
        Ok(self.images.insert_with_key(|id| Image::new(id, width, height, base_type).expect("dimensions validated above")))
    }

    pub fn image_delete(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.images.remove(handle).ok_or(RasterError::NoSuchImage)?;
        Ok(())
    }

    /// Deep-copies `handle` into a freshly allocated handle. The new
    /// slot is reserved with a throwaway 1x1 placeholder first, since
    /// `Image::duplicate` needs its own id *before* it can build the
    /// real copy and the registry can't hold two live borrows of the
    /// same slotmap at once.
    pub fn image_duplicate(&mut self, handle: ImageHandle) -> Result<ImageHandle, RasterError> {
        let placeholder = self
            .images
            .insert_with_key(|id| Image::new(id, 1, 1, BaseType::Rgb).expect("1x1 placeholder always valid"));
        let built = match self.images.get(handle) {
            Some(source) => source.duplicate(placeholder),
            None => {
                self.images.remove(placeholder);
                return Err(RasterError::NoSuchImage);
            }
        };
        match built {
            Ok(duplicated) => {
                self.images[placeholder] = duplicated;
                Ok(placeholder)
            }
            Err(e) => {
                self.images.remove(placeholder);
                Err(RasterError::Image(e))
            }
        }
    }

    pub fn image_resize(&mut self, handle: ImageHandle, new_width: u32, new_height: u32, offx: i32, offy: i32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.resize(new_width, new_height, offx, offy)?)
    }

    pub fn image_scale(&mut self, handle: ImageHandle, new_width: u32, new_height: u32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.scale(new_width, new_height)?)
    }

    pub fn image_width(&self, handle: ImageHandle) -> Result<u32, RasterError> {
        Ok(self.image(handle)?.width())
    }

    pub fn image_height(&self, handle: ImageHandle) -> Result<u32, RasterError> {
        Ok(self.image(handle)?.height())
    }

    pub fn image_base_type(&self, handle: ImageHandle) -> Result<BaseType, RasterError> {
        Ok(self.image(handle)?.base_type())
    }

    pub fn image_filename(&self, handle: ImageHandle) -> Result<Option<String>, RasterError> {
        Ok(self.image(handle)?.filename().map(str::to_owned))
    }

    pub fn image_set_filename(&mut self, handle: ImageHandle, filename: Option<String>) -> Result<(), RasterError> {
        self.image_mut(handle)?.set_filename(filename);
        Ok(())
    }

    pub fn image_get_resolution(&self, handle: ImageHandle) -> Result<Resolution, RasterError> {
        Ok(self.image(handle)?.resolution())
    }

    pub fn image_set_resolution(&mut self, handle: ImageHandle, resolution: Resolution) -> Result<(), RasterError> {
        self.image_mut(handle)?.set_resolution(resolution);
        Ok(())
    }

    pub fn image_get_cmap(&self, handle: ImageHandle) -> Result<Option<ColorMap>, RasterError> {
        Ok(self.image(handle)?.colormap())
    }

    pub fn image_set_cmap(&mut self, handle: ImageHandle, colormap: Option<ColorMap>) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.set_colormap(colormap)?)
    }

    pub fn image_is_clean(&self, handle: ImageHandle) -> Result<bool, RasterError> {
        Ok(self.image(handle)?.is_clean())
    }

    pub fn image_clean_all(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.image_mut(handle)?.clean_all();
        Ok(())
    }

    pub fn image_floating_selection(&self, handle: ImageHandle) -> Result<Option<LayerId>, RasterError> {
        Ok(self.image(handle)?.floating_selection())
    }

    pub fn image_set_event_callback(&mut self, handle: ImageHandle, callback: Option<Box<dyn FnMut(UndoEvent)>>) -> Result<(), RasterError> {
        self.image_mut(handle)?.set_event_callback(callback);
        Ok(())
    }

    pub fn image_projection(&self, handle: ImageHandle) -> Result<Vec<u8>, RasterError> {
        Ok(self.image(handle)?.projection())
    }

    // ---- layers ----

    pub fn layer_new(&mut self, handle: ImageHandle, name: impl Into<String>, width: u32, height: u32, with_alpha: bool) -> Result<LayerId, RasterError> {
        let image = self.image_mut(handle)?;
        let pixel_type = image.base_type().layer_pixel_type(with_alpha);
        let layer = Layer::new(image.id(), name, width, height, pixel_type)?;
        Ok(image.add_layer(layer))
    }

    pub fn layer_delete(&mut self, handle: ImageHandle, layer: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.remove_layer(layer)?)
    }

    pub fn layer_copy(&mut self, handle: ImageHandle, layer: LayerId, add_alpha: bool) -> Result<LayerId, RasterError> {
        Ok(self.image_mut(handle)?.layer_copy(layer, add_alpha)?)
    }

    pub fn layer_resize(
        &mut self,
        handle: ImageHandle,
        layer: LayerId,
        new_width: u32,
        new_height: u32,
        offx: i32,
        offy: i32,
        background: (u8, u8, u8),
    ) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.layer_resize(layer, new_width, new_height, offx, offy, background)?)
    }

    pub fn layer_scale(&mut self, handle: ImageHandle, layer: LayerId, new_width: u32, new_height: u32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.scale_layer(layer, new_width, new_height)?)
    }

    pub fn layer_translate(&mut self, handle: ImageHandle, layer: LayerId, dx: i32, dy: i32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.translate_layer(layer, dx, dy)?)
    }

    pub fn layer_add_alpha(&mut self, handle: ImageHandle, layer: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.layer_add_alpha(layer)?)
    }

    pub fn layer_rename(&mut self, handle: ImageHandle, layer: LayerId, name: impl Into<String>) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.rename_layer(layer, name)?)
    }

    pub fn layer_create_mask(&mut self, handle: ImageHandle, layer: LayerId, mode: MaskCreateMode) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.layer_create_mask(layer, mode)?)
    }

    pub fn layer_apply_mask(&mut self, handle: ImageHandle, layer: LayerId, mode: ApplyMaskMode) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.apply_layer_mask(layer, mode)?)
    }

    pub fn layer_has_mask(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().mask.is_some())
    }

    pub fn layer_is_floating_sel(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.image(handle)?.floating_selection() == Some(layer))
    }

    pub fn layer_order(&self, handle: ImageHandle) -> Result<Vec<LayerId>, RasterError> {
        Ok(self.image(handle)?.layer_order())
    }

    pub fn active_layer(&self, handle: ImageHandle) -> Result<Option<LayerId>, RasterError> {
        Ok(self.image(handle)?.active_layer())
    }

    pub fn set_active_layer(&mut self, handle: ImageHandle, layer: Option<LayerId>) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.set_active_layer(layer)?)
    }

    fn layer_cell(&self, handle: ImageHandle, layer: LayerId) -> Result<image_core::LayerCell, RasterError> {
        self.image(handle)?.layer(layer).ok_or(RasterError::Image(ImageError::NotFound))
    }

    pub fn layer_name(&self, handle: ImageHandle, layer: LayerId) -> Result<String, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().header.name.clone())
    }

    pub fn layer_extents(&self, handle: ImageHandle, layer: LayerId) -> Result<(u32, u32, i32, i32), RasterError> {
        let cell = self.layer_cell(handle, layer)?;
        let l = cell.borrow();
        Ok((l.header.width, l.header.height, l.header.offset_x, l.header.offset_y))
    }

    pub fn layer_pixel_type(&self, handle: ImageHandle, layer: LayerId) -> Result<PixelType, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().header.pixel_type)
    }

    pub fn layer_visible(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().header.visible)
    }

    pub fn layer_set_visible(&mut self, handle: ImageHandle, layer: LayerId, visible: bool) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().header.visible = visible;
        Ok(())
    }

    pub fn layer_opacity(&self, handle: ImageHandle, layer: LayerId) -> Result<u8, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().opacity)
    }

    pub fn layer_set_opacity(&mut self, handle: ImageHandle, layer: LayerId, opacity: u8) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().opacity = opacity;
        Ok(())
    }

    pub fn layer_blend_mode(&self, handle: ImageHandle, layer: LayerId) -> Result<BlendMode, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().blend_mode)
    }

    pub fn layer_set_blend_mode(&mut self, handle: ImageHandle, layer: LayerId, mode: BlendMode) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().blend_mode = mode;
        Ok(())
    }

    pub fn layer_linked(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().linked)
    }

    pub fn layer_set_linked(&mut self, handle: ImageHandle, layer: LayerId, linked: bool) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().linked = linked;
        Ok(())
    }

    pub fn layer_preserve_alpha(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().preserve_alpha)
    }

    pub fn layer_set_preserve_alpha(&mut self, handle: ImageHandle, layer: LayerId, preserve: bool) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().preserve_alpha = preserve;
        Ok(())
    }

    pub fn layer_apply_mask_flag(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().apply_mask)
    }

    pub fn layer_set_apply_mask_flag(&mut self, handle: ImageHandle, layer: LayerId, apply: bool) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().apply_mask = apply;
        Ok(())
    }

    pub fn layer_edit_mask(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().edit_mask)
    }

    pub fn layer_set_edit_mask(&mut self, handle: ImageHandle, layer: LayerId, edit: bool) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().edit_mask = edit;
        Ok(())
    }

    pub fn layer_show_mask(&self, handle: ImageHandle, layer: LayerId) -> Result<bool, RasterError> {
        Ok(self.layer_cell(handle, layer)?.borrow().show_mask)
    }

    pub fn layer_set_show_mask(&mut self, handle: ImageHandle, layer: LayerId, show: bool) -> Result<(), RasterError> {
        self.layer_cell(handle, layer)?.borrow_mut().show_mask = show;
        Ok(())
    }

    // ---- channels ----

    pub fn channel_new(&mut self, handle: ImageHandle, name: impl Into<String>, opacity_percent: u8, color: (u8, u8, u8)) -> Result<ChannelId, RasterError> {
        Ok(self.image_mut(handle)?.channel_new(name, opacity_percent, color)?)
    }

    pub fn channel_delete(&mut self, handle: ImageHandle, channel: ChannelId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.remove_channel(channel)?)
    }

    pub fn channel_copy(&mut self, handle: ImageHandle, channel: ChannelId) -> Result<ChannelId, RasterError> {
        Ok(self.image_mut(handle)?.channel_copy(channel)?)
    }

    pub fn channel_order(&self, handle: ImageHandle) -> Result<Vec<ChannelId>, RasterError> {
        Ok(self.image(handle)?.channel_order())
    }

    pub fn active_channel(&self, handle: ImageHandle) -> Result<Option<ChannelId>, RasterError> {
        Ok(self.image(handle)?.active_channel())
    }

    fn channel_cell(&self, handle: ImageHandle, channel: ChannelId) -> Result<image_core::ChannelCell, RasterError> {
        self.image(handle)?.channel(channel).ok_or(RasterError::Image(ImageError::NotFound))
    }

    pub fn channel_name(&self, handle: ImageHandle, channel: ChannelId) -> Result<String, RasterError> {
        Ok(self.channel_cell(handle, channel)?.borrow().header.name.clone())
    }

    pub fn channel_set_name(&mut self, handle: ImageHandle, channel: ChannelId, name: impl Into<String>) -> Result<(), RasterError> {
        self.channel_cell(handle, channel)?.borrow_mut().header.name = name.into();
        Ok(())
    }

    pub fn channel_visible(&self, handle: ImageHandle, channel: ChannelId) -> Result<bool, RasterError> {
        Ok(self.channel_cell(handle, channel)?.borrow().header.visible)
    }

    pub fn channel_set_visible(&mut self, handle: ImageHandle, channel: ChannelId, visible: bool) -> Result<(), RasterError> {
        self.channel_cell(handle, channel)?.borrow_mut().header.visible = visible;
        Ok(())
    }

    pub fn channel_opacity(&self, handle: ImageHandle, channel: ChannelId) -> Result<u8, RasterError> {
        Ok(self.channel_cell(handle, channel)?.borrow().opacity)
    }

    pub fn channel_set_opacity(&mut self, handle: ImageHandle, channel: ChannelId, opacity: u8) -> Result<(), RasterError> {
        self.channel_cell(handle, channel)?.borrow_mut().opacity = opacity;
        Ok(())
    }

    pub fn channel_color(&self, handle: ImageHandle, channel: ChannelId) -> Result<(u8, u8, u8), RasterError> {
        Ok(self.channel_cell(handle, channel)?.borrow().color)
    }

    pub fn channel_set_color(&mut self, handle: ImageHandle, channel: ChannelId, color: (u8, u8, u8)) -> Result<(), RasterError> {
        self.channel_cell(handle, channel)?.borrow_mut().color = color;
        Ok(())
    }

    pub fn channel_show_masked(&self, handle: ImageHandle, channel: ChannelId) -> Result<bool, RasterError> {
        Ok(self.channel_cell(handle, channel)?.borrow().show_masked)
    }

    pub fn channel_set_show_masked(&mut self, handle: ImageHandle, channel: ChannelId, show_masked: bool) -> Result<(), RasterError> {
        self.channel_cell(handle, channel)?.borrow_mut().show_masked = show_masked;
        Ok(())
    }

    pub fn channel_tattoo(&self, handle: ImageHandle, channel: ChannelId) -> Result<u32, RasterError> {
        Ok(self.channel_cell(handle, channel)?.borrow().tattoo)
    }

    // ---- selection mask (the distinguished channel) ----

    pub fn mask_is_empty(&self, handle: ImageHandle) -> Result<bool, RasterError> {
        Ok(self.image(handle)?.mask_is_empty())
    }

    pub fn mask_bounds(&self, handle: ImageHandle) -> Result<pixel_region::Rect, RasterError> {
        Ok(self.image(handle)?.mask_bounds()?)
    }

    pub fn mask_value(&self, handle: ImageHandle, x: u32, y: u32) -> Result<u8, RasterError> {
        Ok(self.image(handle)?.mask_value(x, y)?)
    }

    pub fn mask_combine_rect(&mut self, handle: ImageHandle, op: CombineOp, rect: pixel_region::Rect) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_combine_rect(op, rect)?)
    }

    pub fn mask_combine_ellipse(
        &mut self,
        handle: ImageHandle,
        op: CombineOp,
        rect: pixel_region::Rect,
        antialias: bool,
    ) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_combine_ellipse(op, rect, antialias)?)
    }

    pub fn mask_all(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_all()?)
    }

    pub fn mask_none(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_none()?)
    }

    pub fn mask_clear(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_clear()?)
    }

    pub fn mask_invert(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_invert()?)
    }

    pub fn mask_sharpen(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_sharpen()?)
    }

    pub fn mask_feather(&mut self, handle: ImageHandle, radius: u32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_feather(radius)?)
    }

    pub fn mask_grow(&mut self, handle: ImageHandle, radius: u32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_grow(radius)?)
    }

    pub fn mask_shrink(&mut self, handle: ImageHandle, radius: u32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_shrink(radius)?)
    }

    pub fn mask_border(&mut self, handle: ImageHandle, radius: u32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_border(radius)?)
    }

    pub fn mask_translate(&mut self, handle: ImageHandle, dx: i32, dy: i32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_translate(dx, dy)?)
    }

    pub fn mask_layer_alpha(&mut self, handle: ImageHandle, layer: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_layer_alpha(layer)?)
    }

    pub fn mask_layer_mask(&mut self, handle: ImageHandle, layer: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_layer_mask(layer)?)
    }

    pub fn mask_load(&mut self, handle: ImageHandle, channel: ChannelId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_load(channel)?)
    }

    pub fn mask_save(&mut self, handle: ImageHandle) -> Result<ChannelId, RasterError> {
        Ok(self.image_mut(handle)?.mask_save()?)
    }

    pub fn mask_boundary(&self, handle: ImageHandle) -> Result<(Vec<BoundarySegment>, Vec<BoundarySegment>), RasterError> {
        Ok(self.image(handle)?.mask_boundary()?)
    }

    pub fn mask_stroke(&mut self, handle: ImageHandle, drawable: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.mask_stroke(drawable)?)
    }

    pub fn mask_float(&mut self, handle: ImageHandle, drawable: LayerId, offx: i32, offy: i32) -> Result<LayerId, RasterError> {
        Ok(self.image_mut(handle)?.mask_float(drawable, offx, offy)?)
    }

    pub fn mask_extract(
        &mut self,
        handle: ImageHandle,
        drawable: LayerId,
        cut: bool,
        keep_indexed: bool,
    ) -> Result<tile_store::TileManager, RasterError> {
        Ok(self.image_mut(handle)?.mask_extract(drawable, cut, keep_indexed)?)
    }

    // ---- floating selection ----

    pub fn floating_sel_attach(&mut self, handle: ImageHandle, layer: Layer, target: FloatTarget) -> Result<LayerId, RasterError> {
        Ok(self.image_mut(handle)?.floating_sel_attach(layer, target)?)
    }

    pub fn floating_sel_rigor(&mut self, handle: ImageHandle, layer: LayerId, push_undo: bool) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.floating_sel_rigor(layer, push_undo)?)
    }

    pub fn floating_sel_relax(&mut self, handle: ImageHandle, layer: LayerId, push_undo: bool) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.floating_sel_relax(layer, push_undo)?)
    }

    pub fn floating_sel_composite(&mut self, handle: ImageHandle, layer: LayerId, push_undo: bool) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.floating_sel_composite(layer, push_undo)?)
    }

    pub fn floating_sel_anchor(&mut self, handle: ImageHandle, layer: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.floating_sel_anchor(layer)?)
    }

    pub fn floating_sel_remove(&mut self, handle: ImageHandle, layer: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.floating_sel_remove(layer)?)
    }

    pub fn floating_sel_to_layer(&mut self, handle: ImageHandle, layer: LayerId) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.floating_sel_to_layer(layer)?)
    }

    // ---- undo ----

    pub fn undo_enable(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.image_mut(handle)?.enable_undo();
        Ok(())
    }

    pub fn undo_disable(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.image_mut(handle)?.disable_undo();
        Ok(())
    }

    pub fn undo_freeze(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.image_mut(handle)?.undo_freeze();
        Ok(())
    }

    pub fn undo_thaw(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.image_mut(handle)?.undo_thaw();
        Ok(())
    }

    pub fn undo_push_group_start(&mut self, handle: ImageHandle, kind: UndoKind) -> Result<(), RasterError> {
        self.image_mut(handle)?.undo_push_group_start(kind);
        Ok(())
    }

    pub fn undo_push_group_end(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.image_mut(handle)?.undo_push_group_end();
        Ok(())
    }

    pub fn undo_pop(&mut self, handle: ImageHandle) -> Result<bool, RasterError> {
        Ok(self.image_mut(handle)?.undo_pop()?)
    }

    pub fn undo_redo(&mut self, handle: ImageHandle) -> Result<bool, RasterError> {
        Ok(self.image_mut(handle)?.undo_redo()?)
    }

    pub fn undo_levels(&self, handle: ImageHandle) -> Result<usize, RasterError> {
        Ok(self.image(handle)?.undo_levels())
    }

    pub fn undo_get_undo_name(&self, handle: ImageHandle) -> Result<Option<&'static str>, RasterError> {
        Ok(self.image(handle)?.undo_get_undo_name())
    }

    pub fn undo_get_redo_name(&self, handle: ImageHandle) -> Result<Option<&'static str>, RasterError> {
        Ok(self.image(handle)?.undo_get_redo_name())
    }

    pub fn undo_free(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        self.image_mut(handle)?.undo_free();
        Ok(())
    }

    // ---- guides ----

    pub fn add_hguide(&mut self, handle: ImageHandle, y: i32) -> Result<u32, RasterError> {
        Ok(self.image_mut(handle)?.add_hguide(y)?)
    }

    pub fn add_vguide(&mut self, handle: ImageHandle, x: i32) -> Result<u32, RasterError> {
        Ok(self.image_mut(handle)?.add_vguide(x)?)
    }

    pub fn delete_guide(&mut self, handle: ImageHandle, id: u32) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.delete_guide(id)?)
    }

    pub fn findnext_guide(&self, handle: ImageHandle, prev_id: u32) -> Result<Option<u32>, RasterError> {
        Ok(self.image(handle)?.findnext_guide(prev_id))
    }

    pub fn guide_orientation(&self, handle: ImageHandle, id: u32) -> Result<GuideOrientation, RasterError> {
        Ok(self.image(handle)?.guide_orientation(id)?)
    }

    pub fn guide_position(&self, handle: ImageHandle, id: u32) -> Result<i32, RasterError> {
        Ok(self.image(handle)?.guide_position(id)?)
    }

    // ---- parasites ----

    pub fn find_parasite(&self, handle: ImageHandle, name: &str) -> Result<Option<Parasite>, RasterError> {
        Ok(self.image(handle)?.find_parasite(name))
    }

    pub fn attach_parasite(&mut self, handle: ImageHandle, parasite: Parasite) -> Result<(), RasterError> {
        self.image_mut(handle)?.attach_parasite(parasite);
        Ok(())
    }

    pub fn detach_parasite(&mut self, handle: ImageHandle, name: &str) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.detach_parasite(name)?)
    }

    // ---- quick mask ----

    pub fn quick_mask_active(&self, handle: ImageHandle) -> Result<bool, RasterError> {
        Ok(self.image(handle)?.quick_mask_active())
    }

    pub fn enter_quick_mask(&mut self, handle: ImageHandle, color: (u8, u8, u8)) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.enter_quick_mask(color)?)
    }

    pub fn exit_quick_mask(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.exit_quick_mask()?)
    }

    // ---- base-type conversion ----

    pub fn convert_to_rgb(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.convert_to_rgb()?)
    }

    pub fn convert_to_grayscale(&mut self, handle: ImageHandle) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.convert_to_grayscale()?)
    }

    pub fn convert_to_indexed(&mut self, handle: ImageHandle, dither: DitherMode, num_colors: usize) -> Result<(), RasterError> {
        Ok(self.image_mut(handle)?.convert_to_indexed(dither, num_colors)?)
    }

    pub fn convert_to_indexed_palette(
        &mut self,
        handle: ImageHandle,
        dither: DitherMode,
        palette_type: PaletteType,
        num_colors: usize,
        custom_palette: Option<ColorMap>,
    ) -> Result<(), RasterError> {
        Ok(self
            .image_mut(handle)?
            .convert_to_indexed_palette(dither, palette_type, num_colors, custom_palette)?)
    }

    // ---- persisted state ----

    pub fn persist(&self, handle: ImageHandle) -> Result<PersistedImage, RasterError> {
        Ok(PersistedImage::capture(self.image(handle)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixel_region::Rect;

    #[test]
    fn new_image_round_trips_basic_properties() {
        let mut reg = Registry::new();
        let img = reg.image_new(16, 16, BaseType::Rgb).unwrap();
        assert_eq!(reg.image_width(img).unwrap(), 16);
        assert_eq!(reg.image_height(img).unwrap(), 16);
        assert_eq!(reg.image_base_type(img).unwrap(), BaseType::Rgb);
        assert!(reg.image_is_clean(img).unwrap());
    }

    #[test]
    fn unknown_handle_reports_no_such_image() {
        let mut reg1 = Registry::new();
        let mut reg2 = Registry::new();
        let img = reg2.image_new(4, 4, BaseType::Rgb).unwrap();
        assert_eq!(reg1.image_width(img), Err(RasterError::NoSuchImage));
    }

    #[test]
    fn layer_lifecycle_and_property_accessors() {
        let mut reg = Registry::new();
        let img = reg.image_new(8, 8, BaseType::Rgb).unwrap();
        let layer = reg.layer_new(img, "base", 8, 8, false).unwrap();
        assert_eq!(reg.layer_name(img, layer).unwrap(), "base");
        assert_eq!(reg.layer_opacity(img, layer).unwrap(), 255);

        reg.layer_set_opacity(img, layer, 128).unwrap();
        reg.layer_set_blend_mode(img, layer, BlendMode::Multiply).unwrap();
        reg.layer_rename(img, layer, "renamed").unwrap();
        assert_eq!(reg.layer_opacity(img, layer).unwrap(), 128);
        assert_eq!(reg.layer_blend_mode(img, layer).unwrap(), BlendMode::Multiply);
        assert_eq!(reg.layer_name(img, layer).unwrap(), "renamed");

        reg.layer_delete(img, layer).unwrap();
        assert!(!reg.layer_order(img).unwrap().contains(&layer));
    }

    #[test]
    fn image_duplicate_produces_an_independent_handle() {
        let mut reg = Registry::new();
        let img = reg.image_new(4, 4, BaseType::Rgb).unwrap();
        let layer = reg.layer_new(img, "a", 4, 4, false).unwrap();
        let dup = reg.image_duplicate(img).unwrap();
        assert_ne!(img, dup);
        assert_eq!(reg.layer_order(dup).unwrap().len(), 1);

        reg.layer_delete(img, layer).unwrap();
        assert_eq!(reg.layer_order(img).unwrap().len(), 0);
        assert_eq!(reg.layer_order(dup).unwrap().len(), 1);
    }

    #[test]
    fn selection_combine_and_undo_round_trip_through_the_registry() {
        let mut reg = Registry::new();
        let img = reg.image_new(10, 10, BaseType::Rgb).unwrap();
        assert!(reg.mask_is_empty(img).unwrap());

        reg.mask_combine_rect(img, CombineOp::Add, Rect::new(2, 2, 4, 4)).unwrap();
        assert!(!reg.mask_is_empty(img).unwrap());

        assert!(reg.undo_pop(img).unwrap());
        assert!(reg.mask_is_empty(img).unwrap());
        assert!(reg.undo_redo(img).unwrap());
        assert!(!reg.mask_is_empty(img).unwrap());
    }

    #[test]
    fn convert_to_indexed_then_back_to_rgb_round_trips_through_the_registry() {
        let mut reg = Registry::new();
        let img = reg.image_new(2, 2, BaseType::Rgb).unwrap();
        reg.layer_new(img, "base", 2, 2, false).unwrap();
        reg.convert_to_indexed(img, DitherMode::None, 4).unwrap();
        assert_eq!(reg.image_base_type(img).unwrap(), BaseType::Indexed);
        assert!(reg.image_get_cmap(img).unwrap().is_some());

        reg.convert_to_rgb(img).unwrap();
        assert_eq!(reg.image_base_type(img).unwrap(), BaseType::Rgb);
    }
}
