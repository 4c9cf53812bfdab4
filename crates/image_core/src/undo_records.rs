//! Concrete [`UndoPayload`] implementations for each record kind an
//! [`crate::Image`] pushes. Every payload owns `Rc<RefCell<_>>` clones of
//! exactly the shared state it needs to swap in place, rather than a
//! pointer back into the `Image` that pushed it — the single-threaded
//! analogue of the teacher's detach/attach-under-a-short-lived-lock note
//! for tile ownership, applied to whole drawables and list membership.

use std::cell::RefCell;
use std::rc::Rc;

use drawable_core::{Channel, ChannelId, DrawableHeader, FloatTarget, FloatingSelRecord, Layer, LayerId};
use pixel_region::Rect;
use slotmap::SlotMap;
use undo_engine::{Direction, UndoPayload};

use crate::blend::{read_rect_bytes, write_rect_bytes};

pub type LayerCell = Rc<RefCell<Layer>>;
pub type ChannelCell = Rc<RefCell<Channel>>;
pub type LayerTable = Rc<RefCell<SlotMap<LayerId, LayerCell>>>;
pub type ChannelTable = Rc<RefCell<SlotMap<ChannelId, ChannelCell>>>;

/// Either kind of drawable a floating selection can target, addressed
/// uniformly through its shared `DrawableHeader`.
#[derive(Clone)]
pub enum TargetCell {
    Layer(LayerCell),
    Channel(ChannelCell),
}

impl TargetCell {
    pub fn from_target(layers: &LayerTable, channels: &ChannelTable, target: FloatTarget) -> Option<Self> {
        match target {
            FloatTarget::Layer(id) => layers.borrow().get(id).cloned().map(TargetCell::Layer),
            FloatTarget::Channel(id) => channels.borrow().get(id).cloned().map(TargetCell::Channel),
        }
    }

    pub fn with_header<R>(&self, f: impl FnOnce(&DrawableHeader) -> R) -> R {
        match self {
            TargetCell::Layer(c) => f(&c.borrow().header),
            TargetCell::Channel(c) => f(&c.borrow().header),
        }
    }

    pub fn with_header_mut<R>(&self, f: impl FnOnce(&mut DrawableHeader) -> R) -> R {
        match self {
            TargetCell::Layer(c) => f(&mut c.borrow_mut().header),
            TargetCell::Channel(c) => f(&mut c.borrow_mut().header),
        }
    }
}

/// Swaps a layer's offsets in place. Used by `translate`.
pub struct LayerDisplacePayload {
    pub layer: LayerCell,
    pub offsets: (i32, i32),
}

impl UndoPayload for LayerDisplacePayload {
    fn pop(&mut self, _direction: Direction) {
        let mut layer = self.layer.borrow_mut();
        let current = (layer.header.offset_x, layer.header.offset_y);
        layer.header.offset_x = self.offsets.0;
        layer.header.offset_y = self.offsets.1;
        if let Some(mask) = &mut layer.mask {
            mask.header.offset_x = self.offsets.0;
            mask.header.offset_y = self.offsets.1;
        }
        self.offsets = current;
    }
}

/// Swaps a channel's full pixel content (and cached bounds validity) in
/// place. Used by every selection-mask mutator (`MASK_UNDO`).
pub struct MaskPayload {
    pub channel: ChannelCell,
    pub snapshot: RefCell<Vec<u8>>,
    pub rect: Rect,
}

impl UndoPayload for MaskPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut channel = self.channel.borrow_mut();
        let current = channel
            .snapshot_bytes()
            .expect("selection channel extents never change");
        channel
            .restore_bytes(&self.snapshot.borrow())
            .expect("mask undo payload matches channel extents");
        *self.snapshot.borrow_mut() = current;
    }
}

/// Presence toggle shared by `LAYER_ADD_UNDO`/`LAYER_REMOVE_UNDO`: the
/// layer stays allocated in `layers` for as long as any record references
/// it; only when this payload is finally dropped (evicted from a stack,
/// or the whole engine torn down) with the layer currently absent from
/// the order list do we actually free its slotmap slot.
pub struct LayerPresencePayload {
    pub layers: LayerTable,
    pub layer_order: Rc<RefCell<Vec<LayerId>>>,
    pub active_layer: Rc<RefCell<Option<LayerId>>>,
    pub layer_id: LayerId,
    pub position: usize,
    pub prior_active: Option<LayerId>,
    /// `true` when `Undo` should make the layer present (this is a
    /// `LAYER_REMOVE_UNDO`); `false` for `LAYER_ADD_UNDO`.
    pub undo_inserts: bool,
    pub currently_absent: bool,
}

impl UndoPayload for LayerPresencePayload {
    fn pop(&mut self, direction: Direction) {
        let want_present = match direction {
            Direction::Undo => self.undo_inserts,
            Direction::Redo => !self.undo_inserts,
        };
        let mut order = self.layer_order.borrow_mut();
        let mut active = self.active_layer.borrow_mut();
        if want_present {
            if !order.contains(&self.layer_id) {
                let at = self.position.min(order.len());
                order.insert(at, self.layer_id);
            }
            let prior = *active;
            *active = Some(self.layer_id);
            self.prior_active = prior;
            self.currently_absent = false;
        } else {
            order.retain(|&id| id != self.layer_id);
            *active = self.prior_active;
            self.currently_absent = true;
        }
    }
}

impl Drop for LayerPresencePayload {
    fn drop(&mut self) {
        if self.currently_absent {
            self.layers.borrow_mut().remove(self.layer_id);
        }
    }
}

/// Analogous presence toggle for channels (`CHANNEL_ADD_UNDO` /
/// `CHANNEL_REMOVE_UNDO`).
pub struct ChannelPresencePayload {
    pub channels: ChannelTable,
    pub channel_order: Rc<RefCell<Vec<ChannelId>>>,
    pub active_channel: Rc<RefCell<Option<ChannelId>>>,
    pub channel_id: ChannelId,
    pub position: usize,
    pub prior_active: Option<ChannelId>,
    pub undo_inserts: bool,
    pub currently_absent: bool,
}

impl UndoPayload for ChannelPresencePayload {
    fn pop(&mut self, direction: Direction) {
        let want_present = match direction {
            Direction::Undo => self.undo_inserts,
            Direction::Redo => !self.undo_inserts,
        };
        let mut order = self.channel_order.borrow_mut();
        let mut active = self.active_channel.borrow_mut();
        if want_present {
            if !order.contains(&self.channel_id) {
                let at = self.position.min(order.len());
                order.insert(at, self.channel_id);
            }
            let prior = *active;
            *active = Some(self.channel_id);
            self.prior_active = prior;
            self.currently_absent = false;
        } else {
            order.retain(|&id| id != self.channel_id);
            *active = self.prior_active;
            self.currently_absent = true;
        }
    }
}

impl Drop for ChannelPresencePayload {
    fn drop(&mut self) {
        if self.currently_absent {
            self.channels.borrow_mut().remove(self.channel_id);
        }
    }
}

/// Swaps a layer's name string in place (`LAYER_RENAME_UNDO`).
pub struct LayerRenamePayload {
    pub layer: LayerCell,
    pub name: String,
}

impl UndoPayload for LayerRenamePayload {
    fn pop(&mut self, _direction: Direction) {
        let mut layer = self.layer.borrow_mut();
        std::mem::swap(&mut layer.header.name, &mut self.name);
    }
}

/// Swaps a layer's mask pointer (`LAYER_MASK_ADD_UNDO` /
/// `LAYER_MASK_REMOVE_UNDO`): the mask, like a removed layer, is kept
/// alive by the payload itself for as long as a record references it.
pub struct LayerMaskPresencePayload {
    pub layer: LayerCell,
    pub mask: RefCell<Option<drawable_core::LayerMask>>,
}

impl UndoPayload for LayerMaskPresencePayload {
    fn pop(&mut self, _direction: Direction) {
        let mut layer = self.layer.borrow_mut();
        let mut held = self.mask.borrow_mut();
        std::mem::swap(&mut layer.mask, &mut held);
    }
}

/// Swaps the selection channel's quick-mask flag (`QMASK_UNDO`).
pub struct QuickMaskPayload {
    pub active: Rc<RefCell<bool>>,
    pub value: bool,
}

impl UndoPayload for QuickMaskPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut active = self.active.borrow_mut();
        let current = *active;
        *active = self.value;
        self.value = current;
    }
}

/// Swaps a guide's position in place (`GUIDE_UNDO`). `None` position
/// stored in `prior` means the guide did not exist in that state.
pub struct GuidePayload {
    pub guides: Rc<RefCell<Vec<crate::Guide>>>,
    pub guide_id: u32,
    pub prior: Option<crate::Guide>,
}

impl UndoPayload for GuidePayload {
    fn pop(&mut self, _direction: Direction) {
        let mut guides = self.guides.borrow_mut();
        let idx = guides.iter().position(|g| g.id == self.guide_id);
        let current = idx.map(|i| guides[i].clone());
        match (&self.prior, idx) {
            (Some(saved), Some(i)) => guides[i] = saved.clone(),
            (Some(saved), None) => guides.push(saved.clone()),
            (None, Some(i)) => {
                guides.remove(i);
            }
            (None, None) => {}
        }
        self.prior = current;
    }
}

/// Swaps image resolution + unit (`RESOLUTION_UNDO`).
pub struct ResolutionPayload {
    pub resolution: Rc<RefCell<crate::Resolution>>,
    pub prior: crate::Resolution,
}

impl UndoPayload for ResolutionPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut resolution = self.resolution.borrow_mut();
        std::mem::swap(&mut *resolution, &mut self.prior);
    }
}

/// Swaps a named parasite blob in place (`PARASITE_*`). `None` means
/// absent in that state.
pub struct ParasitePayload {
    pub parasites: Rc<RefCell<Vec<crate::Parasite>>>,
    pub name: String,
    pub prior: Option<crate::Parasite>,
}

impl UndoPayload for ParasitePayload {
    fn pop(&mut self, _direction: Direction) {
        let mut parasites = self.parasites.borrow_mut();
        let idx = parasites.iter().position(|p| p.name == self.name);
        let current = idx.map(|i| parasites[i].clone());
        match (&self.prior, idx) {
            (Some(saved), Some(i)) => parasites[i] = saved.clone(),
            (Some(saved), None) => parasites.push(saved.clone()),
            (None, Some(i)) => {
                parasites.remove(i);
            }
            (None, None) => {}
        }
        self.prior = current;
    }
}

/// Swaps `(width, height, base_type)` (`GIMAGE_MOD`).
pub struct ImageModPayload {
    pub width: Rc<RefCell<u32>>,
    pub height: Rc<RefCell<u32>>,
    pub base_type: Rc<RefCell<crate::BaseType>>,
    pub prior: (u32, u32, crate::BaseType),
}

impl UndoPayload for ImageModPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut w = self.width.borrow_mut();
        let mut h = self.height.borrow_mut();
        let mut bt = self.base_type.borrow_mut();
        let current = (*w, *h, *bt);
        (*w, *h, *bt) = self.prior;
        self.prior = current;
    }
}

/// Swaps a layer's entire drawable state (tiles, extents, pixel type) in
/// place. Used by `layer_resize`/`layer_scale`/`layer_add_alpha`
/// (`LAYER_MOD`): those rebuild `DrawableHeader` wholesale, so undo just
/// swaps the whole header back rather than patching a sub-rectangle.
pub struct LayerModPayload {
    pub layer: LayerCell,
    pub prior: RefCell<Option<DrawableHeader>>,
}

impl UndoPayload for LayerModPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut layer = self.layer.borrow_mut();
        let mut held = self.prior.borrow_mut();
        let current = std::mem::replace(&mut layer.header, held.take().expect("LayerModPayload always holds a header between pops"));
        *held = Some(current);
    }
}

/// Analogous whole-header swap for channels (`CHANNEL_MOD`), used when a
/// channel is resized out from under the selection (canvas resize).
pub struct ChannelModPayload {
    pub channel: ChannelCell,
    pub prior: RefCell<Option<DrawableHeader>>,
}

impl UndoPayload for ChannelModPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut channel = self.channel.borrow_mut();
        let mut held = self.prior.borrow_mut();
        let current = std::mem::replace(&mut channel.header, held.take().expect("ChannelModPayload always holds a header between pops"));
        *held = Some(current);
    }
}

/// Swaps a sub-rectangle of a drawable's pixel bytes in place
/// (`IMAGE_UNDO` / `IMAGE_MOD_UNDO`). Used by raw pixel mutators and by
/// `FloatingSel::composite`, whose every repaint is itself undoable.
pub struct PixelPatchPayload {
    pub target: TargetCell,
    pub rect: Rect,
    pub snapshot: RefCell<Vec<u8>>,
}

impl UndoPayload for PixelPatchPayload {
    fn pop(&mut self, _direction: Direction) {
        let rect = self.rect;
        let current = self.target.with_header(|h| read_rect_bytes(h, rect));
        self.target.with_header_mut(|h| write_rect_bytes(h, rect, &self.snapshot.borrow()));
        *self.snapshot.borrow_mut() = current;
    }
}

/// Swaps a floating selection's backing-store bytes and `initial` flag
/// in place (`FS_RIGOR`). `rigor` never touches the target itself, so
/// there is nothing else to restore.
pub struct FsRigorPayload {
    pub layer: LayerCell,
    pub snapshot: RefCell<Vec<u8>>,
    pub initial: bool,
}

impl UndoPayload for FsRigorPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut layer = self.layer.borrow_mut();
        let record = layer.floating_sel.as_mut().expect("FsRigorPayload outlives the float it recorded");
        let (w, h) = (record.backing_store.width(), record.backing_store.height());
        let bpp = record.backing_store.bpp();
        let full = pixel_region::Rect::new(0, 0, w, h);
        let region = pixel_region::PixelRegion::new(&record.backing_store, full, true)
            .expect("backing store always covers its own full extent");
        let mut current = vec![0u8; (w * h * bpp) as usize];
        for chunk in region.iter() {
            for row in 0..chunk.height() {
                let off = ((chunk.image_y + row) as usize * w as usize + chunk.image_x as usize) * bpp as usize;
                let len = chunk.width() as usize * bpp as usize;
                current[off..off + len].copy_from_slice(&chunk.row(row));
                chunk.row_mut(row).copy_from_slice(&self.snapshot.borrow()[off..off + len]);
            }
        }
        *self.snapshot.borrow_mut() = current;
        let prior_initial = record.initial;
        record.initial = self.initial;
        self.initial = prior_initial;
    }
}

/// Swaps the image's colormap in place (`IMAGE_MOD_UNDO`).
pub struct ColormapPayload {
    pub colormap: Rc<RefCell<Option<crate::ColorMap>>>,
    pub prior: Option<crate::ColorMap>,
}

impl UndoPayload for ColormapPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut colormap = self.colormap.borrow_mut();
        let current = colormap.clone();
        *colormap = self.prior.clone();
        self.prior = current;
    }
}

/// Swaps both the target rectangle's pixels and the float's `initial`
/// flag in place (`FS_RELAX`): relax conditionally pastes the backing
/// store back onto the target, so undoing it must restore the target's
/// pixels too, not just flip the flag.
pub struct FsRelaxPayload {
    pub layer: LayerCell,
    pub target: TargetCell,
    pub rect: Rect,
    pub snapshot: RefCell<Vec<u8>>,
    pub initial: bool,
}

impl UndoPayload for FsRelaxPayload {
    fn pop(&mut self, _direction: Direction) {
        let rect = self.rect;
        let current = self.target.with_header(|h| read_rect_bytes(h, rect));
        self.target.with_header_mut(|h| write_rect_bytes(h, rect, &self.snapshot.borrow()));
        *self.snapshot.borrow_mut() = current;
        let mut layer = self.layer.borrow_mut();
        if let Some(record) = layer.floating_sel.as_mut() {
            let prior_initial = record.initial;
            record.initial = self.initial;
            self.initial = prior_initial;
        }
    }
}

/// Swaps a layer between floating and ordinary-layer states in place
/// (`FS_TO_LAYER`): `to_layer` drops the `FloatingSelRecord` and clears
/// `image.floating_sel`; this payload keeps a detached record around and
/// swaps it back in on undo, and the pointer cell right along with it.
pub struct FsToLayerPayload {
    pub layer: LayerCell,
    pub floating_sel: Rc<RefCell<Option<LayerId>>>,
    pub layer_id: LayerId,
    pub detached: RefCell<Option<FloatingSelRecord>>,
    pub pointer_prior: Option<LayerId>,
}

impl UndoPayload for FsToLayerPayload {
    fn pop(&mut self, _direction: Direction) {
        let mut layer = self.layer.borrow_mut();
        let mut held = self.detached.borrow_mut();
        std::mem::swap(&mut layer.floating_sel, &mut held);
        drop(layer);
        let mut pointer = self.floating_sel.borrow_mut();
        let current = *pointer;
        *pointer = self.pointer_prior;
        self.pointer_prior = current;
    }
}

/// Placeholder for an operation whose undo the engine never implemented.
/// `CANTUNDO`'s dirty-counter handling lives in `undo_engine` itself
/// (it special-cases `UndoKind::CantUndo`); this payload carries nothing.
pub struct CantUndoPayload;

impl UndoPayload for CantUndoPayload {
    fn pop(&mut self, _direction: Direction) {}
}
