//! A serializable snapshot of an image's durable state: the metadata a
//! save format would round-trip, as opposed to the live tile storage and
//! undo history `Image` otherwise owns. Modeled on `image_core`'s own
//! `BaseType`/`ColorMap`/`Resolution`/`Guide`/`Parasite` types, which
//! already derive `serde::Serialize`/`Deserialize` for exactly this
//! purpose; this module adds the per-layer and per-channel mirrors those
//! types don't carry a plain-data form of, plus the `Image`-level
//! container tying them together.
//!
//! Pixel tiles are out of scope here: a real save path persists those
//! through `TileManager`'s own tile dump, keyed by the same layer and
//! channel ids this snapshot carries.

use drawable_core::{BlendMode, LayerId, PixelType};
use image_core::{BaseType, ColorMap, Guide, Image, Parasite, Resolution};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedLayer {
    pub name: String,
    pub visible: bool,
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
    pub opacity: u8,
    pub blend_mode: BlendMode,
    pub linked: bool,
    pub preserve_alpha: bool,
    pub apply_mask: bool,
    pub edit_mask: bool,
    pub show_mask: bool,
    pub has_mask: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedChannel {
    pub name: String,
    pub visible: bool,
    pub width: u32,
    pub height: u32,
    pub color: (u8, u8, u8),
    pub opacity: u8,
    pub show_masked: bool,
    pub tattoo: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedGuide {
    pub orientation_is_vertical: bool,
    pub position: i32,
}

impl From<&Guide> for PersistedGuide {
    fn from(g: &Guide) -> Self {
        Self {
            orientation_is_vertical: matches!(g.orientation, image_core::GuideOrientation::Vertical),
            position: g.position,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedParasite {
    pub name: String,
    pub flags: u32,
    pub data: Vec<u8>,
}

impl From<&Parasite> for PersistedParasite {
    fn from(p: &Parasite) -> Self {
        Self { name: p.name.clone(), flags: p.flags, data: p.data.clone() }
    }
}

/// The part of a floating selection's linkage that survives a save:
/// which layer id is floating, and what drawable it will anchor onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFloatingSel {
    pub layer_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedImage {
    pub width: u32,
    pub height: u32,
    pub base_type: BaseType,
    pub colormap: Option<ColorMap>,
    pub resolution: Resolution,
    pub filename: Option<String>,
    pub layers: Vec<PersistedLayer>,
    pub active_layer_index: Option<usize>,
    pub floating_selection: Option<PersistedFloatingSel>,
    pub channels: Vec<PersistedChannel>,
    pub guides: Vec<PersistedGuide>,
    pub parasites: Vec<PersistedParasite>,
}

impl PersistedImage {
    /// Walks an `Image`'s live state (layer order top-to-bottom, channel
    /// order, guides, parasites) into a plain-data snapshot. Layer/channel
    /// identity is recorded as its position in `layers`/`channels`, since
    /// slotmap keys are only meaningful within one process's session.
    pub fn capture(image: &Image) -> Self {
        let layer_order = image.layer_order();
        let layers = layer_order
            .iter()
            .map(|&id| {
                let cell = image.layer(id).expect("layer_order only lists live layers");
                let layer = cell.borrow();
                PersistedLayer {
                    name: layer.header.name.clone(),
                    visible: layer.header.visible,
                    offset_x: layer.header.offset_x,
                    offset_y: layer.header.offset_y,
                    width: layer.header.width,
                    height: layer.header.height,
                    pixel_type: layer.header.pixel_type,
                    opacity: layer.opacity,
                    blend_mode: layer.blend_mode,
                    linked: layer.linked,
                    preserve_alpha: layer.preserve_alpha,
                    apply_mask: layer.apply_mask,
                    edit_mask: layer.edit_mask,
                    show_mask: layer.show_mask,
                    has_mask: layer.mask.is_some(),
                }
            })
            .collect();

        let channel_order = image.channel_order();
        let channels = channel_order
            .iter()
            .map(|&id| {
                let cell = image.channel(id).expect("channel_order only lists live channels");
                let channel = cell.borrow();
                PersistedChannel {
                    name: channel.header.name.clone(),
                    visible: channel.header.visible,
                    width: channel.header.width,
                    height: channel.header.height,
                    color: channel.color,
                    opacity: channel.opacity,
                    show_masked: channel.show_masked,
                    tattoo: channel.tattoo,
                }
            })
            .collect();

        let active_layer_index = image
            .active_layer()
            .and_then(|active| layer_order.iter().position(|&id| id == active));
        let floating_selection = image
            .floating_selection()
            .and_then(|id| index_of(&layer_order, id))
            .map(|layer_index| PersistedFloatingSel { layer_index });

        Self {
            width: image.width(),
            height: image.height(),
            base_type: image.base_type(),
            colormap: image.colormap(),
            resolution: image.resolution(),
            filename: image.filename().map(str::to_owned),
            layers,
            active_layer_index,
            floating_selection,
            channels,
            guides: image.guides().iter().map(PersistedGuide::from).collect(),
            parasites: image.parasites().iter().map(PersistedParasite::from).collect(),
        }
    }
}

fn index_of(order: &[LayerId], id: LayerId) -> Option<usize> {
    order.iter().position(|&candidate| candidate == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_core::Image;
    use slotmap::SlotMap;

    fn new_image(width: u32, height: u32) -> Image {
        let mut images: SlotMap<drawable_core::ImageId, ()> = SlotMap::with_key();
        let id = images.insert_with_key(|id| id);
        Image::new(id, width, height, BaseType::Rgb).unwrap()
    }

    #[test]
    fn capture_reflects_layer_order_and_properties() {
        let mut image = new_image(4, 4);
        let layer = drawable_core::Layer::new(image.id(), "top", 4, 4, PixelType::Rgb).unwrap();
        let id = image.add_layer(layer);
        image.set_active_layer(Some(id)).unwrap();

        let snapshot = PersistedImage::capture(&image);
        assert_eq!(snapshot.layers.len(), 1);
        assert_eq!(snapshot.layers[0].name, "top");
        assert_eq!(snapshot.active_layer_index, Some(0));
        assert!(snapshot.floating_selection.is_none());
    }

    #[test]
    fn capture_carries_colormap_and_resolution() {
        let mut image = new_image(2, 2);
        image.set_colormap(Some(ColorMap { entries: vec![(1, 2, 3)] })).unwrap();
        let snapshot = PersistedImage::capture(&image);
        assert_eq!(snapshot.colormap, Some(ColorMap { entries: vec![(1, 2, 3)] }));
        assert_eq!(snapshot.resolution, Resolution::default());
    }
}
