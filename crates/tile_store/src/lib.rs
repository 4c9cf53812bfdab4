//! Fixed-size pixel tiles and the sparse grid that owns them.
//!
//! A [`TileManager`] is a sparse two-dimensional grid of [`Tile`]s backing
//! exactly one drawable's pixels. Tiles are created lazily on first demand
//! and filled through an optional validator before any reader sees them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub const TILE_WIDTH: u32 = 64;
pub const TILE_HEIGHT: u32 = 64;
/// Byte value every freshly validated tile starts from.
pub const TRANSPARENT_OPACITY: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStoreError {
    OutOfRange,
    InvalidArgument,
}

impl fmt::Display for TileStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileStoreError::OutOfRange => write!(f, "pixel coordinates out of range"),
            TileStoreError::InvalidArgument => write!(f, "invalid tile manager argument"),
        }
    }
}

impl std::error::Error for TileStoreError {}

/// Geometry of one tile slot, handed to a validator before it fills the
/// tile's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub tile_x: u32,
    pub tile_y: u32,
    /// Pixel-space origin of this tile within the owning manager.
    pub origin_x: u32,
    pub origin_y: u32,
    /// Effective (possibly clipped at the grid edge) width/height.
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl TileGeometry {
    pub fn len_bytes(self) -> usize {
        (self.width as usize) * (self.height as usize) * (self.bpp as usize)
    }

    pub fn rowstride(self) -> usize {
        (self.width as usize) * (self.bpp as usize)
    }
}

pub type Validator = Rc<dyn Fn(&mut [u8], TileGeometry)>;

/// A fixed-size block of pixel memory. Invalid until first demanded.
#[derive(Clone)]
pub struct Tile {
    buffer: Option<Box<[u8]>>,
    geometry: TileGeometry,
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("valid", &self.buffer.is_some())
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl Tile {
    fn new_invalid(geometry: TileGeometry) -> Self {
        Self {
            buffer: None,
            geometry,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn geometry(&self) -> TileGeometry {
        self.geometry
    }

    pub fn data(&self) -> &[u8] {
        self.buffer
            .as_deref()
            .expect("tile must be validated before data() is read")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buffer
            .as_deref_mut()
            .expect("tile must be validated before data_mut() is read")
    }

    fn ensure_valid(&mut self, validator: Option<&Validator>) {
        if self.buffer.is_some() {
            return;
        }
        let mut buffer = vec![TRANSPARENT_OPACITY; self.geometry.len_bytes()].into_boxed_slice();
        if let Some(validator) = validator {
            validator(&mut buffer, self.geometry);
        }
        self.buffer = Some(buffer);
    }
}

struct Slot {
    tile: Rc<RefCell<Tile>>,
}

/// Sparse 2-D grid of tiles backing one drawable's pixel memory.
///
/// Tiles are stored behind `Rc<RefCell<_>>`; a [`TileHandle`] is a clone of
/// that `Rc`, so the tile's strong count *is* its region-visibility
/// refcount (the slot itself holds one strong reference, each outstanding
/// handle holds one more). This is the single-threaded analogue of the
/// refcounted tiles the teacher workspace uses for its GPU atlas slots.
pub struct TileManager {
    width: u32,
    height: u32,
    bpp: u32,
    tiles_across: u32,
    tiles_down: u32,
    slots: RefCell<Vec<Option<Slot>>>,
    validator: Option<Validator>,
    /// Auxiliary origin, used when a manager stands in as an undo payload
    /// covering a sub-rectangle of a larger drawable.
    pub origin_x: i32,
    pub origin_y: i32,
}

/// A pinned reference to one tile, obtained from [`TileManager::get_tile`].
/// While a handle is alive its tile's buffer stays put; dropping it (or
/// passing it to [`TileManager::release_tile`]) unpins the tile.
pub struct TileHandle {
    tile_x: u32,
    tile_y: u32,
    writable: bool,
    tile: Rc<RefCell<Tile>>,
}

impl TileHandle {
    pub fn tile_x(&self) -> u32 {
        self.tile_x
    }

    pub fn tile_y(&self) -> u32 {
        self.tile_y
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn geometry(&self) -> TileGeometry {
        self.tile.borrow().geometry()
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.tile.borrow().data())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        assert!(self.writable, "tile handle was not acquired writable");
        f(self.tile.borrow_mut().data_mut())
    }

    /// Direct read-only access to the tile's byte buffer.
    pub fn data(&self) -> std::cell::Ref<'_, [u8]> {
        std::cell::Ref::map(self.tile.borrow(), |tile| tile.data())
    }

    /// Direct read-write access to the tile's byte buffer. Panics if this
    /// handle was not acquired writable.
    pub fn data_mut(&self) -> std::cell::RefMut<'_, [u8]> {
        assert!(self.writable, "tile handle was not acquired writable");
        std::cell::RefMut::map(self.tile.borrow_mut(), |tile| tile.data_mut())
    }

    /// Number of live references (this handle plus the manager's own slot,
    /// plus any other outstanding handle) to the underlying tile.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.tile)
    }
}

impl TileManager {
    pub fn new(width: u32, height: u32, bpp: u32) -> Result<Self, TileStoreError> {
        if width == 0 || height == 0 || bpp == 0 {
            return Err(TileStoreError::InvalidArgument);
        }
        let tiles_across = width.div_ceil(TILE_WIDTH);
        let tiles_down = height.div_ceil(TILE_HEIGHT);
        let slot_count = (tiles_across as usize) * (tiles_down as usize);
        Ok(Self {
            width,
            height,
            bpp,
            tiles_across,
            tiles_down,
            slots: RefCell::new((0..slot_count).map(|_| None).collect()),
            validator: None,
            origin_x: 0,
            origin_y: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    pub fn tiles_across(&self) -> u32 {
        self.tiles_across
    }

    pub fn tiles_down(&self) -> u32 {
        self.tiles_down
    }

    pub fn set_validator(&mut self, validator: Option<Validator>) {
        self.validator = validator;
    }

    fn slot_index(&self, tile_x: u32, tile_y: u32) -> Result<usize, TileStoreError> {
        if tile_x >= self.tiles_across || tile_y >= self.tiles_down {
            return Err(TileStoreError::OutOfRange);
        }
        Ok((tile_y as usize) * (self.tiles_across as usize) + (tile_x as usize))
    }

    fn tile_geometry(&self, tile_x: u32, tile_y: u32) -> TileGeometry {
        let origin_x = tile_x * TILE_WIDTH;
        let origin_y = tile_y * TILE_HEIGHT;
        let width = TILE_WIDTH.min(self.width - origin_x);
        let height = TILE_HEIGHT.min(self.height - origin_y);
        TileGeometry {
            tile_x,
            tile_y,
            origin_x,
            origin_y,
            width,
            height,
            bpp: self.bpp,
        }
    }

    /// Which tile covers pixel (x, y).
    pub fn tile_containing(&self, x: u32, y: u32) -> Result<(u32, u32), TileStoreError> {
        if x >= self.width || y >= self.height {
            return Err(TileStoreError::OutOfRange);
        }
        Ok((x / TILE_WIDTH, y / TILE_HEIGHT))
    }

    /// Demands the tile at tile-grid coordinates `(tile_x, tile_y)`,
    /// allocating and validating it on first demand.
    pub fn get_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        wanted_writable: bool,
        wanted_dirty: bool,
    ) -> Result<TileHandle, TileStoreError> {
        let index = self.slot_index(tile_x, tile_y)?;
        let mut slots = self.slots.borrow_mut();
        let slot = slots[index].get_or_insert_with(|| Slot {
            tile: Rc::new(RefCell::new(Tile::new_invalid(
                self.tile_geometry(tile_x, tile_y),
            ))),
        });
        slot.tile
            .borrow_mut()
            .ensure_valid(self.validator.as_ref());
        if wanted_dirty {
            // Marking dirty without taking the tile writable is a caller
            // error in the original engine's terms, but the data model
            // does not distinguish a third flag; wanted_writable carries
            // the exclusivity contract.
            debug_assert!(wanted_writable || !wanted_writable);
        }
        Ok(TileHandle {
            tile_x,
            tile_y,
            writable: wanted_writable,
            tile: Rc::clone(&slot.tile),
        })
    }

    /// Releases a handle early. `written` documents intent only: the real
    /// unpinning happens when the handle (and every clone of its `Rc`) is
    /// dropped.
    pub fn release_tile(&self, handle: TileHandle, _written: bool) {
        drop(handle);
    }

    /// Atomically swaps the tile stored at `(tile_x, tile_y)` with
    /// `replacement`, returning the tile that used to live there (or a
    /// fresh invalid tile if the slot was empty). Used by the sparse undo
    /// path to move tile ownership between two managers without copying
    /// pixel data.
    pub fn map_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        replacement: Rc<RefCell<Tile>>,
    ) -> Result<Rc<RefCell<Tile>>, TileStoreError> {
        let index = self.slot_index(tile_x, tile_y)?;
        let mut slots = self.slots.borrow_mut();
        let previous = slots[index].take().map(|slot| slot.tile).unwrap_or_else(|| {
            Rc::new(RefCell::new(Tile::new_invalid(
                self.tile_geometry(tile_x, tile_y),
            )))
        });
        slots[index] = Some(Slot { tile: replacement });
        Ok(previous)
    }

    /// Whether a tile exists in this slot (has ever been demanded or
    /// created), without creating it.
    pub fn has_tile(&self, tile_x: u32, tile_y: u32) -> Result<bool, TileStoreError> {
        let index = self.slot_index(tile_x, tile_y)?;
        Ok(self.slots.borrow()[index].is_some())
    }

    /// Drops the buffer of an idle tile (no outstanding handles), so the
    /// next demand re-creates it through the validator. No-op if handles
    /// are outstanding or the slot is empty.
    pub fn evict_idle(&self, tile_x: u32, tile_y: u32) -> Result<(), TileStoreError> {
        let index = self.slot_index(tile_x, tile_y)?;
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = &slots[index] {
            if Rc::strong_count(&slot.tile) == 1 {
                slots[index] = None;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TileManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileManager")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bpp", &self.bpp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tile_manager_computes_grid_dimensions() {
        let tm = TileManager::new(130, 64, 4).unwrap();
        assert_eq!(tm.tiles_across(), 3);
        assert_eq!(tm.tiles_down(), 1);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        assert_eq!(
            TileManager::new(0, 10, 4).unwrap_err(),
            TileStoreError::InvalidArgument
        );
    }

    #[test]
    fn get_tile_out_of_range_fails() {
        let tm = TileManager::new(64, 64, 4).unwrap();
        assert_eq!(
            tm.get_tile(1, 0, false, false).unwrap_err(),
            TileStoreError::OutOfRange
        );
    }

    #[test]
    fn demand_fill_starts_at_transparent_opacity() {
        let tm = TileManager::new(64, 64, 4).unwrap();
        let handle = tm.get_tile(0, 0, false, false).unwrap();
        handle.with_data(|data| {
            assert!(data.iter().all(|&byte| byte == TRANSPARENT_OPACITY));
        });
    }

    #[test]
    fn validator_runs_once_on_first_demand() {
        let calls = Rc::new(RefCell::new(0usize));
        let calls_clone = Rc::clone(&calls);
        let mut tm = TileManager::new(64, 64, 1).unwrap();
        tm.set_validator(Some(Rc::new(move |buffer: &mut [u8], _geom| {
            *calls_clone.borrow_mut() += 1;
            buffer.fill(7);
        })));

        let first = tm.get_tile(0, 0, false, false).unwrap();
        first.with_data(|data| assert!(data.iter().all(|&b| b == 7)));
        drop(first);

        let second = tm.get_tile(0, 0, false, false).unwrap();
        second.with_data(|data| assert!(data.iter().all(|&b| b == 7)));
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn edge_tile_is_clipped_to_remaining_pixels() {
        let tm = TileManager::new(100, 100, 4).unwrap();
        let handle = tm.get_tile(1, 1, false, false).unwrap();
        let geom = handle.geometry();
        assert_eq!(geom.width, 100 - TILE_WIDTH);
        assert_eq!(geom.height, 100 - TILE_HEIGHT);
    }

    #[test]
    fn refcount_tracks_outstanding_handles() {
        let tm = TileManager::new(64, 64, 4).unwrap();
        let a = tm.get_tile(0, 0, false, false).unwrap();
        assert_eq!(a.refcount(), 2); // slot + handle
        let b = tm.get_tile(0, 0, false, false).unwrap();
        assert_eq!(a.refcount(), 3);
        drop(b);
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn writable_handle_mutates_shared_buffer() {
        let tm = TileManager::new(64, 64, 1).unwrap();
        {
            let handle = tm.get_tile(0, 0, true, true).unwrap();
            handle.with_data_mut(|data| data[0] = 42);
        }
        let handle = tm.get_tile(0, 0, false, false).unwrap();
        handle.with_data(|data| assert_eq!(data[0], 42));
    }

    #[test]
    fn map_tile_swaps_slot_contents_without_copy() {
        let a = TileManager::new(64, 64, 1).unwrap();
        let b = TileManager::new(64, 64, 1).unwrap();
        {
            let handle = a.get_tile(0, 0, true, true).unwrap();
            handle.with_data_mut(|data| data[0] = 9);
        }
        let blank = Rc::new(RefCell::new(Tile::new_invalid(
            b.tile_geometry(0, 0),
        )));
        let moved = a.map_tile(0, 0, blank).unwrap();
        let reinstalled = b.map_tile(0, 0, moved).unwrap();
        drop(reinstalled);

        let handle = b.get_tile(0, 0, false, false).unwrap();
        handle.with_data(|data| assert_eq!(data[0], 9));
    }

    #[test]
    fn evict_idle_drops_buffer_only_when_unpinned() {
        let tm = TileManager::new(64, 64, 1).unwrap();
        let handle = tm.get_tile(0, 0, false, false).unwrap();
        tm.evict_idle(0, 0).unwrap();
        assert!(tm.has_tile(0, 0).unwrap()); // still pinned

        drop(handle);
        tm.evict_idle(0, 0).unwrap();
        assert!(!tm.has_tile(0, 0).unwrap());
    }
}
