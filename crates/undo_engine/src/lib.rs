//! The undo/redo stack pair backing one image: typed records, grouped
//! transactions, and size-bounded eviction of whole logical actions.

/// Which way a record's payload is being swapped back into place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Undo,
    Redo,
}

/// The full record-kind taxonomy. Every kind doubles as the UI label
/// carried by a group's sentinel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UndoKind {
    ImageUndo,
    ImageModUndo,
    MaskUndo,
    LayerDisplaceUndo,
    LayerMod,
    LayerMaskAddUndo,
    LayerMaskRemoveUndo,
    LayerAddUndo,
    LayerRemoveUndo,
    ChannelAddUndo,
    ChannelRemoveUndo,
    ChannelMod,
    FsToLayerUndo,
    FsRigorUndo,
    FsRelaxUndo,
    FsAnchorUndo,
    FloatMaskUndo,
    GimageMod,
    GuideUndo,
    ResolutionUndo,
    QmaskUndo,
    ParasiteUndo,
    LayerRenameUndo,
    /// Group boundary for a base-type conversion (RGB/grayscale/indexed):
    /// wraps the colormap swap, the base-type swap, and one `LayerMod`
    /// per converted layer as a single logical action.
    ConvertTypeUndo,
    /// Placeholder for an operation whose undo was never implemented.
    CantUndo,
}

/// Events fired synchronously from within `push`/`pop`/`group_end`, never
/// queued or promoted to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoEvent {
    Pushed(UndoKind),
    Expired(UndoKind),
    Popped(UndoKind),
    Redone(UndoKind),
    Freed,
}

/// A record's saved state, able to swap itself with the drawable/image's
/// live state. A second `pop` with the opposite direction must restore
/// what the first one replaced.
pub trait UndoPayload {
    fn pop(&mut self, direction: Direction);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Start,
    End,
}

struct Record {
    kind: UndoKind,
    payload: Option<Box<dyn UndoPayload>>,
    bytes: usize,
    dirties_image: bool,
    boundary: Option<Boundary>,
}

/// Sentinel dirty value: once a discarded redo sequence had walked the
/// image back to clean, no remaining undo history can make it clean
/// again, so the counter is pinned far from zero instead of guessed at.
const DIRTY_UNREACHABLE: i64 = i64::MAX / 2;

pub struct UndoEngine {
    undo_stack: Vec<Record>,
    redo_stack: Vec<Record>,
    bytes: usize,
    levels: usize,
    max_levels: usize,
    dirty: i64,
    enabled: bool,
    frozen: bool,
    group_depth: u32,
    group_kind: Option<UndoKind>,
    callback: Option<Box<dyn FnMut(UndoEvent)>>,
}

impl UndoEngine {
    pub fn new(max_levels: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            bytes: 0,
            levels: 0,
            max_levels,
            dirty: 0,
            enabled: true,
            frozen: false,
            group_depth: 0,
            group_kind: None,
            callback: None,
        }
    }

    pub fn set_event_callback(&mut self, callback: Option<Box<dyn FnMut(UndoEvent)>>) {
        self.callback = callback;
    }

    pub fn take_event_callback(&mut self) -> Option<Box<dyn FnMut(UndoEvent)>> {
        self.callback.take()
    }

    fn emit(&mut self, event: UndoEvent) {
        if let Some(callback) = &mut self.callback {
            callback(event);
        }
    }

    pub fn dirty(&self) -> i64 {
        self.dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty == 0
    }

    pub fn mark_clean(&mut self) {
        self.dirty = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn is_group_open(&self) -> bool {
        self.group_depth > 0
    }

    /// The kind of whatever `pop(direction)` would act on next, for
    /// building a human-facing undo/redo menu label. Every record,
    /// whether a lone action or a group boundary sentinel, carries its
    /// own kind, so the top of the stack always names the right thing.
    pub fn peek_kind(&self, direction: Direction) -> Option<UndoKind> {
        let stack = match direction {
            Direction::Undo => &self.undo_stack,
            Direction::Redo => &self.redo_stack,
        };
        stack.last().map(|r| r.kind)
    }

    /// Pushes one undo record. Returns whether it was actually recorded;
    /// the dirty counter advances regardless, per the engine's first
    /// rule (a rejected push still marks the image dirty).
    pub fn push(
        &mut self,
        kind: UndoKind,
        payload: Option<Box<dyn UndoPayload>>,
        bytes: usize,
        dirties_image: bool,
    ) -> bool {
        if dirties_image {
            self.dirty += 1;
        }
        if !self.enabled || self.frozen {
            return false;
        }
        if !self.redo_stack.is_empty() {
            self.discard_redo();
        }
        if self.group_depth == 0 {
            self.free_up_space();
        }
        self.bytes += bytes;
        self.undo_stack.push(Record {
            kind,
            payload,
            bytes,
            dirties_image,
            boundary: None,
        });
        if self.group_depth == 0 {
            self.levels += 1;
            self.emit(UndoEvent::Pushed(kind));
        }
        true
    }

    fn discard_redo(&mut self) {
        self.redo_stack.clear();
        if self.dirty < 0 {
            self.dirty = DIRTY_UNREACHABLE;
        }
    }

    /// Opens (or deepens) a group transaction. At the outer 0→1
    /// transition this drops the redo stack, frees space, and pushes a
    /// group-start sentinel; nested calls only bump the nesting counter.
    pub fn group_start(&mut self, kind: UndoKind) {
        self.group_depth += 1;
        if self.group_depth == 1 {
            self.group_kind = Some(kind);
            if !self.redo_stack.is_empty() {
                self.discard_redo();
            }
            self.free_up_space();
            self.undo_stack.push(Record {
                kind,
                payload: None,
                bytes: 0,
                dirties_image: false,
                boundary: Some(Boundary::Start),
            });
        }
    }

    /// Closes a group transaction. Only the outer 1→0 transition pushes
    /// the matching group-end sentinel and fires a single `Pushed` event
    /// for the whole group.
    pub fn group_end(&mut self) {
        assert!(self.group_depth > 0, "group_end without a matching group_start");
        self.group_depth -= 1;
        if self.group_depth == 0 {
            let kind = self.group_kind.take().expect("group kind set at group_start");
            self.undo_stack.push(Record {
                kind,
                payload: None,
                bytes: 0,
                dirties_image: false,
                boundary: Some(Boundary::End),
            });
            self.levels += 1;
            self.emit(UndoEvent::Pushed(kind));
        }
    }

    /// Evicts whole logical actions from the stack bottom until
    /// `levels <= max_levels`. A group is evicted as a unit.
    fn free_up_space(&mut self) {
        while self.levels > self.max_levels && !self.undo_stack.is_empty() {
            let bottom = self.undo_stack.remove(0);
            match bottom.boundary {
                Some(Boundary::Start) => {
                    let kind = bottom.kind;
                    let mut bytes = bottom.bytes;
                    while !self.undo_stack.is_empty() {
                        let next = self.undo_stack.remove(0);
                        bytes += next.bytes;
                        if next.boundary == Some(Boundary::End) {
                            break;
                        }
                    }
                    self.bytes -= bytes;
                    self.levels -= 1;
                    self.emit(UndoEvent::Expired(kind));
                }
                Some(Boundary::End) => {
                    // A stray End at the bottom can't happen in a
                    // well-formed stack; drop it defensively.
                    self.bytes -= bottom.bytes;
                }
                None => {
                    self.bytes -= bottom.bytes;
                    self.levels -= 1;
                    self.emit(UndoEvent::Expired(bottom.kind));
                }
            }
        }
    }

    /// Pops one logical action (a lone record, or an entire group) from
    /// `direction`'s source stack onto the other stack. Returns `false`
    /// if the source stack was empty.
    pub fn pop(&mut self, direction: Direction) -> bool {
        assert!(
            self.group_depth == 0,
            "cannot pop or redo while a group is open"
        );
        let source_empty = match direction {
            Direction::Undo => self.undo_stack.is_empty(),
            Direction::Redo => self.redo_stack.is_empty(),
        };
        if source_empty {
            return false;
        }

        let mut in_group = false;
        let mut action_kind = None;

        loop {
            let record = match direction {
                Direction::Undo => self.undo_stack.pop(),
                Direction::Redo => self.redo_stack.pop(),
            };
            let mut record = match record {
                Some(record) => record,
                None => break,
            };

            if action_kind.is_none() {
                action_kind = Some(record.kind);
            }

            if let Some(boundary) = record.boundary {
                match boundary {
                    Boundary::End => in_group = true,
                    Boundary::Start => in_group = false,
                }
            } else {
                if record.kind == UndoKind::CantUndo {
                    match direction {
                        Direction::Undo => self.dirty = 0,
                        Direction::Redo => self.dirty += 1,
                    }
                } else if record.dirties_image {
                    match direction {
                        Direction::Undo => self.dirty -= 1,
                        Direction::Redo => self.dirty += 1,
                    }
                }
                if let Some(payload) = &mut record.payload {
                    payload.pop(direction);
                }
            }

            let bytes = record.bytes;
            match direction {
                Direction::Undo => self.bytes -= bytes,
                Direction::Redo => self.bytes += bytes,
            }
            match direction {
                Direction::Undo => self.redo_stack.push(record),
                Direction::Redo => self.undo_stack.push(record),
            }

            if !in_group {
                break;
            }
        }

        match direction {
            Direction::Undo => self.levels -= 1,
            Direction::Redo => self.levels += 1,
        }

        let kind = action_kind.expect("at least one record was popped");
        self.emit(match direction {
            Direction::Undo => UndoEvent::Popped(kind),
            Direction::Redo => UndoEvent::Redone(kind),
        });
        true
    }
}

impl Drop for UndoEngine {
    fn drop(&mut self) {
        self.emit(UndoEvent::Freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingPayload {
        log: Rc<RefCell<Vec<Direction>>>,
    }

    impl UndoPayload for RecordingPayload {
        fn pop(&mut self, direction: Direction) {
            self.log.borrow_mut().push(direction);
        }
    }

    #[test]
    fn push_then_pop_round_trips_a_single_record() {
        let mut engine = UndoEngine::new(10);
        let log = Rc::new(RefCell::new(Vec::new()));
        engine.push(
            UndoKind::LayerRenameUndo,
            Some(Box::new(RecordingPayload { log: log.clone() })),
            4,
            true,
        );
        assert_eq!(engine.dirty(), 1);
        assert!(engine.pop(Direction::Undo));
        assert_eq!(engine.dirty(), 0);
        assert_eq!(*log.borrow(), vec![Direction::Undo]);
        assert!(engine.pop(Direction::Redo));
        assert_eq!(engine.dirty(), 1);
        assert_eq!(*log.borrow(), vec![Direction::Undo, Direction::Redo]);
    }

    #[test]
    fn rejected_push_still_dirties_the_image() {
        let mut engine = UndoEngine::new(10);
        engine.set_enabled(false);
        let pushed = engine.push(UndoKind::MaskUndo, None, 0, true);
        assert!(!pushed);
        assert_eq!(engine.dirty(), 1);
        assert!(!engine.can_undo());
    }

    #[test]
    fn new_push_after_undo_discards_redo_stack() {
        let mut engine = UndoEngine::new(10);
        engine.push(UndoKind::MaskUndo, None, 1, true);
        engine.pop(Direction::Undo);
        assert!(engine.can_redo());
        engine.push(UndoKind::MaskUndo, None, 1, true);
        assert!(!engine.can_redo());
    }

    #[test]
    fn group_transaction_pops_as_one_atomic_action() {
        let mut engine = UndoEngine::new(10);
        let log = Rc::new(RefCell::new(Vec::new()));
        engine.group_start(UndoKind::LayerDisplaceUndo);
        engine.push(
            UndoKind::LayerDisplaceUndo,
            Some(Box::new(RecordingPayload { log: log.clone() })),
            1,
            true,
        );
        engine.push(
            UndoKind::LayerMaskAddUndo,
            Some(Box::new(RecordingPayload { log: log.clone() })),
            1,
            false,
        );
        engine.group_end();
        assert_eq!(engine.levels(), 1);

        assert!(engine.pop(Direction::Undo));
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(engine.dirty(), 0);
        assert_eq!(engine.levels(), 0);
    }

    #[test]
    #[should_panic]
    fn pop_while_group_open_panics() {
        let mut engine = UndoEngine::new(10);
        engine.group_start(UndoKind::MaskUndo);
        engine.pop(Direction::Undo);
    }

    #[test]
    fn eviction_removes_whole_actions_from_the_bottom() {
        // free_up_space runs *before* each push, so a run of pushes past
        // max_levels settles at max_levels + 1 resident actions, trimmed
        // back down on the next push -- matching the engine's own
        // evict-then-allocate ordering.
        let expired = Rc::new(RefCell::new(0usize));
        let expired_clone = expired.clone();
        let mut engine = UndoEngine::new(1);
        engine.set_event_callback(Some(Box::new(move |event| {
            if let UndoEvent::Expired(_) = event {
                *expired_clone.borrow_mut() += 1;
            }
        })));
        engine.push(UndoKind::MaskUndo, None, 1, false);
        engine.push(UndoKind::MaskUndo, None, 1, false);
        assert_eq!(engine.levels(), 2);
        engine.push(UndoKind::MaskUndo, None, 1, false);
        assert_eq!(*expired.borrow(), 1);
        assert_eq!(engine.levels(), 2);
        assert_eq!(engine.bytes(), 2);
    }

    #[test]
    fn eviction_removes_a_whole_group_as_one_action() {
        let mut engine = UndoEngine::new(1);
        engine.push(UndoKind::MaskUndo, None, 1, false);
        engine.group_start(UndoKind::LayerDisplaceUndo);
        engine.push(UndoKind::LayerDisplaceUndo, None, 1, false);
        engine.push(UndoKind::LayerMaskAddUndo, None, 1, false);
        engine.group_end();
        assert_eq!(engine.levels(), 2);
        engine.push(UndoKind::MaskUndo, None, 1, false);
        // The eviction triggered by this last push must have dropped the
        // *entire* earlier group in one unit, not split it.
        assert_eq!(engine.levels(), 2);
    }

    #[test]
    fn frozen_engine_rejects_pushes_but_still_counts_dirty() {
        let mut engine = UndoEngine::new(10);
        engine.freeze();
        let pushed = engine.push(UndoKind::LayerDisplaceUndo, None, 1, true);
        assert!(!pushed);
        assert_eq!(engine.dirty(), 1);
        assert!(!engine.can_undo());
        engine.thaw();
        engine.push(UndoKind::LayerDisplaceUndo, None, 1, true);
        assert!(engine.can_undo());
    }

    #[test]
    fn cant_undo_resets_to_clean_on_undo_and_redirties_on_redo() {
        let mut engine = UndoEngine::new(10);
        engine.push(UndoKind::MaskUndo, None, 0, true);
        engine.push(UndoKind::CantUndo, None, 0, true);
        assert_eq!(engine.dirty(), 2);
        engine.pop(Direction::Undo);
        assert_eq!(engine.dirty(), 0);
        engine.pop(Direction::Redo);
        assert_eq!(engine.dirty(), 1);
    }
}
