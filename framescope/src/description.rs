//! The process-global registry of event descriptions.
//!
//! A description is the static identity of an annotation point: name,
//! source location, color, filter mask, and a dense `index` assigned on
//! first registration. The hot path never touches the board — call sites
//! cache the `&'static EventDescription` they got back once.

use std::hash::Hasher;

use framescope_wire::{Encode, OutputStream};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use thiserror::Error;

/// ARGB colors for categories. `NULL` marks a plain (non-category) event.
pub mod color {
    pub const NULL: u32 = 0x0000_0000;
    pub const WHITE: u32 = 0xFFFF_FFFF;
    pub const RED: u32 = 0xFFFF_0000;
    pub const GREEN: u32 = 0xFF00_8000;
    pub const BLUE: u32 = 0xFF00_00FF;
    pub const ORANGE: u32 = 0xFFFF_A500;
    pub const PURPLE: u32 = 0xFF80_0080;
    pub const YELLOW: u32 = 0xFFFF_FF00;
    pub const CYAN: u32 = 0xFF00_FFFF;
    pub const MAGENTA: u32 = 0xFFFF_00FF;
    pub const TOMATO: u32 = 0xFFFF_6347;
    pub const STEEL_BLUE: u32 = 0xFF46_82B4;
    pub const DARK_GREEN: u32 = 0xFF00_6400;
}

/// Serialized as index `0xFFFF_FFFF`; also the reason the id space stops
/// one short of `u32::MAX`.
pub(crate) const INVALID_DESCRIPTION_INDEX: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BoardError {
    /// The 32-bit description id space is exhausted. Registration fails
    /// deterministically instead of wrapping.
    #[error("event description id space is exhausted")]
    IdSpaceExhausted,
}

#[derive(Debug)]
pub struct EventDescription {
    pub name: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub color: u32,
    pub filter: u32,
    /// Dense, monotonically increasing, never reused.
    pub index: u32,
}

impl EventDescription {
    /// Register a new description. Every call creates a new record; the
    /// typical caller is a macro that does this once per call site.
    pub fn create(
        name: &'static str,
        file: &'static str,
        line: u32,
        color: u32,
        filter: u32,
    ) -> Option<&'static EventDescription> {
        match DescriptionBoard::global().create(name, file, line, color, filter) {
            Ok(desc) => Some(desc),
            Err(err) => {
                log::error!("failed to register event description {name:?}: {err}");
                None
            }
        }
    }

    /// Register or look up a description interned by name hash. The name
    /// does not need to outlive the call.
    pub fn create_shared(name: &str) -> Option<&'static EventDescription> {
        match DescriptionBoard::global().create_shared(name, "", 0, color::NULL, 0) {
            Ok(desc) => Some(desc),
            Err(err) => {
                log::error!("failed to register shared event description {name:?}: {err}");
                None
            }
        }
    }

    pub fn is_category(&self) -> bool {
        self.color != color::NULL
    }
}

impl Encode for EventDescription {
    fn encode(&self, out: &mut OutputStream) {
        out.write_str(self.name);
        out.write_str(self.file);
        out.write_u32(self.line);
        out.write_u32(self.filter);
        out.write_u32(self.color);
        // Budget and flags ride along for wire compatibility; no public
        // API sets them.
        out.write_f32(0.0);
        out.write_u8(0);
    }
}

fn name_hash(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

#[derive(Default)]
struct BoardInner {
    /// Source of truth for `index`: `descriptions[i].index == i`.
    descriptions: Vec<&'static EventDescription>,
    /// Shared descriptions, interned by 64-bit name hash.
    shared: FxHashMap<u64, &'static EventDescription>,
}

/// The global description board. Creation is rare and mutex-guarded;
/// lookups on the recording path go through cached `&'static` borrows and
/// never lock.
pub struct DescriptionBoard {
    inner: Mutex<BoardInner>,
}

static BOARD: Lazy<DescriptionBoard> = Lazy::new(|| DescriptionBoard {
    inner: Mutex::new(BoardInner::default()),
});

impl DescriptionBoard {
    pub fn global() -> &'static DescriptionBoard {
        &BOARD
    }

    pub fn create(
        &self,
        name: &'static str,
        file: &'static str,
        line: u32,
        color: u32,
        filter: u32,
    ) -> Result<&'static EventDescription, BoardError> {
        let mut inner = self.inner.lock();
        Self::create_locked(&mut inner, name, file, line, color, filter)
    }

    pub fn create_shared(
        &self,
        name: &str,
        file: &'static str,
        line: u32,
        color: u32,
        filter: u32,
    ) -> Result<&'static EventDescription, BoardError> {
        let hash = name_hash(name);
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.shared.get(&hash).copied() {
            return Ok(existing);
        }
        // Miss: give the name a stable lifetime. Descriptions live for the
        // whole process, so the copy is permanent by design.
        let owned: &'static str = Box::leak(name.to_string().into_boxed_str());
        let desc = Self::create_locked(&mut inner, owned, file, line, color, filter)?;
        inner.shared.insert(hash, desc);
        Ok(desc)
    }

    fn create_locked(
        inner: &mut BoardInner,
        name: &'static str,
        file: &'static str,
        line: u32,
        color: u32,
        filter: u32,
    ) -> Result<&'static EventDescription, BoardError> {
        let index = inner.descriptions.len();
        if index >= INVALID_DESCRIPTION_INDEX as usize {
            return Err(BoardError::IdSpaceExhausted);
        }
        let desc: &'static EventDescription = Box::leak(Box::new(EventDescription {
            name,
            file,
            line,
            color,
            filter,
            index: index as u32,
        }));
        inner.descriptions.push(desc);
        Ok(desc)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize all descriptions in index order. The interning map is not
    /// part of the wire format.
    pub fn encode(&self, out: &mut OutputStream) {
        let inner = self.inner.lock();
        out.write_u32(inner.descriptions.len() as u32);
        for desc in &inner.descriptions {
            desc.encode(out);
        }
    }
}
