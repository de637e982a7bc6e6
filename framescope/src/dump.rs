//! Scope packing: turning one storage's flat event sequence into rooted
//! `EventFrame` messages at dump time.
//!
//! Events arrive in call order (or sorted by `(start asc, finish desc)` for
//! custom storages). Consecutive events that fit inside the current root's
//! time span are its children; an event that outlives the root flushes the
//! scope and starts a new one.

use framescope_wire::{Encode, OutputStream};

use crate::description::color;
use crate::event::{EventData, EventTime};

pub(crate) struct ScopeHeader {
    pub board_number: u32,
    pub thread_number: i32,
    pub fiber_number: i32,
    pub event: EventTime,
}

impl Encode for ScopeHeader {
    fn encode(&self, out: &mut OutputStream) {
        out.write_u32(self.board_number);
        out.write_i32(self.thread_number);
        out.write_i32(self.fiber_number);
        self.event.encode(out);
    }
}

/// One flushed batch of events under a single root; one wire message.
pub(crate) struct ScopeData {
    pub header: ScopeHeader,
    pub categories: Vec<EventData>,
    pub events: Vec<EventData>,
}

impl ScopeData {
    pub fn new(board_number: u32, thread_number: i32, fiber_number: i32) -> Self {
        ScopeData {
            header: ScopeHeader {
                board_number,
                thread_number,
                fiber_number,
                event: EventTime::default(),
            },
            categories: Vec::new(),
            events: Vec::new(),
        }
    }

    fn init_root(&mut self, data: EventData) {
        self.header.event = data.time;
        self.add_event(data);
    }

    fn add_event(&mut self, data: EventData) {
        if data.is_category() {
            self.categories.push(data);
        }
        self.events.push(data);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.categories.is_empty()
    }

    /// A scope whose every event is the idle color carries no signal and is
    /// not worth a message.
    pub fn is_sleep_only(&self) -> bool {
        self.events
            .iter()
            .all(|event| event.description.map(|d| d.color) == Some(color::WHITE))
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.categories.clear();
    }
}

impl Encode for ScopeData {
    fn encode(&self, out: &mut OutputStream) {
        self.header.encode(out);
        self.categories.encode(out);
        self.events.encode(out);
    }
}

/// Pack `events` into rooted scopes and hand each completed scope to
/// `flush`. Only complete events inside `time_slice` are considered; the
/// caller receives every one of them exactly once.
pub(crate) fn pack_scopes(
    events: impl IntoIterator<Item = EventData>,
    time_slice: EventTime,
    scope: &mut ScopeData,
    mut flush: impl FnMut(&ScopeData),
) {
    let mut root: Option<EventTime> = None;

    for data in events {
        let time = data.time;
        let in_slice = time.finish >= time.start
            && time.start >= time_slice.start
            && time_slice.finish >= time.finish;
        if !in_slice {
            continue;
        }

        match root {
            None => {
                root = Some(time);
                scope.init_root(data);
            }
            Some(current) if current.finish < time.finish => {
                if !scope.is_empty() {
                    flush(scope);
                }
                scope.clear();
                root = Some(time);
                scope.init_root(data);
            }
            Some(_) => scope.add_event(data),
        }
    }

    if !scope.is_empty() {
        flush(scope);
    }
    scope.clear();
}

/// Ordering for custom storages whose events were appended out of call
/// order: outermost-first within equal starts.
pub(crate) fn event_order(a: &EventData, b: &EventData) -> std::cmp::Ordering {
    a.time
        .start
        .cmp(&b.time.start)
        .then(b.time.finish.cmp(&a.time.finish))
}
