//! Event records, tags, and the per-thread storage they land in.
//!
//! The hot path contract: `Event::start` loads the calling thread's storage
//! slot, and if no capture is active that load is the entire cost. When a
//! capture is running, start/stop produce exactly one `EventData` in the
//! owning thread's buffer with no synchronization against other threads.

use std::cell::RefCell;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use framescope_wire::{Encode, OutputStream};

use crate::cell::SingleWriterCell;
use crate::clock;
use crate::description::{EventDescription, INVALID_DESCRIPTION_INDEX};
use crate::gpu::{GpuContext, GPU_QUEUE_COUNT, MAX_GPU_NODES};
use crate::pool::MemoryPool;

/// Denotes "not set"; in-flight GPU events carry it until their query
/// resolves, and the dumper drops whole events that still carry it.
pub const INVALID_TIMESTAMP: i64 = -1;

/// Explicit push/pop nesting deeper than this is dropped.
pub const MAX_PUSH_POP_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventTime {
    pub start: i64,
    pub finish: i64,
}

impl EventTime {
    pub const UNSET: EventTime = EventTime {
        start: INVALID_TIMESTAMP,
        finish: INVALID_TIMESTAMP,
    };

    pub fn begin_now() -> EventTime {
        EventTime {
            start: clock::now(),
            finish: INVALID_TIMESTAMP,
        }
    }

    pub fn stop(&mut self) {
        self.finish = clock::now();
    }

    pub fn is_complete(&self) -> bool {
        self.start != INVALID_TIMESTAMP && self.finish >= self.start
    }
}

impl Encode for EventTime {
    fn encode(&self, out: &mut OutputStream) {
        out.write_i64(self.start);
        out.write_i64(self.finish);
    }
}

/// One recorded scope: a time span plus the description of its call site.
/// The description may be absent on external storages whose records are
/// attributed later (resolved syscalls).
#[derive(Debug, Clone, Copy, Default)]
pub struct EventData {
    pub time: EventTime,
    pub description: Option<&'static EventDescription>,
}

impl EventData {
    pub fn description_index(&self) -> u32 {
        self.description
            .map(|d| d.index)
            .unwrap_or(INVALID_DESCRIPTION_INDEX)
    }

    pub fn is_category(&self) -> bool {
        self.description.is_some_and(|d| d.is_category())
    }
}

impl Encode for EventData {
    fn encode(&self, out: &mut OutputStream) {
        self.time.encode(out);
        out.write_u32(self.description_index());
    }
}

/// Marks a window during which a fiber ran on a particular thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiberSyncData {
    pub time: EventTime,
    pub thread_id: u64,
}

impl Encode for FiberSyncData {
    fn encode(&self, out: &mut OutputStream) {
        self.time.encode(out);
        out.write_u64(self.thread_id);
    }
}

/// A 3-component tag value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Encode for Point {
    fn encode(&self, out: &mut OutputStream) {
        out.write_f32(self.x);
        out.write_f32(self.y);
        out.write_f32(self.z);
    }
}

/// Inline string tag value, truncated to fit with a trailing NUL.
#[derive(Debug, Clone, Copy)]
pub struct ShortString {
    data: [u8; Self::CAPACITY],
}

impl ShortString {
    pub const CAPACITY: usize = 32;

    pub fn new(text: &str) -> Self {
        let mut data = [0u8; Self::CAPACITY];
        let mut len = text.len().min(Self::CAPACITY - 1);
        // Never cut a UTF-8 sequence in half.
        while len > 0 && !text.is_char_boundary(len) {
            len -= 1;
        }
        data[..len].copy_from_slice(&text.as_bytes()[..len]);
        ShortString { data }
    }

    pub fn as_str(&self) -> &str {
        let len = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::CAPACITY);
        std::str::from_utf8(&self.data[..len]).unwrap_or("")
    }
}

impl Encode for ShortString {
    fn encode(&self, out: &mut OutputStream) {
        out.write_str(self.as_str());
    }
}

/// Timestamped key-value annotation. The description is the key.
#[derive(Debug, Clone, Copy)]
pub struct TagData<T> {
    pub description: &'static EventDescription,
    pub timestamp: i64,
    pub value: T,
}

impl<T> TagData<T> {
    pub fn new(description: &'static EventDescription, value: T) -> Self {
        TagData {
            description,
            timestamp: clock::now(),
            value,
        }
    }
}

impl<T: Encode> Encode for TagData<T> {
    fn encode(&self, out: &mut OutputStream) {
        out.write_i64(self.timestamp);
        out.write_u32(self.description.index);
        self.value.encode(out);
    }
}

pub type TagF32 = TagData<f32>;
pub type TagI32 = TagData<i32>;
pub type TagU32 = TagData<u32>;
pub type TagU64 = TagData<u64>;
pub type TagPoint = TagData<Point>;
pub type TagString = TagData<ShortString>;

/// Raw pointer into a single-writer pool. Only ever dereferenced under the
/// storage's writer contract, so moving it between threads with the rest of
/// the storage state is sound.
#[derive(Clone, Copy)]
pub(crate) struct EventSlot(pub *mut EventData);
unsafe impl Send for EventSlot {}

pub(crate) struct GpuBuffers {
    pub buffers: [[MemoryPool<EventData, 1024>; GPU_QUEUE_COUNT]; MAX_GPU_NODES],
    pub context: GpuContext,
}

impl Default for GpuBuffers {
    fn default() -> Self {
        GpuBuffers {
            buffers: std::array::from_fn(|_| std::array::from_fn(|_| MemoryPool::new())),
            context: GpuContext::default(),
        }
    }
}

impl GpuBuffers {
    fn clear(&mut self, preserve_memory: bool) {
        for node in &mut self.buffers {
            for queue in node {
                queue.clear(preserve_memory);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct StorageInner {
    pub event_buffer: MemoryPool<EventData, 1024>,
    pub fiber_sync_buffer: MemoryPool<FiberSyncData, 1024>,

    pub tag_f32_buffer: MemoryPool<TagF32, 1024>,
    pub tag_i32_buffer: MemoryPool<TagI32, 1024>,
    pub tag_u32_buffer: MemoryPool<TagU32, 1024>,
    pub tag_u64_buffer: MemoryPool<TagU64, 1024>,
    pub tag_point_buffer: MemoryPool<TagPoint, 64>,
    pub tag_string_buffer: MemoryPool<TagString, 1024>,

    pub gpu: GpuBuffers,

    push_stack: Vec<EventSlot>,
    overflow_logged: bool,
}

/// A single thread's (or fiber's, or external source's) event buffers.
///
/// All appends come from the owning thread; the dump pass reads only after
/// the capture state transition has stopped the writers.
pub struct EventStorage {
    inner: SingleWriterCell<StorageInner>,
    is_fiber_storage: bool,
}

impl EventStorage {
    pub(crate) fn new(is_fiber_storage: bool) -> Self {
        EventStorage {
            inner: SingleWriterCell::new(StorageInner::default()),
            is_fiber_storage,
        }
    }

    pub fn is_fiber_storage(&self) -> bool {
        self.is_fiber_storage
    }

    /// Writer-side access. Caller must be the storage's current owner.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn writer(&self) -> &mut StorageInner {
        self.inner.writer()
    }

    /// Reader-side access. Caller must have stopped the writer first.
    pub(crate) unsafe fn reader(&self) -> &StorageInner {
        self.inner.reader()
    }

    pub(crate) fn begin_event(&self, description: &'static EventDescription, start: i64) -> EventSlot {
        let inner = unsafe { self.writer() };
        let data = inner.event_buffer.push(EventData {
            time: EventTime {
                start,
                finish: INVALID_TIMESTAMP,
            },
            description: Some(description),
        });
        EventSlot(data as *mut EventData)
    }

    pub(crate) fn add_event(
        &self,
        description: Option<&'static EventDescription>,
        start: i64,
        finish: i64,
    ) {
        let inner = unsafe { self.writer() };
        inner.event_buffer.push(EventData {
            time: EventTime { start, finish },
            description,
        });
    }

    pub(crate) fn push_event(&self, description: &'static EventDescription, start: i64) {
        let inner = unsafe { self.writer() };
        if inner.push_stack.len() >= MAX_PUSH_POP_DEPTH {
            if !inner.overflow_logged {
                inner.overflow_logged = true;
                log::warn!(
                    "push/pop event stack overflow (depth {MAX_PUSH_POP_DEPTH}); dropping {:?}",
                    description.name
                );
            }
            return;
        }
        let slot = self.begin_event(description, start);
        let inner = unsafe { self.writer() };
        inner.push_stack.push(slot);
    }

    pub(crate) fn pop_event(&self, finish: i64) {
        let inner = unsafe { self.writer() };
        if let Some(slot) = inner.push_stack.pop() {
            unsafe {
                (*slot.0).time.finish = finish;
            }
        }
    }

    pub(crate) fn attach_tag<T>(
        &self,
        tag: TagData<T>,
        select: impl FnOnce(&mut StorageInner) -> &mut MemoryPool<TagData<T>, 1024>,
    ) {
        let inner = unsafe { self.writer() };
        select(inner).push(tag);
    }

    pub(crate) fn attach_point_tag(&self, tag: TagPoint) {
        let inner = unsafe { self.writer() };
        inner.tag_point_buffer.push(tag);
    }

    pub(crate) fn fiber_attach(&self, thread_id: u64) {
        let inner = unsafe { self.writer() };
        inner.fiber_sync_buffer.push(FiberSyncData {
            time: EventTime::begin_now(),
            thread_id,
        });
    }

    pub(crate) fn fiber_detach(&self) {
        let inner = unsafe { self.writer() };
        if let Some(sync) = inner.fiber_sync_buffer.back_mut() {
            sync.time.stop();
        }
    }

    /// Append a GPU event shell with unset timestamps; the caller wires the
    /// start/finish fields to timestamp queries.
    pub(crate) fn gpu_begin_event(
        &self,
        description: &'static EventDescription,
    ) -> Option<(EventSlot, GpuContext)> {
        let inner = unsafe { self.writer() };
        let context = inner.gpu.context;
        let node = context.node as usize;
        let queue = context.queue as usize;
        if node >= MAX_GPU_NODES || queue >= GPU_QUEUE_COUNT {
            return None;
        }
        let data = inner.gpu.buffers[node][queue].push(EventData {
            time: EventTime::UNSET,
            description: Some(description),
        });
        Some((EventSlot(data as *mut EventData), context))
    }

    /// Append a frame-number tag whose timestamp will be filled in by a
    /// resolved GPU query. Returns the timestamp slot to wire the query to.
    pub(crate) fn begin_frame_tag(
        &self,
        description: &'static EventDescription,
        frame_number: u32,
    ) -> *mut i64 {
        let inner = unsafe { self.writer() };
        let tag = inner.tag_u32_buffer.push(TagData {
            description,
            timestamp: INVALID_TIMESTAMP,
            value: frame_number,
        });
        &mut tag.timestamp
    }

    pub(crate) fn gpu_context(&self) -> GpuContext {
        unsafe { self.reader().gpu.context }
    }

    pub(crate) fn set_gpu_context(&self, context: GpuContext) -> GpuContext {
        let inner = unsafe { self.writer() };
        std::mem::replace(&mut inner.gpu.context, context)
    }

    /// Reset all buffers. Called on activation (with the previous capture's
    /// memory retained) and after the dump pass.
    pub(crate) fn clear(&self, preserve_memory: bool) {
        let inner = unsafe { self.writer() };
        inner.event_buffer.clear(preserve_memory);
        inner.fiber_sync_buffer.clear(preserve_memory);
        inner.gpu.clear(preserve_memory);
        inner.push_stack.clear();
        inner.overflow_logged = false;
        Self::clear_tags_inner(inner, preserve_memory);
    }

    pub(crate) fn clear_tags(&self, preserve_memory: bool) {
        Self::clear_tags_inner(unsafe { self.writer() }, preserve_memory);
    }

    fn clear_tags_inner(inner: &mut StorageInner, preserve_memory: bool) {
        inner.tag_f32_buffer.clear(preserve_memory);
        inner.tag_i32_buffer.clear(preserve_memory);
        inner.tag_u32_buffer.clear(preserve_memory);
        inner.tag_u64_buffer.clear(preserve_memory);
        inner.tag_point_buffer.clear(preserve_memory);
        inner.tag_string_buffer.clear(preserve_memory);
    }

    pub(crate) fn event_count(&self) -> usize {
        unsafe { self.reader().event_buffer.size() }
    }
}

/// The activation switch for one registered thread or fiber.
///
/// The indirection exists so the core can disable a thread's recording at a
/// state transition without that thread's cooperation: the owner loads the
/// pointer on every annotation, the core stores it on activate/deactivate.
pub(crate) struct StorageSlot {
    active: AtomicPtr<EventStorage>,
}

impl StorageSlot {
    pub fn new() -> Self {
        StorageSlot {
            active: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn set(&self, storage: Option<&Arc<EventStorage>>) {
        let ptr = storage
            .map(|s| Arc::as_ptr(s) as *mut EventStorage)
            .unwrap_or(std::ptr::null_mut());
        self.active.store(ptr, Ordering::Release);
    }

    pub fn load(&self) -> *mut EventStorage {
        self.active.load(Ordering::Relaxed)
    }
}

thread_local! {
    static THREAD_SLOT: RefCell<Option<Arc<StorageSlot>>> = const { RefCell::new(None) };
}

/// Install the slot the current thread records through. Returns the
/// previous slot so fiber schedulers can restore it on detach.
pub(crate) fn install_thread_slot(slot: Option<Arc<StorageSlot>>) -> Option<Arc<StorageSlot>> {
    THREAD_SLOT.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), slot))
}

pub(crate) fn current_thread_slot() -> Option<Arc<StorageSlot>> {
    THREAD_SLOT.with(|cell| cell.borrow().clone())
}

/// Run `f` against the calling thread's active storage, or return `None`
/// when the thread is unregistered or no capture is running. This is the
/// null check that makes inactive annotations free.
pub(crate) fn with_active_storage<R>(f: impl FnOnce(&EventStorage) -> R) -> Option<R> {
    THREAD_SLOT.with(|cell| {
        let slot = cell.borrow();
        let slot = slot.as_ref()?;
        let ptr = slot.load();
        if ptr.is_null() {
            return None;
        }
        // The registry keeps the storage alive for as long as its slot can
        // still be loaded; slots are nulled before entries are reclaimed.
        Some(f(unsafe { &*ptr }))
    })
}

/// An in-flight scoped event. Not sendable: the finish timestamp must be
/// written by the thread that owns the storage the event lives in.
pub struct EventHandle {
    slot: EventSlot,
    _not_send: std::marker::PhantomData<*const ()>,
}

pub struct Event;

impl Event {
    /// Begin a scope. Returns `None` when the thread records nothing
    /// (unregistered, or no active capture).
    pub fn start(description: &'static EventDescription) -> Option<EventHandle> {
        with_active_storage(|storage| EventHandle {
            slot: storage.begin_event(description, clock::now()),
            _not_send: std::marker::PhantomData,
        })
    }

    /// Finish a scope started with [`Event::start`].
    pub fn stop(handle: EventHandle) {
        // Mirror the start-side gate: if the capture was deactivated while
        // the scope was open, the buffers are about to be reset and the
        // half-recorded event is abandoned rather than touched.
        with_active_storage(|_| unsafe {
            (*handle.slot.0).time.finish = clock::now();
        });
    }

    /// Record a complete event with externally measured timestamps into a
    /// specific storage (GPU queues, I/O sources).
    pub fn attach(
        storage: &mut StorageHandle,
        description: Option<&'static EventDescription>,
        start: i64,
        finish: i64,
    ) {
        storage.storage().add_event(description, start, finish);
    }

    /// Imperative begin; pairs with [`Event::pop`]. Nesting deeper than
    /// [`MAX_PUSH_POP_DEPTH`] is dropped.
    pub fn push(description: &'static EventDescription) {
        let start = clock::now();
        with_active_storage(|storage| storage.push_event(description, start));
    }

    /// Shared-description variant of [`Event::push`].
    pub fn push_name(name: &str) {
        if with_active_storage(|_| ()).is_none() {
            return;
        }
        if let Some(description) = EventDescription::create_shared(name) {
            Self::push(description);
        }
    }

    pub fn pop() {
        let finish = clock::now();
        with_active_storage(|storage| storage.pop_event(finish));
    }

    /// Push with an external timestamp into a specific storage.
    pub fn push_to(storage: &mut StorageHandle, description: &'static EventDescription, start: i64) {
        storage.storage().push_event(description, start);
    }

    pub fn pop_from(storage: &mut StorageHandle, finish: i64) {
        storage.storage().pop_event(finish);
    }
}

/// RAII scope: starts on construction, stops on drop.
pub struct ScopedEvent {
    handle: Option<EventHandle>,
}

impl ScopedEvent {
    pub fn new(description: &'static EventDescription) -> Self {
        ScopedEvent {
            handle: Event::start(description),
        }
    }
}

impl Drop for ScopedEvent {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            Event::stop(handle);
        }
    }
}

pub struct Tag;

impl Tag {
    pub fn attach_f32(description: &'static EventDescription, value: f32) {
        let tag = TagData::new(description, value);
        with_active_storage(|s| s.attach_tag(tag, |inner| &mut inner.tag_f32_buffer));
    }

    pub fn attach_i32(description: &'static EventDescription, value: i32) {
        let tag = TagData::new(description, value);
        with_active_storage(|s| s.attach_tag(tag, |inner| &mut inner.tag_i32_buffer));
    }

    pub fn attach_u32(description: &'static EventDescription, value: u32) {
        let tag = TagData::new(description, value);
        with_active_storage(|s| s.attach_tag(tag, |inner| &mut inner.tag_u32_buffer));
    }

    pub fn attach_u64(description: &'static EventDescription, value: u64) {
        let tag = TagData::new(description, value);
        with_active_storage(|s| s.attach_tag(tag, |inner| &mut inner.tag_u64_buffer));
    }

    pub fn attach_point(description: &'static EventDescription, value: Point) {
        let tag = TagData::new(description, value);
        with_active_storage(|s| s.attach_point_tag(tag));
    }

    pub fn attach_str(description: &'static EventDescription, value: &str) {
        let tag = TagData::new(description, ShortString::new(value));
        with_active_storage(|s| s.attach_tag(tag, |inner| &mut inner.tag_string_buffer));
    }
}

/// Exclusive handle to an "extra" storage registered for a non-thread
/// source. Appends go through `&mut self`, which upholds the single-writer
/// contract without a lock on the recording path.
pub struct StorageHandle {
    storage: Arc<EventStorage>,
}

impl StorageHandle {
    pub(crate) fn new(storage: Arc<EventStorage>) -> Self {
        StorageHandle { storage }
    }

    /// Unregistered placeholder used when the crate is compiled disabled.
    #[cfg(not(feature = "enabled"))]
    pub(crate) fn inert() -> Self {
        StorageHandle {
            storage: Arc::new(EventStorage::new(false)),
        }
    }

    pub(crate) fn storage(&self) -> &EventStorage {
        &self.storage
    }

    pub(crate) fn shared(&self) -> Arc<EventStorage> {
        Arc::clone(&self.storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::color;

    fn test_storage() -> (Arc<EventStorage>, Arc<StorageSlot>) {
        let storage = Arc::new(EventStorage::new(false));
        let slot = Arc::new(StorageSlot::new());
        slot.set(Some(&storage));
        (storage, slot)
    }

    fn desc(name: &'static str) -> &'static EventDescription {
        EventDescription::create(name, "event.rs", 1, color::NULL, 0).unwrap()
    }

    #[test]
    fn scoped_events_nest_lifo() {
        let (storage, slot) = test_storage();
        let previous = install_thread_slot(Some(slot));

        {
            let _outer = ScopedEvent::new(desc("outer"));
            {
                let _inner = ScopedEvent::new(desc("inner"));
            }
        }

        install_thread_slot(previous);

        let events: Vec<EventData> = unsafe { storage.reader().event_buffer.to_vec() };
        assert_eq!(events.len(), 2);
        let outer = events[0];
        let inner = events[1];
        assert!(outer.time.start <= inner.time.start);
        assert!(inner.time.finish <= outer.time.finish);
        assert!(outer.time.is_complete());
        assert!(inner.time.is_complete());
    }

    #[test]
    fn inactive_thread_records_nothing() {
        let previous = install_thread_slot(None);

        assert!(Event::start(desc("nothing")).is_none());
        Event::push(desc("nothing"));
        Event::pop();
        Tag::attach_u32(desc("tag"), 7);

        install_thread_slot(previous);
    }

    #[test]
    fn deactivated_slot_records_nothing() {
        let (storage, slot) = test_storage();
        slot.set(None);
        let previous = install_thread_slot(Some(slot));

        assert!(Event::start(desc("gated")).is_none());

        install_thread_slot(previous);
        assert_eq!(storage.event_count(), 0);
    }

    #[test]
    fn push_pop_fills_finish_in_reverse_order() {
        let (storage, slot) = test_storage();
        let previous = install_thread_slot(Some(slot));

        Event::push(desc("a"));
        Event::push(desc("b"));
        Event::pop();
        Event::pop();

        install_thread_slot(previous);

        let events: Vec<EventData> = unsafe { storage.reader().event_buffer.to_vec() };
        assert_eq!(events.len(), 2);
        assert!(events[0].time.is_complete());
        assert!(events[1].time.is_complete());
        assert!(events[1].time.finish <= events[0].time.finish);
    }

    #[test]
    fn push_overflow_drops_silently() {
        let (storage, slot) = test_storage();
        let previous = install_thread_slot(Some(slot));

        for _ in 0..MAX_PUSH_POP_DEPTH + 5 {
            Event::push(desc("deep"));
        }
        for _ in 0..MAX_PUSH_POP_DEPTH + 5 {
            Event::pop();
        }

        install_thread_slot(previous);
        assert_eq!(storage.event_count(), MAX_PUSH_POP_DEPTH);
        let events: Vec<EventData> = unsafe { storage.reader().event_buffer.to_vec() };
        assert!(events.iter().all(|e| e.time.is_complete()));
    }

    #[test]
    fn unmatched_pop_is_ignored() {
        let (storage, slot) = test_storage();
        let previous = install_thread_slot(Some(slot));
        Event::pop();
        install_thread_slot(previous);
        assert_eq!(storage.event_count(), 0);
    }

    #[test]
    fn short_string_truncates_with_nul() {
        let s = ShortString::new("0123456789012345678901234567890123456789");
        assert_eq!(s.as_str().len(), ShortString::CAPACITY - 1);
        let short = ShortString::new("hi");
        assert_eq!(short.as_str(), "hi");
        // Multi-byte characters are never split.
        let unicode = ShortString::new("ααααααααααααααααα");
        assert!(unicode.as_str().chars().all(|c| c == 'α'));
    }

    #[test]
    fn event_data_without_description_uses_sentinel() {
        let data = EventData {
            time: EventTime { start: 5, finish: 9 },
            description: None,
        };
        let mut out = OutputStream::new();
        data.encode(&mut out);

        let mut expected = OutputStream::new();
        expected.write_i64(5);
        expected.write_i64(9);
        expected.write_u32(INVALID_DESCRIPTION_INDEX);
        assert_eq!(out.as_bytes(), expected.as_bytes());
    }

    #[test]
    fn tag_encodes_timestamp_index_value() {
        let description = desc("tag-key");
        let tag = TagData {
            description,
            timestamp: 77,
            value: 5u32,
        };
        let mut out = OutputStream::new();
        tag.encode(&mut out);

        let mut expected = OutputStream::new();
        expected.write_i64(77);
        expected.write_u32(description.index);
        expected.write_u32(5);
        assert_eq!(out.as_bytes(), expected.as_bytes());
    }
}
