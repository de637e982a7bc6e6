//! The capture core: thread/fiber registry, the capture state machine, the
//! frame tick, and the dump pass that streams everything out at stop.
//!
//! Lock order, outermost first: capture state → registry → GPU profiler →
//! server send. The recording hot path takes none of these.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use bitflags::bitflags;
use framescope_wire::{OutputStream, Request, ResponseType, StartRequest};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::clock;
use crate::collector::{CallstackCollector, SwitchContextCollector, SysCallCollector};
use crate::description::EventDescription;
use crate::dump::{event_order, pack_scopes, ScopeData};
use crate::event::{
    current_thread_slot, install_thread_slot, EventStorage, EventTime, StorageHandle, StorageSlot,
};
use crate::gpu::{GpuBackend, GpuProfiler};
use crate::server::{CaptureSink, Server};
use crate::symbols::SymbolEngine;
use crate::trace::{CallstackDesc, CaptureStatus, SwitchContextDesc, TraceProvider};

bitflags! {
    /// Capture mode word. Providers receive the whole word and consume the
    /// subset of bits they understand.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u32 {
        const INSTRUMENTATION_CATEGORIES = 1 << 0;
        const INSTRUMENTATION_EVENTS = 1 << 1;
        const SAMPLING = 1 << 2;
        const TAGS = 1 << 3;
        const AUTOSAMPLING = 1 << 4;
        const SWITCH_CONTEXT = 1 << 5;
        const IO = 1 << 6;
        const GPU = 1 << 7;
        const END_SCREENSHOT = 1 << 8;
        const SYS_CALLS = 1 << 10;
        const OTHER_PROCESSES = 1 << 11;
    }
}

impl Mode {
    pub const INSTRUMENTATION: Mode = Mode::INSTRUMENTATION_CATEGORIES
        .union(Mode::INSTRUMENTATION_EVENTS);

    pub fn default_capture() -> Mode {
        Mode::INSTRUMENTATION
            | Mode::TAGS
            | Mode::AUTOSAMPLING
            | Mode::SWITCH_CONTEXT
            | Mode::GPU
            | Mode::SYS_CALLS
            | Mode::OTHER_PROCESSES
    }
}

/// The capture state machine's states; also the value handed to the state
/// callback right before a transition is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    StartCapture,
    StopCapture,
    DumpCapture,
}

/// Returns false to delay the transition by one frame (e.g. to grab a
/// screenshot before the dump).
pub type StateCallback = Arc<dyn Fn(CaptureState) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Cpu = 0,
    Gpu = 1,
    Render = 2,
}

const FRAME_TYPE_COUNT: usize = 3;

/// Kind tag for a file attached to a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image = 0,
    Text = 1,
    Other = 2,
}

pub const INVALID_THREAD_ID: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct ThreadDescription {
    pub name: String,
    pub thread_id: u64,
    pub process_id: u32,
    pub max_depth: i32,
    pub priority: i32,
    pub mask: u32,
}

impl ThreadDescription {
    pub fn new(name: &str, thread_id: u64, process_id: u32) -> Self {
        ThreadDescription {
            name: name.to_string(),
            thread_id,
            process_id,
            max_depth: 1,
            priority: 0,
            mask: 0,
        }
    }

    fn encode(&self, out: &mut OutputStream) {
        out.write_u64(self.thread_id);
        out.write_u32(self.process_id);
        out.write_str(&self.name);
        out.write_i32(self.max_depth);
        out.write_i32(self.priority);
        out.write_u32(self.mask);
    }
}

#[derive(Debug, Clone)]
pub struct ProcessDescription {
    pub name: String,
    pub process_id: u32,
    pub unique_key: u64,
}

impl ProcessDescription {
    fn encode(&self, out: &mut OutputStream) {
        out.write_u32(self.process_id);
        out.write_str(&self.name);
        out.write_u64(self.unique_key);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FiberDescription {
    pub id: u64,
}

struct ThreadEntry {
    description: ThreadDescription,
    storage: Arc<EventStorage>,
    /// None for extra storages driven through a [`StorageHandle`].
    slot: Option<Arc<StorageSlot>>,
    is_alive: bool,
}

impl ThreadEntry {
    fn activate(&self, active: bool) {
        if !self.is_alive {
            return;
        }
        if active {
            self.storage.clear(true);
        }
        if let Some(slot) = &self.slot {
            slot.set(active.then_some(&self.storage));
        }
    }
}

struct FiberEntry {
    description: FiberDescription,
    storage: Arc<EventStorage>,
    slot: Arc<StorageSlot>,
}

impl FiberEntry {
    fn activate(&self, active: bool) {
        if active {
            self.storage.clear(true);
        }
        self.slot.set(active.then_some(&self.storage));
    }
}

#[derive(Default)]
struct Registry {
    threads: Vec<ThreadEntry>,
    fibers: Vec<FiberEntry>,
}

struct Attachment {
    kind: AttachmentKind,
    name: String,
    data: Vec<u8>,
}

struct CoreState {
    current: CaptureState,
    pending: CaptureState,
    is_active: bool,
    mode: Mode,
    board_number: u32,
    frames: Vec<EventTime>,
    summary: Vec<(String, String)>,
    attachments: Vec<Attachment>,
    process_descriptions: Vec<ProcessDescription>,
    thread_descriptions: Vec<ThreadDescription>,
    state_callback: Option<StateCallback>,
    progress_reported_ms: i64,
}

/// Scheduler handle for one registered fiber. The scheduler calls
/// [`attach`](FiberHandle::attach) when the fiber starts running on the
/// current thread and [`detach`](FiberHandle::detach) when it yields;
/// events recorded in between land in the fiber's own storage.
pub struct FiberHandle {
    slot: Arc<StorageSlot>,
    storage: Arc<EventStorage>,
    previous: Option<Arc<StorageSlot>>,
}

impl FiberHandle {
    /// Unregistered placeholder used when the crate is compiled disabled.
    #[cfg(not(feature = "enabled"))]
    pub(crate) fn inert() -> Self {
        FiberHandle {
            slot: Arc::new(StorageSlot::new()),
            storage: Arc::new(EventStorage::new(true)),
            previous: None,
        }
    }

    pub fn attach(&mut self) {
        if !self.slot.load().is_null() {
            self.storage.fiber_attach(clock::thread_id());
        }
        self.previous = install_thread_slot(Some(Arc::clone(&self.slot)));
    }

    pub fn detach(&mut self) {
        if !self.slot.load().is_null() {
            self.storage.fiber_detach();
        }
        install_thread_slot(self.previous.take());
    }
}

pub struct Core {
    state: Mutex<CoreState>,
    registry: Mutex<Registry>,
    /// Mirrors `CoreState::is_active` for lock-free reads on registration
    /// paths that must not take the state lock.
    active: AtomicBool,
    frame_number: AtomicU32,
    main_thread_id: u64,

    switch_contexts: SwitchContextCollector,
    syscalls: SysCallCollector,
    callstacks: CallstackCollector,

    gpu: GpuProfiler,
    tracer: Mutex<Option<Box<dyn TraceProvider>>>,
    symbol_engine: Mutex<Option<Box<dyn SymbolEngine>>>,

    server: Server,
    sink: Mutex<Option<Box<dyn CaptureSink>>>,

    frame_descriptions: [Option<&'static EventDescription>; FRAME_TYPE_COUNT],
}

static CORE: Lazy<Core> = Lazy::new(Core::new);

/// Milliseconds between "Capturing Frame N" progress reports.
const PROGRESS_INTERVAL_MS: i64 = 200;

impl Core {
    fn new() -> Self {
        Core {
            state: Mutex::new(CoreState {
                current: CaptureState::DumpCapture,
                pending: CaptureState::DumpCapture,
                is_active: false,
                mode: Mode::default_capture(),
                board_number: 0,
                frames: Vec::new(),
                summary: Vec::new(),
                attachments: Vec::new(),
                process_descriptions: Vec::new(),
                thread_descriptions: Vec::new(),
                state_callback: None,
                progress_reported_ms: 0,
            }),
            registry: Mutex::new(Registry::default()),
            active: AtomicBool::new(false),
            frame_number: AtomicU32::new(0),
            main_thread_id: clock::thread_id(),
            switch_contexts: SwitchContextCollector::default(),
            syscalls: SysCallCollector::default(),
            callstacks: CallstackCollector::default(),
            gpu: GpuProfiler::new(),
            tracer: Mutex::new(None),
            symbol_engine: Mutex::new(None),
            server: Server::start(),
            sink: Mutex::new(None),
            frame_descriptions: [
                EventDescription::create("CPU Frame", file!(), line!(), 0, 0),
                EventDescription::create("GPU Frame", file!(), line!(), 0, 0),
                EventDescription::create("Render Frame", file!(), line!(), 0, 0),
            ],
        }
    }

    /// The process-wide core, created lazily on first use. The first call
    /// should come from the main thread: the thread that creates the core
    /// is the one whose frame events anchor the dump time slice.
    pub fn get() -> &'static Core {
        &CORE
    }

    pub(crate) fn gpu(&self) -> &GpuProfiler {
        &self.gpu
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn current_frame(&self) -> u32 {
        self.frame_number.load(Ordering::Relaxed)
    }

    pub fn frame_description(&self, frame: FrameType) -> Option<&'static EventDescription> {
        self.frame_descriptions[frame as usize]
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server.port()
    }

    // ---- registration -----------------------------------------------------

    /// Register the calling thread. Re-registering a live thread id is a
    /// no-op that reports success.
    pub fn register_thread(&self, name: &str) -> bool {
        let description =
            ThreadDescription::new(name, clock::thread_id(), clock::process_id());
        let mut registry = self.registry.lock();
        if registry
            .threads
            .iter()
            .any(|t| t.is_alive && t.description.thread_id == description.thread_id)
        {
            return true;
        }

        let storage = Arc::new(EventStorage::new(false));
        let slot = Arc::new(StorageSlot::new());
        if self.is_active() {
            slot.set(Some(&storage));
        }
        install_thread_slot(Some(Arc::clone(&slot)));
        registry.threads.push(ThreadEntry {
            description,
            storage,
            slot: Some(slot),
            is_alive: true,
        });
        true
    }

    /// Unregister the calling thread. With `keep_alive` (or during an
    /// active capture) the entry stays behind for post-mortem serialization
    /// and is reclaimed after the next dump.
    pub fn unregister_thread(&self, keep_alive: bool) -> bool {
        let thread_id = clock::thread_id();
        install_thread_slot(None);

        let mut registry = self.registry.lock();
        let Some(position) = registry
            .threads
            .iter()
            .position(|t| t.is_alive && t.description.thread_id == thread_id)
        else {
            return false;
        };

        if let Some(slot) = &registry.threads[position].slot {
            slot.set(None);
        }
        if !self.is_active() && !keep_alive {
            registry.threads.remove(position);
        } else {
            registry.threads[position].is_alive = false;
        }
        true
    }

    /// Create an extra storage for a non-thread source (a GPU queue, an I/O
    /// subsystem). Events go in through the returned handle with externally
    /// measured timestamps.
    pub fn register_storage(&self, name: &str, thread_id: Option<u64>, mask: u32) -> StorageHandle {
        StorageHandle::new(self.register_storage_arc(name, thread_id, mask))
    }

    fn register_storage_arc(
        &self,
        name: &str,
        thread_id: Option<u64>,
        mask: u32,
    ) -> Arc<EventStorage> {
        let mut description = ThreadDescription::new(
            name,
            thread_id.unwrap_or(INVALID_THREAD_ID),
            clock::process_id(),
        );
        description.mask = mask;

        let storage = Arc::new(EventStorage::new(false));
        self.registry.lock().threads.push(ThreadEntry {
            description,
            storage: Arc::clone(&storage),
            slot: None,
            is_alive: true,
        });
        storage
    }

    /// Register a fiber. The returned handle is what a fiber-aware
    /// scheduler swaps on activation/deactivation.
    pub fn register_fiber(&self, id: u64) -> FiberHandle {
        let storage = Arc::new(EventStorage::new(true));
        let slot = Arc::new(StorageSlot::new());
        if self.is_active() {
            slot.set(Some(&storage));
        }
        self.registry.lock().fibers.push(FiberEntry {
            description: FiberDescription { id },
            storage: Arc::clone(&storage),
            slot: Arc::clone(&slot),
        });
        FiberHandle {
            slot,
            storage,
            previous: None,
        }
    }

    pub fn set_state_changed_callback(&self, callback: StateCallback) {
        self.state.lock().state_callback = Some(callback);
    }

    pub fn set_capture_sink(&self, sink: Option<Box<dyn CaptureSink>>) {
        *self.sink.lock() = sink;
    }

    // ---- collaborators ----------------------------------------------------

    pub fn install_tracer(&self, tracer: Box<dyn TraceProvider>) {
        *self.tracer.lock() = Some(tracer);
    }

    pub fn install_symbol_engine(&self, engine: Box<dyn SymbolEngine>) {
        *self.symbol_engine.lock() = Some(engine);
    }

    pub fn install_gpu_backend(&self, backend: Box<dyn GpuBackend>) {
        self.gpu.install(backend, |name| {
            Some(self.register_storage_arc(&name, None, 0))
        });
    }

    pub fn gpu_flip(&self, swap_chain: usize) {
        self.gpu.flip(swap_chain);
    }

    // ---- capture metadata -------------------------------------------------

    /// Attach a key-value pair to the next dump's summary.
    pub fn attach_summary(&self, key: &str, value: &str) {
        self.state
            .lock()
            .summary
            .push((key.to_string(), value.to_string()));
    }

    /// Attach a file (screenshot, log, …) to the next dump.
    pub fn attach_file(&self, kind: AttachmentKind, name: &str, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        self.state.lock().attachments.push(Attachment {
            kind,
            name: name.to_string(),
            data: data.to_vec(),
        });
        true
    }

    /// Record a process observed by the tracer but not owned by this
    /// library (serialized with the next board).
    pub fn report_process(&self, description: ProcessDescription) {
        self.state.lock().process_descriptions.push(description);
    }

    /// Record an external thread observed by the tracer.
    pub fn report_thread_description(&self, description: ThreadDescription) {
        self.state.lock().thread_descriptions.push(description);
    }

    // ---- trace intake (called from the tracer's collection thread) --------

    pub fn report_switch_context(&self, desc: SwitchContextDesc) {
        self.switch_contexts.add(desc);
    }

    pub fn report_stack_walk(&self, desc: &CallstackDesc) {
        self.callstacks.add(desc);
    }

    pub fn report_syscall_enter(&self, thread_id: u64, syscall_id: u64, timestamp: i64) {
        self.syscalls.enter(thread_id, syscall_id, timestamp);
    }

    pub fn report_syscall_exit(&self, thread_id: u64, timestamp: i64) {
        self.syscalls.exit(thread_id, timestamp);
    }

    // ---- capture control --------------------------------------------------

    pub fn start_capture(&self) {
        self.state.lock().pending = CaptureState::StartCapture;
    }

    pub fn stop_capture(&self) {
        self.state.lock().pending = CaptureState::StopCapture;
    }

    pub fn dump_capture(&self) {
        self.state.lock().pending = CaptureState::DumpCapture;
    }

    /// The frame tick; the one call an application must make outside of
    /// annotations. Pumps the server, applies pending state transitions at
    /// this well-defined boundary, and opens the next frame's time span.
    pub fn next_frame(&self) -> u32 {
        let mut state = self.state.lock();

        if state.is_active {
            if let Some(frame) = state.frames.last_mut() {
                frame.stop();
            }
            if clock::now_millis() > state.progress_reported_ms + PROGRESS_INTERVAL_MS {
                let message = format!("Capturing Frame {}", state.frames.len());
                self.report_progress(&mut state, &message);
            }
        }

        for request in self.server.update() {
            self.apply_request(&mut state, request);
        }

        loop {
            let Some(next) = Self::plan_transition(&state) else {
                break;
            };
            if let Some(callback) = state.state_callback.clone() {
                // The callback may call back into the library; drop the
                // state lock around it.
                drop(state);
                let approved = callback(next);
                state = self.state.lock();
                if !approved {
                    break;
                }
            }
            match next {
                CaptureState::StartCapture => self.activate(&mut state, true),
                CaptureState::StopCapture => self.activate(&mut state, false),
                CaptureState::DumpCapture => self.dump_frames(&mut state),
            }
            state.current = next;
        }

        if state.is_active {
            state.frames.push(EventTime::begin_now());
        }

        self.frame_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn plan_transition(state: &CoreState) -> Option<CaptureState> {
        if state.pending == state.current {
            return None;
        }
        // A dump request against a running capture stops it first; the dump
        // itself happens on the next loop iteration.
        if state.pending == CaptureState::DumpCapture
            && state.current == CaptureState::StartCapture
        {
            return Some(CaptureState::StopCapture);
        }
        Some(state.pending)
    }

    fn apply_request(&self, state: &mut CoreState, request: Request) {
        match request {
            Request::Start(start) => {
                self.apply_start_request(state, &start);
                state.pending = CaptureState::StartCapture;
            }
            Request::Stop => {
                state.pending = CaptureState::DumpCapture;
            }
            Request::TurnSampling(_) => {
                // Accepted for protocol compatibility.
            }
        }
    }

    fn apply_start_request(&self, state: &mut CoreState, start: &StartRequest) {
        let mode = Mode::from_bits_truncate(start.mode);
        state.mode = if mode.is_empty() {
            Mode::default_capture()
        } else {
            mode
        };

        if !start.password.is_empty() {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&start.password)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(password) => {
                    if let Some(tracer) = self.tracer.lock().as_mut() {
                        tracer.set_password(&password);
                    }
                }
                None => log::warn!("discarding malformed capture password"),
            }
        }
    }

    fn activate(&self, state: &mut CoreState, active: bool) {
        if state.is_active == active {
            return;
        }
        state.is_active = active;
        self.active.store(active, Ordering::Relaxed);

        let thread_ids: Vec<u64> = {
            let registry = self.registry.lock();
            for entry in &registry.threads {
                entry.activate(active);
            }
            for fiber in &registry.fibers {
                fiber.activate(active);
            }
            registry
                .threads
                .iter()
                .filter(|t| t.is_alive && t.description.thread_id != INVALID_THREAD_ID)
                .map(|t| t.description.thread_id)
                .collect()
        };

        if active {
            // Capture reset: collectors start this capture empty.
            self.switch_contexts.clear();
            self.syscalls.clear();
            self.callstacks.clear();

            let mut status = CaptureStatus::TracerFailed;
            if let Some(tracer) = self.tracer.lock().as_mut() {
                status = tracer.start(state.mode, &thread_ids);
                if status != CaptureStatus::Ok {
                    // Retry with the narrowest useful setup.
                    status = tracer.start(Mode::SWITCH_CONTEXT, &thread_ids);
                }
            }
            if status != CaptureStatus::Ok {
                log::warn!("scheduler tracer unavailable (status {:?})", status);
            }

            self.gpu.start(state.mode);
            self.send_handshake(status);
        } else {
            if let Some(tracer) = self.tracer.lock().as_mut() {
                tracer.stop();
            }
            self.gpu.stop(state.mode);
        }
    }

    // ---- dump pass --------------------------------------------------------

    fn dump_frames(&self, state: &mut CoreState) {
        let mut registry = self.registry.lock();
        if state.frames.is_empty() || registry.threads.is_empty() {
            return;
        }

        state.board_number += 1;

        self.report_progress(state, "Generating summary...");
        self.generate_common_summary(state);
        self.dump_summary(state);

        self.report_progress(state, "Collecting Frame Events...");

        let main_thread_index = registry
            .threads
            .iter()
            .position(|t| t.description.thread_id == self.main_thread_id)
            .unwrap_or(0);

        let mut time_slice = self.calculate_range(
            &registry.threads[main_thread_index],
            self.frame_descriptions[FrameType::Cpu as usize],
        );
        if time_slice.start >= time_slice.finish {
            time_slice = EventTime {
                start: state.frames.first().map(|f| f.start).unwrap_or(0),
                finish: state.frames.last().map(|f| f.finish).unwrap_or(0),
            };
        }

        self.dump_board(state, &registry, time_slice, main_thread_index as u32);

        // Fold the per-thread GPU buffers into the node/queue storages so
        // the thread loop below picks them up.
        let storages: Vec<Arc<EventStorage>> = registry
            .threads
            .iter()
            .map(|t| Arc::clone(&t.storage))
            .collect();
        self.gpu.dump(&storages);

        let board_number = state.board_number;
        for (index, entry) in registry.threads.iter().enumerate() {
            if entry.description.thread_id == INVALID_THREAD_ID {
                Self::sort_storage(&entry.storage);
            }
            self.dump_storage_events(board_number, &entry.storage, time_slice, index as i32, -1);
            self.dump_storage_tags(board_number, &entry.storage, index as i32);
        }

        for (index, fiber) in registry.fibers.iter().enumerate() {
            self.dump_storage_events(board_number, &fiber.storage, time_slice, -1, index as i32);
            self.dump_fiber_sync(board_number, &fiber.storage, index as i32);
        }

        state.frames.clear();
        registry.threads.retain(|t| t.is_alive);
        drop(registry);

        self.report_progress(state, "Serializing SwitchContexts");
        let mut payload = OutputStream::new();
        payload.write_u32(board_number);
        self.switch_contexts.serialize(&mut payload);
        self.send_response(ResponseType::SynchronizationData, &payload);

        self.report_progress(state, "Serializing SysCalls");
        let mut payload = OutputStream::new();
        payload.write_u32(board_number);
        self.syscalls.serialize(&mut payload);
        self.send_response(ResponseType::SyscallPack, &payload);

        if !self.callstacks.is_empty() {
            self.report_progress(state, "Resolving addresses... ");
            let mut payload = OutputStream::new();
            payload.write_u32(board_number);
            self.dump_callstack_board(&mut payload);
            self.send_response(ResponseType::CallstackDescriptionBoard, &payload);

            self.report_progress(state, "Serializing callstacks");
            let mut payload = OutputStream::new();
            payload.write_u32(board_number);
            self.callstacks.serialize(&mut payload);
            self.send_response(ResponseType::CallstackPack, &payload);
        }

        self.send_response(ResponseType::NullFrame, &OutputStream::new());
    }

    fn calculate_range(
        &self,
        entry: &ThreadEntry,
        root_description: Option<&'static EventDescription>,
    ) -> EventTime {
        let mut slice = EventTime {
            start: i64::MAX,
            finish: i64::MIN,
        };
        let Some(root_description) = root_description else {
            return slice;
        };
        // The capture is deactivated; the dump pass is the only accessor.
        let inner = unsafe { entry.storage.reader() };
        inner.event_buffer.for_each(|event| {
            if let Some(description) = event.description {
                if std::ptr::eq(description, root_description) {
                    slice.start = slice.start.min(event.time.start);
                    slice.finish = slice.finish.max(event.time.finish);
                }
            }
        });
        slice
    }

    fn sort_storage(storage: &EventStorage) {
        let events = {
            let inner = unsafe { storage.reader() };
            let mut events = inner.event_buffer.to_vec();
            events.sort_by(event_order);
            events
        };
        let inner = unsafe { storage.writer() };
        inner.event_buffer.clear(true);
        for event in events {
            inner.event_buffer.push(event);
        }
    }

    fn dump_storage_events(
        &self,
        board_number: u32,
        storage: &EventStorage,
        time_slice: EventTime,
        thread_number: i32,
        fiber_number: i32,
    ) {
        let events = {
            let inner = unsafe { storage.reader() };
            if inner.event_buffer.is_empty() {
                return;
            }
            inner.event_buffer.to_vec()
        };

        let mut scope = ScopeData::new(board_number, thread_number, fiber_number);
        pack_scopes(events, time_slice, &mut scope, |scope| {
            if scope.is_sleep_only() {
                return;
            }
            let mut payload = OutputStream::new();
            framescope_wire::Encode::encode(scope, &mut payload);
            self.send_response(ResponseType::EventFrame, &payload);
        });

        unsafe { storage.writer() }.event_buffer.clear(true);
    }

    fn dump_storage_tags(&self, board_number: u32, storage: &EventStorage, thread_number: i32) {
        let inner = unsafe { storage.reader() };
        let has_tags = !inner.tag_f32_buffer.is_empty()
            || !inner.tag_i32_buffer.is_empty()
            || !inner.tag_u32_buffer.is_empty()
            || !inner.tag_u64_buffer.is_empty()
            || !inner.tag_point_buffer.is_empty()
            || !inner.tag_string_buffer.is_empty();
        if !has_tags {
            return;
        }

        let mut payload = OutputStream::new();
        payload.write_u32(board_number);
        payload.write_i32(thread_number);
        payload.write_u32(0);
        framescope_wire::Encode::encode(&inner.tag_f32_buffer, &mut payload);
        framescope_wire::Encode::encode(&inner.tag_u32_buffer, &mut payload);
        framescope_wire::Encode::encode(&inner.tag_i32_buffer, &mut payload);
        framescope_wire::Encode::encode(&inner.tag_u64_buffer, &mut payload);
        framescope_wire::Encode::encode(&inner.tag_point_buffer, &mut payload);
        payload.write_u32(0);
        payload.write_u32(0);
        framescope_wire::Encode::encode(&inner.tag_string_buffer, &mut payload);
        self.send_response(ResponseType::TagsPack, &payload);

        storage.clear_tags(true);
    }

    fn dump_fiber_sync(&self, board_number: u32, storage: &EventStorage, fiber_number: i32) {
        let inner = unsafe { storage.reader() };
        if inner.fiber_sync_buffer.is_empty() {
            return;
        }
        let mut payload = OutputStream::new();
        payload.write_u32(board_number);
        payload.write_i32(fiber_number);
        framescope_wire::Encode::encode(&inner.fiber_sync_buffer, &mut payload);
        self.send_response(ResponseType::FiberSynchronizationData, &payload);

        unsafe { storage.writer() }.fiber_sync_buffer.clear(true);
    }

    fn dump_summary(&self, state: &mut CoreState) {
        let mut payload = OutputStream::new();
        payload.write_u32(state.board_number);

        payload.write_u32(state.frames.len() as u32);
        let frequency = clock::FREQUENCY as f64;
        for frame in &state.frames {
            let duration_ms = 1000.0 * (frame.finish - frame.start) as f64 / frequency;
            payload.write_f32(duration_ms as f32);
        }

        payload.write_u32(state.summary.len() as u32);
        for (key, value) in &state.summary {
            payload.write_str(key);
            payload.write_str(value);
        }
        state.summary.clear();

        payload.write_u32(state.attachments.len() as u32);
        for attachment in &state.attachments {
            payload.write_u32(attachment.kind as u32);
            payload.write_str(&attachment.name);
            payload.write_blob(&attachment.data);
        }
        state.attachments.clear();

        self.send_response(ResponseType::SummaryPack, &payload);
    }

    fn generate_common_summary(&self, state: &mut CoreState) {
        state
            .summary
            .push(("Platform".to_string(), clock::platform_name().to_string()));
        state.summary.push(("CPU".to_string(), clock::cpu_brand()));
        if let Some(gpu_name) = self.gpu.backend_name() {
            state.summary.push(("GPU".to_string(), gpu_name));
        }
    }

    fn dump_board(
        &self,
        state: &mut CoreState,
        registry: &Registry,
        time_slice: EventTime,
        main_thread_index: u32,
    ) {
        let mut payload = OutputStream::new();
        payload.write_u32(state.board_number);
        payload.write_i64(clock::FREQUENCY);
        payload.write_u64(0); // origin
        payload.write_u32(0); // precision
        framescope_wire::Encode::encode(&time_slice, &mut payload);

        payload.write_u32(registry.threads.len() as u32);
        for entry in &registry.threads {
            entry.description.encode(&mut payload);
        }
        payload.write_u32(registry.fibers.len() as u32);
        for fiber in &registry.fibers {
            payload.write_u64(fiber.description.id);
        }
        payload.write_u32(main_thread_index);

        crate::description::DescriptionBoard::global().encode(&mut payload);

        // Reserved sections kept for wire compatibility.
        payload.write_u32(0);
        payload.write_u32(0);
        payload.write_u32(0);
        payload.write_u32(0);

        payload.write_u32(state.mode.bits());

        payload.write_u32(state.process_descriptions.len() as u32);
        for process in &state.process_descriptions {
            process.encode(&mut payload);
        }
        payload.write_u32(state.thread_descriptions.len() as u32);
        for thread in &state.thread_descriptions {
            thread.encode(&mut payload);
        }

        payload.write_u32(clock::process_id());
        payload.write_u32(clock::cpu_count());
        self.send_response(ResponseType::FrameDescriptionBoard, &payload);

        state.process_descriptions.clear();
        state.thread_descriptions.clear();
    }

    fn dump_callstack_board(&self, payload: &mut OutputStream) {
        let mut engine = self.symbol_engine.lock();

        let modules = engine
            .as_mut()
            .map(|e| e.modules())
            .unwrap_or_default();
        payload.write_u32(modules.len() as u32);
        for module in &modules {
            framescope_wire::Encode::encode(module, payload);
        }

        let mut symbols = Vec::new();
        if let Some(engine) = engine.as_mut() {
            let mut addresses: Vec<u64> = self.callstacks.collect_addresses().into_iter().collect();
            addresses.sort_unstable();
            for address in addresses {
                if let Some(symbol) = engine.symbol(address) {
                    symbols.push(symbol);
                }
            }
        }
        payload.write_u32(symbols.len() as u32);
        for symbol in &symbols {
            framescope_wire::Encode::encode(symbol, payload);
        }
    }

    // ---- outgoing messages ------------------------------------------------

    fn send_handshake(&self, status: CaptureStatus) {
        let mut payload = OutputStream::new();
        payload.write_u32(status.code());
        payload.write_str(clock::platform_name());
        payload.write_str(&clock::hostname());
        self.send_response(ResponseType::Handshake, &payload);
    }

    fn report_progress(&self, state: &mut CoreState, message: &str) {
        state.progress_reported_ms = clock::now_millis();
        let mut payload = OutputStream::new();
        payload.write_str(message);
        self.send_response(ResponseType::ReportProgress, &payload);
    }

    fn send_response(&self, ty: ResponseType, payload: &OutputStream) {
        self.server.send(ty, payload.as_bytes());
        if let Some(sink) = self.sink.lock().as_mut() {
            sink.message(ty, payload.as_bytes());
        }
    }
}

/// True when the calling thread has any storage slot installed (registered
/// thread or attached fiber).
pub fn is_thread_registered() -> bool {
    current_thread_slot().is_some()
}
