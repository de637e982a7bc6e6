//! GPU timestamp profiling: query bookkeeping, frame-delayed readback, and
//! CPU↔GPU clock mapping.
//!
//! The graphics-API backends (D3D12, Vulkan, …) stay outside the core; they
//! implement [`GpuBackend`] and this module owns everything else — which
//! query index a scope got, which frame the query belongs to, when the
//! readback is safe to consume, and how a raw GPU tick becomes a CPU-domain
//! timestamp.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{Core, Mode};
use crate::description::EventDescription;
use crate::event::{with_active_storage, EventSlot, EventStorage};

pub const MAX_GPU_NODES: usize = 2;
pub const GPU_QUEUE_COUNT: usize = 4;
pub const MAX_FRAME_EVENTS: usize = 1024;
pub const NUM_FRAMES_DELAY: usize = 4;

/// Power of two that divides 2³², so the u32 query counter wraps without
/// disturbing the modulo mapping.
pub const MAX_QUERIES_COUNT: u32 = (2 * MAX_FRAME_EVENTS * NUM_FRAMES_DELAY) as u32;

const UNSET_QUERY_INDEX: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuQueueType {
    #[default]
    Graphics = 0,
    Compute = 1,
    Transfer = 2,
    VSync = 3,
}

impl GpuQueueType {
    pub const ALL: [GpuQueueType; GPU_QUEUE_COUNT] = [
        GpuQueueType::Graphics,
        GpuQueueType::Compute,
        GpuQueueType::Transfer,
        GpuQueueType::VSync,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GpuQueueType::Graphics => "Graphics",
            GpuQueueType::Compute => "Compute",
            GpuQueueType::Transfer => "Transfer",
            GpuQueueType::VSync => "VSync",
        }
    }
}

/// Where GPU annotations on the current thread land: which command buffer
/// receives the timestamp queries, and which node/queue buffer stores the
/// events. `command_buffer` is an opaque backend handle; 0 addresses the
/// profiler's own per-frame command list.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuContext {
    pub command_buffer: usize,
    pub queue: GpuQueueType,
    pub node: u32,
}

/// Linear mapping from GPU ticks to the profiler's CPU clock, captured by
/// the backend with one calibration query at capture start.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockSynchronization {
    pub frequency_cpu: i64,
    pub frequency_gpu: i64,
    pub timestamp_cpu: i64,
    pub timestamp_gpu: i64,
}

impl ClockSynchronization {
    pub fn gpu_to_cpu(&self, gpu_timestamp: i64) -> i64 {
        if self.frequency_gpu <= 0 || self.frequency_cpu <= 0 {
            return crate::event::INVALID_TIMESTAMP;
        }
        let delta = (gpu_timestamp - self.timestamp_gpu) as i128;
        let scaled = delta * self.frequency_cpu as i128 / self.frequency_gpu as i128;
        self.timestamp_cpu + scaled as i64
    }
}

/// Swapchain present statistics, already in the CPU clock domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresentStatistics {
    pub present_count: u32,
    pub sync_time: i64,
}

/// What a graphics-API integration must supply. Query heaps, readback
/// buffers, fences and command allocators all live behind this trait and
/// are released by the backend's own `Drop`.
pub trait GpuBackend: Send {
    /// Device name for the capture summary.
    fn name(&self) -> String;

    fn node_count(&self) -> u32;

    fn node_name(&self, node_index: u32) -> String;

    /// Issue one calibration query: paired CPU/GPU timestamps plus both
    /// clock frequencies.
    fn clock_synchronization(&mut self, node_index: u32) -> ClockSynchronization;

    /// Write a GPU timestamp for `query_index` on the command buffer named
    /// by `context` (`command_buffer == 0` means the profiler's internal
    /// frame command list).
    fn issue_query(&mut self, context: &GpuContext, query_index: u32);

    /// Close and submit the node's internal frame commands, resolving the
    /// listed `(start_index, count)` query ranges into the readback area,
    /// and arrange for `frame_number` to be signaled on completion.
    fn submit_frame(&mut self, node_index: u32, frame_number: u64, resolve_ranges: &[(u32, u32)]);

    /// Wait until `frame_number` is signaled, then copy `out.len()` raw GPU
    /// timestamps starting at query `range_start` out of the readback area.
    /// Returns false when the frame's queries never became ready; the
    /// caller drops the frame.
    fn read_timestamps(
        &mut self,
        node_index: u32,
        frame_number: u64,
        range_start: u32,
        out: &mut [i64],
    ) -> bool;

    fn present_statistics(&mut self, swap_chain: usize) -> Option<PresentStatistics>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuState {
    Off,
    Starting,
    Running,
}

/// CPU-side destination for one resolved query. Points at the start or
/// finish field of an event (or the timestamp of a frame tag) inside a GPU
/// storage pool; pool addresses are stable, and the pools recycle chunks
/// instead of freeing them, so a late write after a capture stop lands in
/// retained memory.
#[derive(Clone, Copy)]
struct TimestampTarget(*mut i64);
unsafe impl Send for TimestampTarget {}

impl Default for TimestampTarget {
    fn default() -> Self {
        TimestampTarget(std::ptr::null_mut())
    }
}

/// One in-flight frame's slice of the query index space.
#[derive(Default)]
struct QueryFrame {
    frame_event: Option<EventSlot>,
    query_index_start: u32,
    query_index_count: u32,
}

impl QueryFrame {
    fn reset(&mut self) {
        self.frame_event = None;
        self.query_index_start = UNSET_QUERY_INDEX;
        self.query_index_count = 0;
    }
}

struct GpuNode {
    name: String,
    /// Monotonic query counter; indices are used modulo MAX_QUERIES_COUNT.
    query_index: AtomicU32,
    targets: Vec<TimestampTarget>,
    gpu_timestamps: Vec<i64>,
    frames: [QueryFrame; NUM_FRAMES_DELAY],
    clock: ClockSynchronization,
    queue_storages: [Option<Arc<EventStorage>>; GPU_QUEUE_COUNT],
}

impl GpuNode {
    fn new(name: String) -> Self {
        let mut frames: [QueryFrame; NUM_FRAMES_DELAY] = Default::default();
        for frame in &mut frames {
            frame.reset();
        }
        GpuNode {
            name,
            query_index: AtomicU32::new(0),
            targets: vec![TimestampTarget::default(); MAX_QUERIES_COUNT as usize],
            gpu_timestamps: vec![0; MAX_QUERIES_COUNT as usize],
            frames,
            clock: ClockSynchronization::default(),
            queue_storages: Default::default(),
        }
    }
}

struct GpuInner {
    state: GpuState,
    frame_number: u64,
    current_node: usize,
    previous_present: PresentStatistics,
    nodes: Vec<GpuNode>,
    backend: Option<Box<dyn GpuBackend>>,
    frame_description: Option<&'static EventDescription>,
    vsync_description: Option<&'static EventDescription>,
    frame_tag_description: Option<&'static EventDescription>,
}

/// The core-owned half of GPU profiling. One per process, owned by `Core`.
pub(crate) struct GpuProfiler {
    inner: Mutex<GpuInner>,
}

impl GpuProfiler {
    pub fn new() -> Self {
        GpuProfiler {
            inner: Mutex::new(GpuInner {
                state: GpuState::Off,
                frame_number: 0,
                current_node: 0,
                previous_present: PresentStatistics::default(),
                nodes: Vec::new(),
                backend: None,
                frame_description: None,
                vsync_description: None,
                frame_tag_description: None,
            }),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.inner.lock().backend.is_some()
    }

    pub fn backend_name(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner.backend.as_ref().map(|b| b.name())
    }

    /// Install a backend and register one extra storage per node/queue so
    /// the dump pass picks GPU events up through the regular thread path.
    ///
    /// The storages are registered before the profiler mutex is taken;
    /// registry and GPU locks are never held simultaneously from here.
    pub fn install(
        &self,
        backend: Box<dyn GpuBackend>,
        mut register_storage: impl FnMut(String) -> Option<Arc<EventStorage>>,
    ) {
        if self.is_installed() {
            log::warn!("a GPU backend is already installed; ignoring {}", backend.name());
            return;
        }

        let node_count = (backend.node_count() as usize).min(MAX_GPU_NODES);
        let mut nodes = Vec::with_capacity(node_count);
        for node_index in 0..node_count {
            let mut node = GpuNode::new(backend.node_name(node_index as u32));
            for queue in GpuQueueType::ALL {
                let label = format!("{} [{}]", node.name, queue.name());
                node.queue_storages[queue as usize] = register_storage(label);
            }
            nodes.push(node);
        }

        let mut inner = self.inner.lock();
        if inner.backend.is_some() {
            return;
        }
        inner.nodes = nodes;
        inner.frame_description = Core::get().frame_description(crate::core::FrameType::Gpu);
        inner.vsync_description = EventDescription::create("VSync", file!(), line!(), 0, 0);
        inner.frame_tag_description = EventDescription::create_shared("Frame");
        inner.backend = Some(backend);
    }

    pub fn start(&self, _mode: Mode) {
        let mut inner = self.inner.lock();
        if inner.backend.is_none() {
            return;
        }
        let inner = &mut *inner;
        let backend = inner.backend.as_mut().expect("checked above");
        for (node_index, node) in inner.nodes.iter_mut().enumerate() {
            node.clock = backend.clock_synchronization(node_index as u32);
            for frame in &mut node.frames {
                frame.reset();
            }
        }
        inner.state = GpuState::Starting;
    }

    pub fn stop(&self, _mode: Mode) {
        let mut inner = self.inner.lock();
        inner.state = GpuState::Off;
    }

    /// Reserve a query index and point its resolved value at `target`.
    pub(crate) fn query_timestamp(&self, context: &GpuContext, target: *mut i64) {
        let mut inner = self.inner.lock();
        if inner.state != GpuState::Running {
            return;
        }
        let inner = &mut *inner;
        let Some(node) = inner.nodes.get_mut(context.node as usize) else {
            return;
        };
        let index = node.query_index.fetch_add(1, Ordering::Relaxed) % MAX_QUERIES_COUNT;
        node.targets[index as usize] = TimestampTarget(target);
        if let Some(backend) = inner.backend.as_mut() {
            backend.issue_query(context, index);
        }
    }

    /// Per-presentation bookkeeping; see the capture pipeline description
    /// on the module. May block waiting for the fence of the frame
    /// NUM_FRAMES_DELAY presents ago.
    pub fn flip(&self, swap_chain: usize) {
        let mut inner = self.inner.lock();
        if inner.backend.is_none() {
            return;
        }

        if inner.state == GpuState::Starting {
            inner.state = GpuState::Running;
        }

        if inner.state == GpuState::Running {
            self.flip_running(&mut inner, swap_chain);
        }

        inner.frame_number += 1;
    }

    fn flip_running(&self, inner: &mut GpuInner, swap_chain: usize) {
        let frame_number = inner.frame_number;
        let node_index = inner.current_node;
        let current_slot = (frame_number as usize) % NUM_FRAMES_DELAY;
        let next_slot = (frame_number as usize + 1) % NUM_FRAMES_DELAY;

        let frame_description = inner.frame_description;
        let tag_description = inner.frame_tag_description;
        let vsync_description = inner.vsync_description;

        let GpuInner {
            nodes,
            backend,
            previous_present,
            ..
        } = inner;
        let Some(node) = nodes.get_mut(node_index) else {
            return;
        };
        let Some(backend) = backend.as_mut() else {
            return;
        };

        let frame_context = GpuContext {
            command_buffer: 0,
            queue: GpuQueueType::Graphics,
            node: node_index as u32,
        };

        let issue = |node: &mut GpuNode, backend: &mut Box<dyn GpuBackend>, target: *mut i64| {
            let index = node.query_index.fetch_add(1, Ordering::Relaxed) % MAX_QUERIES_COUNT;
            node.targets[index as usize] = TimestampTarget(target);
            backend.issue_query(&frame_context, index);
        };

        // Close the frame event that has been running since the last flip.
        if let Some(slot) = node.frames[current_slot].frame_event {
            issue(node, backend, unsafe { &mut (*slot.0).time.finish });
        }

        // Open the "GPU Frame" event for the next frame, with a frame tag
        // carrying the CPU frame number.
        let graphics_storage = node.queue_storages[GpuQueueType::Graphics as usize].clone();
        let mut new_frame_event = None;
        if let (Some(storage), Some(description)) = (&graphics_storage, frame_description) {
            let slot = storage.begin_event(description, crate::event::INVALID_TIMESTAMP);
            issue(node, backend, unsafe { &mut (*slot.0).time.start });
            new_frame_event = Some(slot);
        }
        if let (Some(storage), Some(description)) = (&graphics_storage, tag_description) {
            let tag_timestamp = storage.begin_frame_tag(description, Core::get().current_frame());
            issue(node, backend, tag_timestamp);
        }
        node.frames[next_slot].frame_event = new_frame_event;

        // Queries issued since the previous flip belong to the current
        // frame; resolve them into the readback area, split when the index
        // window wraps.
        let query_begin = node.frames[current_slot].query_index_start;
        let query_end = node.query_index.load(Ordering::Relaxed);
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        if query_begin != UNSET_QUERY_INDEX {
            let count = query_end.wrapping_sub(query_begin);
            debug_assert!(count <= MAX_QUERIES_COUNT, "too many queries in one frame");
            node.frames[current_slot].query_index_count = count;

            if count > 0 {
                let start_index = query_begin % MAX_QUERIES_COUNT;
                let finish_index = query_end % MAX_QUERIES_COUNT;
                if start_index < finish_index {
                    ranges.push((start_index, count));
                } else {
                    ranges.push((start_index, MAX_QUERIES_COUNT - start_index));
                    if finish_index > 0 {
                        ranges.push((0, finish_index));
                    }
                }
            }
        }
        backend.submit_frame(node_index as u32, frame_number, &ranges);

        // The ring slot we are about to reuse still describes the frame
        // submitted NUM_FRAMES_DELAY - 1 presents ago; its queries should
        // have been signaled by now.
        let pending_start = node.frames[next_slot].query_index_start;
        let pending_count = node.frames[next_slot].query_index_count;
        if frame_number >= NUM_FRAMES_DELAY as u64 && pending_count > 0 {
            let wait_frame = frame_number + 1 - NUM_FRAMES_DELAY as u64;
            let resolve_start = pending_start % MAX_QUERIES_COUNT;
            let resolve_finish = resolve_start + pending_count;
            let first_count = resolve_finish.min(MAX_QUERIES_COUNT) - resolve_start;

            let mut ready = {
                let out = &mut node.gpu_timestamps
                    [resolve_start as usize..(resolve_start + first_count) as usize];
                backend.read_timestamps(node_index as u32, wait_frame, resolve_start, out)
            };
            if ready && resolve_finish > MAX_QUERIES_COUNT {
                let wrapped = resolve_finish - MAX_QUERIES_COUNT;
                let out = &mut node.gpu_timestamps[..wrapped as usize];
                ready = backend.read_timestamps(node_index as u32, wait_frame, 0, out);
            }

            if ready {
                for offset in 0..pending_count {
                    let index = ((resolve_start + offset) % MAX_QUERIES_COUNT) as usize;
                    let target = node.targets[index];
                    if !target.0.is_null() {
                        let cpu = node.clock.gpu_to_cpu(node.gpu_timestamps[index]);
                        unsafe {
                            *target.0 = cpu;
                        }
                    }
                }
            }
            // Not ready: the whole frame keeps INVALID_TIMESTAMP and the
            // dumper drops it.
        }

        node.frames[next_slot].query_index_start = query_end;
        node.frames[next_slot].query_index_count = 0;

        // VSync window between two consecutive presents.
        if let Some(current) = backend.present_statistics(swap_chain) {
            let previous = *previous_present;
            if previous.present_count.wrapping_add(1) == current.present_count {
                if let (Some(storage), Some(description)) = (
                    &node.queue_storages[GpuQueueType::VSync as usize],
                    vsync_description,
                ) {
                    storage.add_event(Some(description), previous.sync_time, current.sync_time);
                }
            }
            *previous_present = current;
        }
    }

    /// Collect the per-thread GPU buffers into the node/queue storages so
    /// the dump pass emits them alongside CPU threads.
    pub(crate) fn dump(&self, thread_storages: &[Arc<EventStorage>]) {
        let inner = self.inner.lock();
        for (node_index, node) in inner.nodes.iter().enumerate() {
            for queue in GpuQueueType::ALL {
                let Some(queue_storage) = &node.queue_storages[queue as usize] else {
                    continue;
                };
                for storage in thread_storages {
                    if std::ptr::eq(storage.as_ref(), queue_storage.as_ref()) {
                        continue;
                    }
                    // Writers are stopped at this point in the dump; both
                    // sides of the move are owned by the dump pass.
                    let source = unsafe { &storage.reader().gpu.buffers[node_index][queue as usize] };
                    source.for_each(|event| {
                        queue_storage.add_event(event.description, event.time.start, event.time.finish);
                    });
                }
            }
        }
    }
}

/// Handle to an in-flight GPU scope; the finish query is issued on stop.
pub struct GpuEventHandle {
    slot: EventSlot,
    context: GpuContext,
    _not_send: std::marker::PhantomData<*const ()>,
}

pub struct GpuEvent;

impl GpuEvent {
    /// Append a GPU event on the calling thread's current GPU context and
    /// issue its start timestamp query.
    pub fn start(description: &'static EventDescription) -> Option<GpuEventHandle> {
        let core = Core::get();
        if !core.gpu().is_installed() {
            return None;
        }
        with_active_storage(|storage| {
            storage.gpu_begin_event(description).map(|(slot, context)| {
                core.gpu()
                    .query_timestamp(&context, unsafe { &mut (*slot.0).time.start });
                GpuEventHandle {
                    slot,
                    context,
                    _not_send: std::marker::PhantomData,
                }
            })
        })
        .flatten()
    }

    pub fn stop(handle: GpuEventHandle) {
        let core = Core::get();
        core.gpu()
            .query_timestamp(&handle.context, unsafe { &mut (*handle.slot.0).time.finish });
    }
}

/// RAII wrapper for [`GpuEvent`].
pub struct ScopedGpuEvent {
    handle: Option<GpuEventHandle>,
}

impl ScopedGpuEvent {
    pub fn new(description: &'static EventDescription) -> Self {
        ScopedGpuEvent {
            handle: GpuEvent::start(description),
        }
    }
}

impl Drop for ScopedGpuEvent {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            GpuEvent::stop(handle);
        }
    }
}
