//! Low-overhead realtime instrumentation profiler core.
//!
//! An application links this library, annotates scopes with [`event!`] /
//! [`ScopedEvent`], tags frames of interest, and calls [`next_frame`] once
//! per frame. A GUI connects over TCP (port 31313 by default), starts and
//! stops captures, and receives the recorded timeline as a framed binary
//! stream (see the `framescope-wire` crate).
//!
//! Recording is wait-free on the hot path: one thread-local load, a null
//! check, and a bump append into a per-thread buffer. OS scheduler tracing,
//! GPU timestamping and symbol resolution plug in behind the
//! [`TraceProvider`], [`GpuBackend`] and [`SymbolEngine`] traits.
//!
//! Compiling with `default-features = false` turns the whole crate into
//! no-ops so shipping builds can keep the annotations in place.
//!
//! ```no_run
//! framescope::register_thread("Main");
//! loop {
//!     framescope::next_frame();
//!     framescope::event!("Update");
//!     // ...
//! }
//! ```

// The disabled configuration keeps all types available but never runs the
// recording machinery.
#![cfg_attr(not(feature = "enabled"), allow(dead_code))]

mod cell;
mod clock;
mod collector;
mod core;
mod description;
mod dump;
mod event;
mod gpu;
mod pool;
mod server;
mod symbols;
mod trace;

pub use crate::core::{
    is_thread_registered, AttachmentKind, CaptureState, Core, FiberHandle, FrameType, Mode,
    ProcessDescription, StateCallback, ThreadDescription, INVALID_THREAD_ID,
};
pub use crate::description::{color, BoardError, DescriptionBoard, EventDescription};
pub use crate::event::{
    Event, EventData, EventHandle, EventTime, Point, ScopedEvent, ShortString, StorageHandle, Tag,
    TagData, INVALID_TIMESTAMP, MAX_PUSH_POP_DEPTH,
};
pub use crate::gpu::{
    ClockSynchronization, GpuBackend, GpuContext, GpuEvent, GpuEventHandle, GpuQueueType,
    PresentStatistics, ScopedGpuEvent, GPU_QUEUE_COUNT, MAX_GPU_NODES, MAX_QUERIES_COUNT,
    NUM_FRAMES_DELAY,
};
pub use crate::pool::MemoryPool;
pub use crate::server::CaptureSink;
pub use crate::symbols::{Module, Symbol, SymbolEngine};
pub use crate::trace::{CallstackDesc, CaptureStatus, SwitchContextDesc, TraceProvider};

/// Re-export of the stream/framing crate, for [`CaptureSink`] consumers
/// that decode the messages they receive.
pub use framescope_wire as wire;

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;
}

/// Current timestamp of the profiler's monotonic clock, in ticks. External
/// timestamp sources ([`Event::attach`]) must measure with this clock.
pub fn high_precision_time() -> i64 {
    clock::now()
}

/// Ticks per second of [`high_precision_time`].
pub fn high_precision_frequency() -> i64 {
    clock::FREQUENCY
}

#[cfg(feature = "enabled")]
mod api {
    use super::*;

    /// Register the calling thread under `name`. Annotations on an
    /// unregistered thread are no-ops.
    pub fn register_thread(name: &str) -> bool {
        Core::get().register_thread(name)
    }

    /// End the calling thread's participation. During an active capture
    /// the entry is kept for post-mortem serialization.
    pub fn unregister_thread(keep_alive: bool) -> bool {
        Core::get().unregister_thread(keep_alive)
    }

    /// Create an extra storage for a non-thread source (GPU queue, I/O,
    /// engine subsystem). Feed it through [`Event::attach`].
    pub fn register_storage(name: &str, thread_id: Option<u64>, mask: u32) -> StorageHandle {
        Core::get().register_storage(name, thread_id, mask)
    }

    /// Register a fiber; the returned handle is what a fiber scheduler
    /// swaps on activation/deactivation.
    pub fn register_fiber(id: u64) -> FiberHandle {
        Core::get().register_fiber(id)
    }

    /// Install the capture-state hook.
    pub fn set_state_changed_callback(callback: StateCallback) {
        Core::get().set_state_changed_callback(callback);
    }

    /// Attach a key-value pair to the next capture dump.
    pub fn attach_summary(key: &str, value: &str) {
        Core::get().attach_summary(key, value);
    }

    /// Attach a file (screenshot, log, …) to the next capture dump.
    pub fn attach_file(kind: AttachmentKind, name: &str, data: &[u8]) -> bool {
        Core::get().attach_file(kind, name, data)
    }

    /// The frame tick: pumps the capture server and applies state
    /// transitions. The only mandatory call outside annotations. Returns
    /// the new frame number.
    pub fn next_frame() -> u32 {
        Core::get().next_frame()
    }

    /// Request a capture start at the next frame boundary.
    pub fn start_capture() {
        Core::get().start_capture();
    }

    /// Request a capture stop at the next frame boundary.
    pub fn stop_capture() {
        Core::get().stop_capture();
    }

    /// Request a stop-and-dump at the next frame boundary.
    pub fn dump_capture() {
        Core::get().dump_capture();
    }

    /// Install the OS scheduler/stackwalk tracer.
    pub fn install_tracer(tracer: Box<dyn TraceProvider>) {
        Core::get().install_tracer(tracer);
    }

    /// Install the address-to-symbol resolver used for callstack dumps.
    pub fn install_symbol_engine(engine: Box<dyn SymbolEngine>) {
        Core::get().install_symbol_engine(engine);
    }

    /// Install a graphics-API backend (D3D12, Vulkan, …).
    pub fn install_gpu_backend(backend: Box<dyn GpuBackend>) {
        Core::get().install_gpu_backend(backend);
    }

    /// Per-presentation GPU bookkeeping; call right before or after the
    /// swapchain present. `swap_chain` is an opaque backend handle.
    pub fn gpu_flip(swap_chain: usize) {
        Core::get().gpu_flip(swap_chain);
    }

    /// Point the calling thread's GPU annotations at a command buffer and
    /// node/queue. Returns the previous context so scopes can restore it.
    pub fn set_gpu_context(context: GpuContext) -> GpuContext {
        crate::event::with_active_storage(|storage| storage.set_gpu_context(context))
            .unwrap_or_default()
    }

    /// Current GPU context of the calling thread.
    pub fn gpu_context() -> GpuContext {
        crate::event::with_active_storage(|storage| storage.gpu_context()).unwrap_or_default()
    }

    /// Whether a capture is currently running.
    pub fn is_active() -> bool {
        Core::get().is_active()
    }

    /// The pre-registered frame marker description of the given kind.
    pub fn frame_description(frame: FrameType) -> Option<&'static EventDescription> {
        Core::get().frame_description(frame)
    }

    /// Install an in-process consumer of the capture stream (e.g. to save
    /// captures to a file); pass `None` to remove it.
    pub fn set_capture_sink(sink: Option<Box<dyn CaptureSink>>) {
        Core::get().set_capture_sink(sink);
    }
}

#[cfg(feature = "enabled")]
pub use api::*;

/// Inert stand-ins compiled when the `enabled` feature is off: every entry
/// point keeps its signature and does nothing.
#[cfg(not(feature = "enabled"))]
mod api {
    use super::*;

    pub fn register_thread(_name: &str) -> bool {
        false
    }

    pub fn unregister_thread(_keep_alive: bool) -> bool {
        false
    }

    pub fn register_storage(_name: &str, _thread_id: Option<u64>, _mask: u32) -> StorageHandle {
        StorageHandle::inert()
    }

    pub fn register_fiber(_id: u64) -> FiberHandle {
        FiberHandle::inert()
    }

    pub fn set_state_changed_callback(_callback: StateCallback) {}

    pub fn attach_summary(_key: &str, _value: &str) {}

    pub fn attach_file(_kind: AttachmentKind, _name: &str, _data: &[u8]) -> bool {
        false
    }

    pub fn next_frame() -> u32 {
        0
    }

    pub fn start_capture() {}

    pub fn stop_capture() {}

    pub fn dump_capture() {}

    pub fn install_tracer(_tracer: Box<dyn TraceProvider>) {}

    pub fn install_symbol_engine(_engine: Box<dyn SymbolEngine>) {}

    pub fn install_gpu_backend(_backend: Box<dyn GpuBackend>) {}

    pub fn gpu_flip(_swap_chain: usize) {}

    pub fn set_gpu_context(_context: GpuContext) -> GpuContext {
        GpuContext::default()
    }

    pub fn gpu_context() -> GpuContext {
        GpuContext::default()
    }

    pub fn is_active() -> bool {
        false
    }

    pub fn frame_description(_frame: FrameType) -> Option<&'static EventDescription> {
        None
    }

    pub fn set_capture_sink(_sink: Option<Box<dyn CaptureSink>>) {}
}

#[cfg(not(feature = "enabled"))]
pub use api::*;

/// Open a scoped event for the rest of the enclosing block. The
/// description is registered once per call site.
///
/// ```no_run
/// fn update_world() {
///     framescope::event!("UpdateWorld");
///     // measured until the end of the function
/// }
/// ```
#[cfg(feature = "enabled")]
#[macro_export]
macro_rules! event {
    ($name:expr) => {
        let _framescope_scope = {
            static DESC: $crate::__private::Lazy<Option<&'static $crate::EventDescription>> =
                $crate::__private::Lazy::new(|| {
                    $crate::EventDescription::create(
                        $name,
                        file!(),
                        line!(),
                        $crate::color::NULL,
                        0,
                    )
                });
            (*DESC).map($crate::ScopedEvent::new)
        };
    };
}

/// Like [`event!`], with a color: the scope also shows up in the capture's
/// category lanes.
#[cfg(feature = "enabled")]
#[macro_export]
macro_rules! category {
    ($name:expr, $color:expr) => {
        let _framescope_scope = {
            static DESC: $crate::__private::Lazy<Option<&'static $crate::EventDescription>> =
                $crate::__private::Lazy::new(|| {
                    $crate::EventDescription::create($name, file!(), line!(), $color, 0)
                });
            (*DESC).map($crate::ScopedEvent::new)
        };
    };
}

/// Open a scoped GPU event on the calling thread's current GPU context.
#[cfg(feature = "enabled")]
#[macro_export]
macro_rules! gpu_event {
    ($name:expr) => {
        let _framescope_gpu_scope = {
            static DESC: $crate::__private::Lazy<Option<&'static $crate::EventDescription>> =
                $crate::__private::Lazy::new(|| {
                    $crate::EventDescription::create(
                        $name,
                        file!(),
                        line!(),
                        $crate::color::NULL,
                        0,
                    )
                });
            (*DESC).map($crate::ScopedGpuEvent::new)
        };
    };
}

#[cfg(not(feature = "enabled"))]
#[macro_export]
macro_rules! event {
    ($name:expr) => {};
}

#[cfg(not(feature = "enabled"))]
#[macro_export]
macro_rules! category {
    ($name:expr, $color:expr) => {};
}

#[cfg(not(feature = "enabled"))]
#[macro_export]
macro_rules! gpu_event {
    ($name:expr) => {};
}
