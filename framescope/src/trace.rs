//! The OS scheduler/stackwalk tracer contract.
//!
//! Kernel tracing itself (ETW, dtrace, perf) lives outside the core. A
//! backend implements [`TraceProvider`] for lifecycle control and feeds
//! records back through `Core::report_*` from its own collection thread.

use crate::core::Mode;

/// Outcome of starting the OS tracer, surfaced to the GUI exactly once in
/// the capture handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Ok = 0,
    TracerAlreadyExists = 1,
    TracerAccessDenied = 2,
    TracerFailed = 3,
    TracerInvalidPassword = 4,
}

impl CaptureStatus {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// One kernel context-switch record: `cpu_id` stopped running
/// `old_thread_id` and started running `new_thread_id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchContextDesc {
    pub timestamp: i64,
    pub old_thread_id: u64,
    pub new_thread_id: u64,
    pub cpu_id: u8,
    pub reason: u8,
}

/// One sampled callstack, ordered root → leaf as walked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallstackDesc<'a> {
    pub thread_id: u64,
    pub timestamp: u64,
    pub stack: &'a [u64],
}

/// Lifecycle surface of an OS tracer backend.
///
/// `start` receives the full capture mode word and the ids of the threads
/// registered with the profiler; each backend consumes the subset of mode
/// bits it understands. Record delivery happens out-of-band through the
/// core's report entry points.
pub trait TraceProvider: Send {
    fn start(&mut self, mode: Mode, thread_ids: &[u64]) -> CaptureStatus;

    fn stop(&mut self) -> bool;

    /// Credential for platforms that need elevation to open a kernel
    /// session. Already decoded; may be empty.
    fn set_password(&mut self, _password: &str) {}
}
