//! Monotonic high-resolution time and process/thread identity.
//!
//! Every timestamp the profiler records, on every thread, comes from
//! [`now`]; GPU and kernel-trace timestamps are converted into this clock
//! before they are serialized, so the GUI sees a single time base.

/// Ticks per second of [`now`]. The clock counts nanoseconds.
pub const FREQUENCY: i64 = 1_000_000_000;

/// Current monotonic timestamp in ticks.
#[cfg(unix)]
pub fn now() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * FREQUENCY + ts.tv_nsec as i64
}

#[cfg(not(unix))]
pub fn now() -> i64 {
    use std::time::Instant;
    static ORIGIN: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    ORIGIN.elapsed().as_nanos() as i64
}

/// Wall-clock-ish milliseconds derived from the monotonic clock, used for
/// progress-report throttling only.
pub fn now_millis() -> i64 {
    now() / (FREQUENCY / 1000)
}

#[cfg(target_os = "linux")]
pub fn thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "macos")]
pub fn thread_id() -> u64 {
    let mut tid = 0u64;
    unsafe {
        libc::pthread_threadid_np(0, &mut tid);
    }
    tid
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn thread_id() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

pub fn process_id() -> u32 {
    std::process::id()
}

pub fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
pub fn cpu_brand() -> String {
    if let Ok(info) = std::fs::read_to_string("/proc/cpuinfo") {
        for line in info.lines() {
            if let Some(rest) = line.strip_prefix("model name") {
                if let Some((_, name)) = rest.split_once(':') {
                    return name.trim().to_string();
                }
            }
        }
    }
    "Unknown CPU".to_string()
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_brand() -> String {
    "Unknown CPU".to_string()
}

pub fn platform_name() -> &'static str {
    std::env::consts::OS
}

#[cfg(unix)]
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..len]) {
            return name.to_string();
        }
    }
    "localhost".to_string()
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    "localhost".to_string()
}
