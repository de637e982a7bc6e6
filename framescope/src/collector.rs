//! Packed intake buffers for the records the trace provider delivers.
//!
//! All three collectors are written from the tracer's collection thread
//! only, with no internal locking; the dump pass reads them after the
//! tracer has been stopped.

use framescope_wire::{Encode, OutputStream};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::SingleWriterCell;
use crate::event::{EventData, EventTime, INVALID_TIMESTAMP};
use crate::pool::MemoryPool;
use crate::trace::{CallstackDesc, SwitchContextDesc};

impl Encode for SwitchContextDesc {
    fn encode(&self, out: &mut OutputStream) {
        out.write_i64(self.timestamp);
        out.write_u64(self.old_thread_id);
        out.write_u64(self.new_thread_id);
        out.write_u8(self.cpu_id);
        out.write_u8(self.reason);
    }
}

#[derive(Default)]
pub(crate) struct SwitchContextCollector {
    pool: SingleWriterCell<MemoryPool<SwitchContextDesc, 32768>>,
}

impl SwitchContextCollector {
    pub fn add(&self, desc: SwitchContextDesc) {
        unsafe { self.pool.writer() }.push(desc);
    }

    pub fn clear(&self) {
        unsafe { self.pool.writer() }.clear(false);
    }

    /// Append the pool to `out`; returns whether anything was written.
    /// Consumed records are dropped.
    pub fn serialize(&self, out: &mut OutputStream) -> bool {
        let pool = unsafe { self.pool.reader() };
        pool.encode(out);
        if pool.is_empty() {
            return false;
        }
        self.clear();
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SysCallData {
    pub event: EventData,
    pub thread_id: u64,
    pub id: u64,
}

impl Encode for SysCallData {
    fn encode(&self, out: &mut OutputStream) {
        self.event.encode(out);
        out.write_u64(self.thread_id);
        out.write_u64(self.id);
    }
}

/// Raw pointer to an open (enter-without-exit) syscall record; only the
/// collector's single writer dereferences it.
#[derive(Clone, Copy)]
struct SysCallSlot(*mut SysCallData);
unsafe impl Send for SysCallSlot {}

#[derive(Default)]
struct SysCallInner {
    pool: MemoryPool<SysCallData, 32768>,
    open: FxHashMap<u64, SysCallSlot>,
}

#[derive(Default)]
pub(crate) struct SysCallCollector {
    inner: SingleWriterCell<SysCallInner>,
}

impl SysCallCollector {
    pub fn enter(&self, thread_id: u64, syscall_id: u64, timestamp: i64) {
        let inner = unsafe { self.inner.writer() };
        let data = inner.pool.push(SysCallData {
            event: EventData {
                time: EventTime {
                    start: timestamp,
                    finish: INVALID_TIMESTAMP,
                },
                description: None,
            },
            thread_id,
            id: syscall_id,
        });
        inner.open.insert(thread_id, SysCallSlot(data as *mut SysCallData));
    }

    /// Close the thread's open syscall; an exit with no matching enter is
    /// discarded.
    pub fn exit(&self, thread_id: u64, timestamp: i64) {
        let inner = unsafe { self.inner.writer() };
        if let Some(slot) = inner.open.remove(&thread_id) {
            unsafe {
                (*slot.0).event.time.finish = timestamp;
            }
        }
    }

    pub fn clear(&self) {
        let inner = unsafe { self.inner.writer() };
        inner.pool.clear(false);
        inner.open.clear();
    }

    pub fn serialize(&self, out: &mut OutputStream) -> bool {
        let inner = unsafe { self.inner.reader() };
        inner.pool.encode(out);
        if inner.pool.is_empty() {
            return false;
        }
        self.clear();
        true
    }
}

pub(crate) const MAX_CALLSTACK_DEPTH: usize = 255;

/// Densely packed callstacks: `[thread_id, timestamp, depth, pc...]`
/// tuples, program counters stored leaf-first.
#[derive(Default)]
pub(crate) struct CallstackCollector {
    pool: SingleWriterCell<MemoryPool<u64, 32768>>,
}

impl CallstackCollector {
    pub fn add(&self, desc: &CallstackDesc) {
        let depth = desc.stack.len().min(MAX_CALLSTACK_DEPTH);
        let stack = &desc.stack[desc.stack.len() - depth..];
        let pool = unsafe { self.pool.writer() };

        if let Some(span) = pool.try_add_span(depth + 3) {
            span[0] = desc.thread_id;
            span[1] = desc.timestamp;
            span[2] = depth as u64;
            for (slot, pc) in span[3..].iter_mut().zip(stack.iter().rev()) {
                *slot = *pc;
            }
        } else {
            pool.push(desc.thread_id);
            pool.push(desc.timestamp);
            pool.push(depth as u64);
            for pc in stack.iter().rev() {
                pool.push(*pc);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        unsafe { self.pool.reader() }.is_empty()
    }

    pub fn clear(&self) {
        unsafe { self.pool.writer() }.clear(false);
    }

    /// Every distinct address referenced by the packed callstacks. A zero
    /// program counter marks a broken walk; the rest of that stack is not
    /// trusted for resolution.
    pub fn collect_addresses(&self) -> FxHashSet<u64> {
        let pool = unsafe { self.pool.reader() };
        let packed = pool.to_vec();
        let mut addresses = FxHashSet::default();

        let mut cursor = 0usize;
        while cursor + 3 <= packed.len() {
            let depth = (packed[cursor + 2] & 0xFF) as usize;
            cursor += 3;
            let mut broken = false;
            for offset in 0..depth {
                if cursor + offset >= packed.len() {
                    break;
                }
                let address = packed[cursor + offset];
                if address == 0 {
                    broken = true;
                }
                if !broken {
                    addresses.insert(address);
                }
            }
            cursor += depth;
        }
        addresses
    }

    pub fn serialize(&self, out: &mut OutputStream) -> bool {
        let pool = unsafe { self.pool.reader() };
        pool.encode(out);
        if pool.is_empty() {
            return false;
        }
        self.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CallstackDesc;
    use framescope_wire::InputStream;

    #[test]
    fn callstack_is_packed_leaf_first() {
        let collector = CallstackCollector::default();
        collector.add(&CallstackDesc {
            thread_id: 42,
            timestamp: 9_000_000,
            stack: &[0xA, 0xB, 0xC],
        });

        let packed = unsafe { collector.pool.reader() }.to_vec();
        assert_eq!(packed, vec![42, 9_000_000, 3, 0xC, 0xB, 0xA]);
    }

    #[test]
    fn callstack_depth_is_capped() {
        let collector = CallstackCollector::default();
        let deep: Vec<u64> = (1..=300).collect();
        collector.add(&CallstackDesc {
            thread_id: 1,
            timestamp: 2,
            stack: &deep,
        });

        let packed = unsafe { collector.pool.reader() }.to_vec();
        assert_eq!(packed[2], MAX_CALLSTACK_DEPTH as u64);
        assert_eq!(packed.len(), 3 + MAX_CALLSTACK_DEPTH);
        // Leaf-most frames survive the cap.
        assert_eq!(packed[3], 300);
    }

    #[test]
    fn address_collection_stops_at_broken_walks() {
        let collector = CallstackCollector::default();
        collector.add(&CallstackDesc {
            thread_id: 7,
            timestamp: 1,
            stack: &[0x30, 0, 0x10],
        });
        // Stored leaf-first: [0x10, 0, 0x30]; everything after the first
        // zero is untrusted.
        let addresses = collector.collect_addresses();
        assert!(addresses.contains(&0x10));
        assert!(!addresses.contains(&0x30));
        assert!(!addresses.contains(&0));
    }

    #[test]
    fn syscall_pairing_matches_enter_and_exit() {
        let collector = SysCallCollector::default();
        collector.enter(5, 1001, 100);
        collector.enter(6, 1002, 110);
        collector.exit(5, 150);
        collector.exit(99, 160); // unmatched, discarded

        let inner = unsafe { collector.inner.reader() };
        let records = inner.pool.to_vec();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].thread_id, 5);
        assert_eq!(records[0].event.time.finish, 150);
        assert_eq!(records[1].thread_id, 6);
        assert_eq!(records[1].event.time.finish, INVALID_TIMESTAMP);
    }

    #[test]
    fn switch_contexts_serialize_in_order_and_drain() {
        let collector = SwitchContextCollector::default();
        for i in 0..3i64 {
            collector.add(SwitchContextDesc {
                timestamp: i,
                old_thread_id: 10 + i as u64,
                new_thread_id: 20 + i as u64,
                cpu_id: i as u8,
                reason: 0,
            });
        }

        let mut out = OutputStream::new();
        assert!(collector.serialize(&mut out));

        let mut input = InputStream::from_bytes(out.as_bytes());
        assert_eq!(input.read_u32().unwrap(), 3);
        assert_eq!(input.read_i64().unwrap(), 0);
        assert_eq!(input.read_u64().unwrap(), 10);
        assert_eq!(input.read_u64().unwrap(), 20);

        // Serialization drained the pool.
        let mut again = OutputStream::new();
        assert!(!collector.serialize(&mut again));
    }
}
