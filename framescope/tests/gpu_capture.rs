//! End-to-end GPU profiling against a mock backend: query issue, the
//! frame-delay ring, readback, clock mapping, and the dump path that folds
//! GPU queues into the capture stream.

use std::sync::{Arc, Mutex};

use framescope::wire::{InputStream, ResponseType};
use framescope::{
    CaptureSink, ClockSynchronization, GpuBackend, GpuContext, GpuEvent, PresentStatistics,
    NUM_FRAMES_DELAY,
};

type Messages = Arc<Mutex<Vec<(ResponseType, Vec<u8>)>>>;

struct MemorySink(Messages);

impl CaptureSink for MemorySink {
    fn message(&mut self, ty: ResponseType, payload: &[u8]) {
        self.0.lock().unwrap().push((ty, payload.to_vec()));
    }
}

#[derive(Default)]
struct MockState {
    /// Raw "GPU" timestamps by query index; the mock samples the CPU clock
    /// at issue time, which an identity clock maps straight through.
    timestamps: std::collections::HashMap<u32, i64>,
    submitted_frames: Vec<u64>,
    present_count: u32,
}

struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl GpuBackend for MockBackend {
    fn name(&self) -> String {
        "Mock GPU".to_string()
    }

    fn node_count(&self) -> u32 {
        1
    }

    fn node_name(&self, _node_index: u32) -> String {
        "Mock GPU".to_string()
    }

    fn clock_synchronization(&mut self, _node_index: u32) -> ClockSynchronization {
        // Identity mapping: GPU ticks are CPU ticks.
        ClockSynchronization {
            frequency_cpu: framescope::high_precision_frequency(),
            frequency_gpu: framescope::high_precision_frequency(),
            timestamp_cpu: 0,
            timestamp_gpu: 0,
        }
    }

    fn issue_query(&mut self, _context: &GpuContext, query_index: u32) {
        self.state
            .lock()
            .unwrap()
            .timestamps
            .insert(query_index, framescope::high_precision_time());
    }

    fn submit_frame(&mut self, _node_index: u32, frame_number: u64, _ranges: &[(u32, u32)]) {
        self.state.lock().unwrap().submitted_frames.push(frame_number);
    }

    fn read_timestamps(
        &mut self,
        _node_index: u32,
        _frame_number: u64,
        range_start: u32,
        out: &mut [i64],
    ) -> bool {
        let state = self.state.lock().unwrap();
        for (offset, slot) in out.iter_mut().enumerate() {
            if let Some(ts) = state.timestamps.get(&(range_start + offset as u32)) {
                *slot = *ts;
            }
        }
        true
    }

    fn present_statistics(&mut self, _swap_chain: usize) -> Option<PresentStatistics> {
        let mut state = self.state.lock().unwrap();
        state.present_count += 1;
        Some(PresentStatistics {
            present_count: state.present_count,
            sync_time: framescope::high_precision_time(),
        })
    }
}

fn find_description_index(board_payload: &[u8], wanted: &str) -> Option<u32> {
    let mut input = InputStream::from_bytes(board_payload);
    let _board_number = input.read_u32().unwrap();
    let _frequency = input.read_i64().unwrap();
    let _origin = input.read_u64().unwrap();
    let _precision = input.read_u32().unwrap();
    let _slice = (input.read_i64().unwrap(), input.read_i64().unwrap());
    let thread_count = input.read_u32().unwrap();
    let mut gpu_storage_listed = false;
    for _ in 0..thread_count {
        input.read_u64().unwrap();
        input.read_u32().unwrap();
        let name = input.read_string().unwrap();
        if name == "Mock GPU [Graphics]" {
            gpu_storage_listed = true;
        }
        input.read_i32().unwrap();
        input.read_i32().unwrap();
        input.read_u32().unwrap();
    }
    assert!(gpu_storage_listed, "GPU queue storages are registered");
    let fiber_count = input.read_u32().unwrap();
    for _ in 0..fiber_count {
        input.read_u64().unwrap();
    }
    input.read_u32().unwrap(); // main thread index
    let description_count = input.read_u32().unwrap();
    let mut found = None;
    for index in 0..description_count {
        let name = input.read_string().unwrap();
        input.read_string().unwrap();
        input.read_u32().unwrap();
        input.read_u32().unwrap();
        input.read_u32().unwrap();
        input.read_f32().unwrap();
        input.read_u8().unwrap();
        if name == wanted && found.is_none() {
            found = Some(index);
        }
    }
    found
}

fn event_frames_with_description(
    messages: &[(ResponseType, Vec<u8>)],
    description_index: u32,
) -> usize {
    let mut count = 0;
    for (ty, payload) in messages {
        if *ty != ResponseType::EventFrame {
            continue;
        }
        let mut input = InputStream::from_bytes(payload);
        let _board = input.read_u32().unwrap();
        let _thread = input.read_i32().unwrap();
        let _fiber = input.read_i32().unwrap();
        let _root = (input.read_i64().unwrap(), input.read_i64().unwrap());
        for section in 0..2 {
            let events = input.read_u32().unwrap();
            for _ in 0..events {
                let start = input.read_i64().unwrap();
                let finish = input.read_i64().unwrap();
                let index = input.read_u32().unwrap();
                if index == description_index && section == 1 {
                    assert!(start > 0 && finish >= start, "GPU times resolved to CPU domain");
                    count += 1;
                }
            }
        }
    }
    count
}

#[test]
fn gpu_events_resolve_through_the_frame_delay_ring() {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = Arc::new(Mutex::new(MockState::default()));
    framescope::install_gpu_backend(Box::new(MockBackend {
        state: Arc::clone(&state),
    }));

    assert!(framescope::register_thread("Render"));
    let scope_description = framescope::EventDescription::create(
        "DrawTerrain",
        "gpu_capture.rs",
        1,
        framescope::color::NULL,
        0,
    )
    .unwrap();

    let messages: Messages = Arc::new(Mutex::new(Vec::new()));
    framescope::set_capture_sink(Some(Box::new(MemorySink(Arc::clone(&messages)))));

    framescope::start_capture();
    framescope::next_frame();

    // Run enough presents for the ring to wrap: queries from early frames
    // must be resolved while later frames are still in flight.
    for _ in 0..(NUM_FRAMES_DELAY * 3) {
        if let Some(handle) = GpuEvent::start(scope_description) {
            GpuEvent::stop(handle);
        }
        framescope::gpu_flip(0);
        framescope::next_frame();
    }

    framescope::dump_capture();
    framescope::next_frame();
    framescope::set_capture_sink(None);

    let messages = messages.lock().unwrap().clone();
    let board = messages
        .iter()
        .find(|(ty, _)| *ty == ResponseType::FrameDescriptionBoard)
        .map(|(_, payload)| payload.clone())
        .expect("board was dumped");

    // The backend saw every submitted frame in order.
    {
        let state = state.lock().unwrap();
        assert!(!state.submitted_frames.is_empty());
        assert!(state.submitted_frames.windows(2).all(|w| w[0] < w[1]));
    }

    // Scopes annotated through GpuEvent made it out with resolved times.
    let scope_index =
        find_description_index(&board, "DrawTerrain").expect("scope description on the board");
    assert!(event_frames_with_description(&messages, scope_index) > 0);

    // The profiler's own per-frame events did too.
    let frame_index =
        find_description_index(&board, "GPU Frame").expect("frame description on the board");
    assert!(event_frames_with_description(&messages, frame_index) > 0);

    // Consecutive presents produced VSync windows.
    let vsync_index =
        find_description_index(&board, "VSync").expect("vsync description on the board");
    assert!(event_frames_with_description(&messages, vsync_index) > 0);

    assert!(framescope::unregister_thread(false));
}
