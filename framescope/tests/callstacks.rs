//! Callstack intake, packing, symbol resolution, and the dump messages
//! that carry them.

use std::sync::{Arc, Mutex};

use framescope::wire::{InputStream, ResponseType};
use framescope::{CallstackDesc, CaptureSink, Module, Symbol, SymbolEngine};

type Messages = Arc<Mutex<Vec<(ResponseType, Vec<u8>)>>>;

struct MemorySink(Messages);

impl CaptureSink for MemorySink {
    fn message(&mut self, ty: ResponseType, payload: &[u8]) {
        self.0.lock().unwrap().push((ty, payload.to_vec()));
    }
}

struct MockSymbols;

impl SymbolEngine for MockSymbols {
    fn symbol(&mut self, address: u64) -> Option<Symbol> {
        Some(Symbol {
            address,
            offset: 0,
            module: "game.bin".to_string(),
            file: format!("src/fn_{address:x}.rs"),
            function: format!("fn_{address:x}"),
            line: 10,
        })
    }

    fn modules(&mut self) -> Vec<Module> {
        vec![Module {
            path: "/opt/game/game.bin".to_string(),
            address: 0x1000,
            size: 0x9000,
        }]
    }
}

#[test]
fn callstacks_pack_resolve_and_dump() {
    framescope::install_symbol_engine(Box::new(MockSymbols));
    let _storage = framescope::register_storage("CallstackProbe", None, 0);

    let messages: Messages = Arc::new(Mutex::new(Vec::new()));
    framescope::set_capture_sink(Some(Box::new(MemorySink(Arc::clone(&messages)))));

    framescope::start_capture();
    framescope::next_frame();

    let core = framescope::Core::get();
    core.report_stack_walk(&CallstackDesc {
        thread_id: 42,
        timestamp: 9_000_000,
        stack: &[0xA000, 0xB000, 0xC000],
    });

    framescope::next_frame();
    framescope::dump_capture();
    framescope::next_frame();
    framescope::set_capture_sink(None);

    let messages = messages.lock().unwrap().clone();

    // The description board precedes the pack, and the pack precedes the
    // terminating NullFrame.
    let order: Vec<ResponseType> = messages.iter().map(|(ty, _)| *ty).collect();
    let board_at = order
        .iter()
        .position(|ty| *ty == ResponseType::CallstackDescriptionBoard)
        .expect("description board emitted");
    let pack_at = order
        .iter()
        .position(|ty| *ty == ResponseType::CallstackPack)
        .expect("callstack pack emitted");
    assert!(board_at < pack_at);
    assert_eq!(order.last(), Some(&ResponseType::NullFrame));

    // Board: modules, then resolved symbols for each distinct address.
    let mut input = InputStream::from_bytes(&messages[board_at].1);
    let _board_number = input.read_u32().unwrap();
    let module_count = input.read_u32().unwrap();
    assert_eq!(module_count, 1);
    assert_eq!(input.read_string().unwrap(), "/opt/game/game.bin");
    assert_eq!(input.read_u64().unwrap(), 0x1000);
    assert_eq!(input.read_u64().unwrap(), 0x9000);

    let symbol_count = input.read_u32().unwrap();
    assert_eq!(symbol_count, 3);
    let mut functions = Vec::new();
    for _ in 0..symbol_count {
        let _address = input.read_u64().unwrap();
        let _module = input.read_wide_string().unwrap();
        functions.push(input.read_wide_string().unwrap());
        let _file = input.read_wide_string().unwrap();
        assert_eq!(input.read_u32().unwrap(), 10);
    }
    assert!(functions.contains(&"fn_a000".to_string()));

    // Pack: [thread_id, timestamp, depth, leaf-first addresses].
    let mut input = InputStream::from_bytes(&messages[pack_at].1);
    let _board_number = input.read_u32().unwrap();
    let word_count = input.read_u32().unwrap();
    assert_eq!(word_count, 6);
    let words: Vec<u64> = (0..word_count)
        .map(|_| input.read_u64().unwrap())
        .collect();
    assert_eq!(words, vec![42, 9_000_000, 3, 0xC000, 0xB000, 0xA000]);

    // The pack drains on dump: an immediately following capture carries no
    // callstack messages.
    let messages: Messages = Arc::new(Mutex::new(Vec::new()));
    framescope::set_capture_sink(Some(Box::new(MemorySink(Arc::clone(&messages)))));
    framescope::start_capture();
    framescope::next_frame();
    framescope::next_frame();
    framescope::dump_capture();
    framescope::next_frame();
    framescope::set_capture_sink(None);
    let messages = messages.lock().unwrap().clone();
    assert!(messages
        .iter()
        .all(|(ty, _)| *ty != ResponseType::CallstackPack));
}
