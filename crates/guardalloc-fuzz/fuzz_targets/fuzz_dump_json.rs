#![no_main]
use guardalloc_core::HeapDump;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(dump) = HeapDump::from_json(text) {
        let _ = dump.to_human();
        let json = dump.to_json().expect("re-serialize");
        assert_eq!(HeapDump::from_json(&json).expect("re-parse"), dump);
    }
});
