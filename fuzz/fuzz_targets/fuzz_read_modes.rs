#![no_main]
use libfuzzer_sys::fuzz_target;

use gguf_container::{ContainerReader, ReadMode, ReadOptions};

fuzz_target!(|data: &[u8]| {
    // Keep allocations small so the fuzzer finds logic bugs, not OOMs.
    let limit = 1 << 20;
    for mode in [ReadMode::MetadataOnly, ReadMode::WithPayload, ReadMode::DictionaryOnly] {
        let mut reader = ContainerReader::new(ReadOptions { mode, max_alloc: limit });
        let container = match reader.read(data) {
            Ok(c) => c,
            Err(_) => continue,
        };

        for t in container.tensors() {
            let view = container.lookup_tensor(t.name()).unwrap();
            assert_eq!(view.byte_range.end - view.byte_range.start, t.size_bytes());
            if let Some(bytes) = container.tensor_data(t.name()) {
                assert_eq!(bytes.len() as u64, t.size_bytes());
            }
            let _ = container.read_as::<f32>(t.name());
        }
        for entry in container.metadata() {
            let _ = container.get_metadata(entry.key(), entry.tag());
        }
    }
});
