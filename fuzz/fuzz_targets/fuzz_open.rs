#![no_main]
use libfuzzer_sys::fuzz_target;
use std::io::Write;

use gguf_container::{ContainerReader, ReadMode, ReadOptions};

fuzz_target!(|data: &[u8]| {
    let mut tmp = tempfile::Builder::new()
        .suffix(".gguf")
        .tempfile()
        .unwrap();
    tmp.write_all(data).unwrap();
    tmp.flush().unwrap();

    let mut reader = ContainerReader::new(ReadOptions {
        mode: ReadMode::MetadataOnly,
        max_alloc: 1 << 20,
    });
    if let Ok(container) = reader.open(tmp.path()) {
        let _ = container.metadata_bytes();
    }
});
