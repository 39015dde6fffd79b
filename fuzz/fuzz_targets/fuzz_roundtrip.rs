#![no_main]
use libfuzzer_sys::fuzz_target;

use gguf_container::{ContainerReader, ContainerWriter, PayloadMode, ReadOptions};

fuzz_target!(|data: &[u8]| {
    let options = ReadOptions {
        max_alloc: 1 << 20,
        ..ReadOptions::default()
    };
    let Ok(first) = ContainerReader::new(options).read(data) else {
        return;
    };

    // Anything that decodes must encode, and the encoding must be stable.
    let bytes = ContainerWriter::new(PayloadMode::Full).write(&first);
    let second = ContainerReader::new(options)
        .read(&bytes)
        .expect("re-encoded container must decode");
    // Compare structure, not values: NaN metadata floats are not equal to themselves.
    assert_eq!(first.tensors(), second.tensors());
    assert_eq!(first.metadata().len(), second.metadata().len());
    assert_eq!(ContainerWriter::new(PayloadMode::Full).write(&second), bytes);
});
