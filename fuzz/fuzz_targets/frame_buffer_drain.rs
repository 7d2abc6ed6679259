#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_runtime::FrameBuffer;

fuzz_target!(|data: &[u8]| {
    let split = data.first().map(|byte| *byte as usize).unwrap_or_default();
    let body = data.get(1..).unwrap_or_default();
    let split = split.min(body.len());

    let mut buffer = FrameBuffer::new();
    buffer.push(&body[..split]);
    let mut frames = buffer.drain_frames();
    buffer.push(&body[split..]);
    frames.extend(buffer.drain_frames());

    assert!(buffer.buffered_len() <= body.len());
    for frame in frames {
        let encoded = serde_json::to_vec(&frame).expect("drained frame re-encodes");
        assert!(!encoded.is_empty());
    }
    buffer.clear();
    assert!(!buffer.has_partial());
});
