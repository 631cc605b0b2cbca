#![no_main]

//! Fuzz target for the bounded response capture.
//!
//! # Goal
//! Whatever the chunking and budget:
//! - the client receives every byte, in order
//! - the capture is exactly the first `min(total, budget)` bytes
//! - the captured string never exceeds the budget
//! - the completion hook runs exactly once

use arbitrary::Arbitrary;
use bytes::Bytes;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use libfuzzer_sys::fuzz_target;
use metlo_tower::{CaptureBody, CaptureBuffer};
use std::sync::{Arc, Mutex};

#[derive(Debug, Arbitrary)]
struct Input {
    budget: u16,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(check(input));
});

async fn check(input: Input) {
    let budget = input.budget as usize;
    let expected: Vec<u8> = input.chunks.concat();

    let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = input
        .chunks
        .into_iter()
        .map(|c| Ok(Frame::data(Bytes::from(c))))
        .collect();
    let inner = StreamBody::new(futures_util::stream::iter(frames));

    let slot: Arc<Mutex<Vec<CaptureBuffer>>> = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&slot);
    let body = CaptureBody::observed(inner, budget, move |captured| {
        writer.lock().unwrap().push(captured);
    });

    let forwarded = body.collect().await.unwrap().to_bytes();
    assert_eq!(&forwarded[..], &expected[..]);

    let mut completed = slot.lock().unwrap();
    assert_eq!(completed.len(), 1);
    let captured = completed.pop().unwrap();
    let keep = expected.len().min(budget);
    assert_eq!(captured.as_bytes(), &expected[..keep]);
    assert!(captured.into_string().len() <= budget);
}
