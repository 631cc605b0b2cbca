#![no_main]

//! Fuzz target for trace extraction helpers.
//!
//! # Goal
//! Arbitrary remote addresses, query strings and header names must never
//! panic, and flattening must never produce duplicate names.

use libfuzzer_sys::fuzz_target;
use metlo_tower::trace::{canonical_header_name, flatten_query, split_host_port};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok((host, _port)) = split_host_port(text) {
        assert!(host.len() < text.len());
    }

    let params = flatten_query(text);
    for (i, p) in params.iter().enumerate() {
        assert!(params[i + 1..].iter().all(|q| q.name != p.name));
    }

    let canonical = canonical_header_name(text);
    assert_eq!(canonical.len(), text.len());
});
