//! Fuzz target for pipe request and header parsing.
//!
//! Parsing runs on untrusted path, query and header values, so it must never
//! panic, and a request that parses must round-trip through its query.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pipe_replication::pipe::{parse_global_latest_offset, parse_retry_after, PipeState, ReadRequest};

fuzz_target!(|data: (&str, &str, &str)| {
    let (offset, types, location) = data;

    if let Ok(request) = ReadRequest::parse(offset, Some(types), Some(location)) {
        assert!(!request.location.is_empty());
        assert!(request.types.iter().all(|t| !t.is_empty() && !t.contains(',')));
        let query = request.query();
        assert_eq!(query.last().map(|(k, _)| *k), Some("location"));
    }

    let _ = parse_retry_after(Some(offset));
    let _ = parse_global_latest_offset(Some(types));
    let _ = PipeState::from_header(Some(location));
});
