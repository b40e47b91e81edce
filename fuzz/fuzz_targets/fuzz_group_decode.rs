//! Fuzz target for decoding persisted group entries.
//!
//! Whatever is stored in a group row, decoding either fails cleanly or
//! yields a group whose chains all end at the cloud after a replan.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pipe_replication::group::Group;
use url::Url;

fuzz_target!(|entry: &str| {
    let Ok(mut group) = Group::decode("fuzz", entry) else {
        return;
    };
    let cloud = Url::parse("https://cloud.example.com/").unwrap();
    group.recompute_all(&cloud);

    for node in group.nodes() {
        assert_eq!(node.requested_to_follow.last(), Some(&cloud));
    }
    let encoded = group.encode().unwrap();
    assert_eq!(Group::decode("fuzz", &encoded).unwrap().len(), group.len());
});
