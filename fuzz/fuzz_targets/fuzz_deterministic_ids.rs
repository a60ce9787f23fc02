//! Fuzz target for deterministic id derivation.
//!
//! Index entry ids and edge ids are pure functions of their inputs; they
//! must never panic and must stay stable for equal inputs.

#![no_main]

use federation_engine::model::{edge_id, index_entry_id};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (site, locator) = data;

    // Should never panic
    let id = index_entry_id(site, locator);
    assert_eq!(id, index_entry_id(site, locator));
    assert_eq!(id.len(), 64);

    // The separator keeps shifted splits of the same concatenation apart.
    if let Some(first) = locator.chars().next() {
        let split = first.len_utf8();
        let shifted_site = format!("{site}{}", &locator[..split]);
        assert_ne!(id, index_entry_id(&shifted_site, &locator[split..]));
    }

    let eid = edge_id(site);
    assert_eq!(eid, edge_id(site));
    assert!(eid.starts_with("edge-"));
});
