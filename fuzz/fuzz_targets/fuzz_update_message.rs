//! Fuzz target for update message decoding.
//!
//! Inbound federation messages come from other nodes over the bus; the
//! decoder must never panic on arbitrary bytes, only return a format error.

#![no_main]

use federation_engine::model::UpdateMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic
    let parsed = UpdateMessage::from_bytes(data);

    // Anything that decodes must re-encode and decode to the same message.
    if let Ok(message) = parsed {
        let bytes = message.to_bytes();
        let again = UpdateMessage::from_bytes(&bytes).expect("re-encode must decode");
        assert_eq!(again.site, message.site);
        assert_eq!(again.timestamp, message.timestamp);
        assert_eq!(again.added.len(), message.added.len());
        assert_eq!(again.removed.len(), message.removed.len());
    }
});
