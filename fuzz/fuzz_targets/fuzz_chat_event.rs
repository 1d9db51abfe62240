#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary server bytes must parse or fail cleanly, never panic.
    let _ = bncs_client::packet::ChatEventPacket::parse(data);
});
