#![no_main]

use bncs_client::packet::PacketReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&script, payload)) = data.split_first() else {
        return;
    };

    // The first byte picks the sequence of reads, two bits per field, so the
    // fuzzer explores every mix of field widths over the remaining bytes.
    let mut reader = PacketReader::new(0x00, payload);
    for step in 0..4 {
        let ok = match (script >> (step * 2)) & 0b11 {
            0 => reader.read_u8().is_ok(),
            1 => reader.read_u32().is_ok(),
            2 => reader.read_cstring().is_ok(),
            _ => reader.read_dword_code().is_ok(),
        };
        if !ok {
            break;
        }
    }
    let _ = reader.rest();
});
