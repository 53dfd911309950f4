#![no_main]

use blitnet::core::reader::NetworkReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Length-prefixed reads over garbage must fail cleanly
    let mut reader = NetworkReader::from_slice(data);
    let _ = reader.read_string();
    let _ = reader.read_blittable_vec::<u32>();
    let _ = reader.read_bytes_with_length();
    let _ = reader.read::<u16>();
});
