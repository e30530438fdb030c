#![no_main]

use libfuzzer_sys::fuzz_target;
use stride_proto::frame;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary byte slices into the frame parser: no input may cause
    // a panic, regardless of how malformed it is. Drive it the way a
    // session reader does, consuming the discard counts, so the resync
    // path is covered too.
    let mut offset = 0;
    while offset < data.len() {
        match frame::parse(&data[offset..]) {
            Ok(Some((_, consumed))) => offset += consumed,
            Ok(None) => break,
            Err((_, discard)) => offset += discard,
        }
    }
});
