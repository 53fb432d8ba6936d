//! Fuzz target for the binary sparse-model decoders.
//!
//! The same bytes are fed to the camera, image and point decoders.

#![no_main]

use autotrack::model::fuzz_parse_model_bin;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 10 * 1024 * 1024 {
        return;
    }

    let _ = fuzz_parse_model_bin(data);
});
