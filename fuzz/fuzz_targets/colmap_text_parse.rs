//! Fuzz target for the text sparse-model decoders.

#![no_main]

use autotrack::model::fuzz_parse_model_text;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 10 * 1024 * 1024 {
        return;
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = fuzz_parse_model_text(text);
    }
});
