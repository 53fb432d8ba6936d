//! Fuzz target for `transforms.json` parsing.
//!
//! Anything that parses must also select intrinsics without panicking.

#![no_main]

use autotrack::transforms::from_transforms_slice;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 10 * 1024 * 1024 {
        return;
    }

    if let Ok(transforms) = from_transforms_slice(data) {
        let _ = transforms.select_intrinsics(None);
        for frame in &transforms.frames {
            let _ = transforms.intrinsics_for(frame);
        }
    }
});
