#![no_main]
use libfuzzer_sys::fuzz_target;
use zklock::coordination::{parent_of, validate_path};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if validate_path(s).is_ok() {
            if let Some(parent) = parent_of(s) {
                assert!(validate_path(parent).is_ok());
            }
        }
    }
});
