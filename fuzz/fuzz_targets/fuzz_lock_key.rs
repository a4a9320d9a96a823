#![no_main]
use libfuzzer_sys::fuzz_target;
use zklock::coordination::validate_path;
use zklock::models::validate_lock_key;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Any accepted key must form a valid node path under the root.
        if validate_lock_key(s).is_ok() {
            assert!(validate_path(&format!("/rootlock/{}", s)).is_ok());
        }
    }
});
