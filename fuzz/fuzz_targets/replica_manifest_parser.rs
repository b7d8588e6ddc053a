#![no_main]

use std::path::Path;

use guardian_core::replica::ReplicaManifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 64_000 {
        return;
    }

    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(manifest) = ReplicaManifest::from_toml(text, Path::new("fuzz.toml")) {
        assert!(!manifest.paths.is_empty());
        assert!(manifest.paths.iter().all(|p| p.is_absolute()));
    }
});
