#![no_main]

use guardian_core::crash::{ThresholdConfig, diagnose};
use guardian_core::crash_log::{LogRecord, parse_log, parse_record};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 64_000 {
        return;
    }

    let text = String::from_utf8_lossy(data);
    let parsed = parse_log(&text);

    let mut events = 0;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        if let Ok(LogRecord::Event(_)) = parse_record(line) {
            events += 1;
        }
    }
    assert_eq!(events, parsed.events.len());

    let now = parsed.events.last().map_or(0, |e| e.timestamp);
    let diag = diagnose(&parsed.events, now, &ThresholdConfig::default());
    assert!(diag.in_window as usize <= parsed.events.len());
});
