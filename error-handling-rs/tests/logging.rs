//! Installs the global subscriber, so it runs in its own test binary.

use std::thread;

use error_handling_rs::{init_logging, LoggingConfig};

#[test]
fn test_init_logging_concurrent_and_repeated_calls() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let config = (i % 2 == 0).then(LoggingConfig::default);
                init_logging(config)
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
    assert!(init_logging(None).is_ok());
}
