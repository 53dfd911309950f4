#![no_main]

use blitnet::core::unbatcher::Unbatcher;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary streams fed in uneven chunks must never panic or grow past the limit
    let mut unbatcher = Unbatcher::new(1024);
    let step = usize::from(data.first().copied().unwrap_or(1)).max(1);
    for chunk in data.chunks(step) {
        unbatcher.enqueue(chunk);
        loop {
            match unbatcher.try_dequeue() {
                Ok(Some(frame)) => assert!(frame.len() + 4 <= 1024),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
