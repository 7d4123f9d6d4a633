#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let checkpoint = match ptsafe::Checkpoint::from_bytes(data) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (_, view) in checkpoint.named_tensors() {
        let _ = checkpoint.materialize(view);
    }
});
