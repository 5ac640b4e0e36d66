#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use segalloc_fuzzing::Ops;

/// Cap on the bytes a single input may keep live at once.
const ALLOCATION_LIMIT: usize = 4 << 20;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .ok()
        .map(|(ops, _)| ops)
}

/// Encode `ops` into `data`, dropping trailing ops until they fit. Returns the
/// encoded length, or `None` if not even an empty sequence fits.
fn encode_truncating(mut ops: Ops, data: &mut [u8]) -> Option<usize> {
    loop {
        if let Ok(len) = bincode::encode_into_slice(&ops, data, bincode_config()) {
            return Some(len);
        }
        if !ops.pop() {
            return None;
        }
    }
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave roughly one mutation in eight to libFuzzer's byte-level mutators,
    // and all of them when the input does not decode.
    let ops = match decode(&data[..size]) {
        Some(ops) if seed.count_ones() % 8 != 0 => ops,
        _ => return fuzzer_mutate(data, size, max_size),
    };

    let mut ops = ops;
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }

    encode_truncating(ops, &mut data[..max_size])
        .unwrap_or_else(|| fuzzer_mutate(data, size, max_size))
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = decode(data) else {
        return;
    };
    if let Err(e) = ops.run(ALLOCATION_LIMIT) {
        panic!("error: {e}");
    }
});
