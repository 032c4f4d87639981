#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use tcmalloc_inspect_fuzzing::HeapModel;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // With probability of about 1/8, just use the default mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    // Decode the model from the data, or start from an empty heap if that
    // fails.
    let mut model = bincode::decode_from_slice::<HeapModel, _>(&data[..size], bincode_config())
        .map_or_else(|_decode_err| HeapModel::default(), |(model, _)| model);

    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);

    if session.mutate(&mut model).is_ok() {
        // Re-encode the mutated model back into `data`, dropping spans off
        // the end until it fits.
        loop {
            if let Ok(new_size) =
                bincode::encode_into_slice(&model, data, bincode_config())
            {
                return new_size;
            }
            if !model.pop() {
                break;
            }
        }
    }

    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Ok((model, _)) = bincode::decode_from_slice::<HeapModel, _>(data, bincode_config()) {
        if let Err(e) = model.check() {
            panic!("error: {e}");
        }
    }
});
