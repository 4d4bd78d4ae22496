//! Benchmark utilities.

use kcache_core::{DeltaType, Header, Partition, Record, TopicConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct-looking keys from a fixed seed.
pub fn generate_keys(count: usize, len: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|_| (0..len).map(|_| rng.gen()).collect())
        .collect()
}

/// Segment sizes small enough to roll several times per benchmark.
pub fn bench_config() -> TopicConfig {
    TopicConfig::new()
        .segment_bytes(1024 * 1024)
        .segment_index_bytes(64 * 1024)
}

/// Creates a partition under `dir` holding one entry per key, each tagged
/// with a `type` header cycling through `kinds` values.
pub fn populated_partition(dir: &Path, keys: &[Vec<u8>], value_size: usize, kinds: usize) -> Partition {
    let mut partition = Partition::new(dir, "bench", 0, bench_config()).unwrap();
    let value = random_data(value_size);
    for (offset, key) in keys.iter().enumerate() {
        let headers = [Header::new("type", format!("kind-{}", offset % kinds.max(1)))];
        partition
            .write_entry(
                &Record::new(offset as i64, Some(key.as_slice()), Some(value.as_slice()))
                    .headers(&headers),
                None,
                DeltaType::None,
            )
            .unwrap();
    }
    partition
}
