//! Benchmark utilities.

use rand::Rng;

/// Generate random payload data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a batch of distinct string keys.
pub fn key_batch(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("key:{i}")).collect()
}
