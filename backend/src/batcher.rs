//! Splits a submission's identifiers into bounded, order-preserving chunks.
//!
//! Chunk `i` holds `ids[i*K .. min((i+1)*K, N)]`. Nothing is dropped,
//! duplicated or reordered; concatenating the chunks yields the input.

/// Default maximum identifiers per unit.
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Returns `ceil(N / max_batch)` contiguous chunks of `ids`.
///
/// A `max_batch` of 0 is treated as 1. An empty input yields no chunks;
/// intake rejects empty submissions before getting here.
pub fn split_ids(ids: &[i64], max_batch: usize) -> Vec<Vec<i64>> {
    ids.chunks(max_batch.max(1)).map(<[i64]>::to_vec).collect()
}
