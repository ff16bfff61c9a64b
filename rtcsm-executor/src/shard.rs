//! Shard assignment.

/// Returns the shard a key is pinned to.
///
/// Assignment only depends on the key and the shard count, so an
/// execution always lands on the same worker.
pub fn shard_for(key: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    crc32c::crc32c(key.as_bytes()) as usize % shards
}
