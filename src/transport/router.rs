//! Key to partition routing.

/// Murmur2 hash as used by the Kafka Java client's default partitioner.
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() == 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Stateless mapping from a routing key to a partition index.
///
/// Identical keys always land on the same partition for a given partition
/// count, and the placement agrees with a Kafka producer using the
/// `murmur2_random` partitioner.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionRouter;

impl PartitionRouter {
    pub fn new() -> Self {
        Self
    }

    /// Partition for `key` among `partitions` partitions.
    ///
    /// A partition count of zero routes everything to partition 0; streams are
    /// created with at least one partition, so that never names a real one.
    pub fn route(&self, key: &str, partitions: u32) -> u32 {
        (murmur2(key.as_bytes()) & 0x7fff_ffff)
            .checked_rem(partitions)
            .unwrap_or(0)
    }
}
