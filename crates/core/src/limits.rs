//! Engine-wide limits and defaults
//!
//! Block sizes must be powers of two within `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`.
//! Chains deeper than `MAX_CHAIN_DEPTH` are rejected so that every backing
//! walk terminates even on a corrupted model.

/// Default allocation granularity (one sector)
pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// Smallest accepted block size
pub const MIN_BLOCK_SIZE: u64 = 512;

/// Largest accepted block size (2 MiB, the largest qcow2 cluster)
pub const MAX_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Default virtual size for newly provisioned images (100 MiB)
pub const DEFAULT_IMAGE_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum number of layers in one backing chain
pub const MAX_CHAIN_DEPTH: usize = 256;

/// Check that `block_size` is an accepted allocation granularity
pub fn is_valid_block_size(block_size: u64) -> bool {
    block_size.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
}
