// Rows per streamed read chunk
pub const BATCH_SIZE: usize = 1024 * 64;

pub(crate) const WRITE_BATCH_SIZE: usize = 4 * 1024 * 1024; // 4MB

// Raw bytes fetched per read before decoding
pub(crate) const READ_BATCH_SIZE: usize = 1024 * 1024; // 1MB

pub const DEFAULT_MEMORY_BUDGET: u64 = 1_000_000_000;

// Share of the memory budget an in-memory sort chunk may use
pub(crate) const MEMORY_HEADROOM: f64 = 0.75;

pub(crate) const TARGET_SORT_CHUNKS: u64 = 30;

// Sorted runs merged in one pass
pub const MERGE_FAN_IN: usize = 64;

pub mod configuration;
pub mod core;
