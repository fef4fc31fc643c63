pub mod block_index;
pub mod database;
pub mod error;
pub mod pairs;
pub mod sampling;
pub mod sideop;
pub mod stats;
pub mod storage_providers;
pub mod task;
pub mod triplets;
pub mod type_fitting;
