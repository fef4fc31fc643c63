use std::path::PathBuf;

/// Run settings. Unset fields fall back to the crate defaults where they are
/// used.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// By-groups processed in parallel. Defaults to the available
    /// parallelism.
    pub concurrent_threads: Option<usize>,
    /// External sort budget in bytes, shared by the running groups.
    pub memory_budget: Option<u64>,
    pub read_chunk_rows: Option<usize>,
    /// Sampling seed, OS entropy when unset.
    pub seed: Option<u64>,
    /// Parent of the temporary directories, the output directory when unset.
    pub temp_location: Option<PathBuf>,
}

impl Configuration {
    pub fn concurrent_threads(&self) -> usize {
        self.concurrent_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget.unwrap_or(crate::DEFAULT_MEMORY_BUDGET)
    }

    pub fn read_chunk_rows(&self) -> usize {
        self.read_chunk_rows.unwrap_or(crate::BATCH_SIZE).max(1)
    }
}
