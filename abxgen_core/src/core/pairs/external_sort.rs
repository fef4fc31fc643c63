use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use stopwatch::Stopwatch;

use crate::{
    MEMORY_HEADROOM, MERGE_FAN_IN, TARGET_SORT_CHUNKS, WRITE_BATCH_SIZE,
    core::{
        error::{AbxError, Result},
        storage_providers::{
            dataset::{DatasetReader, DatasetWriter},
            file_sync::LocalStorageProvider,
            traits::StorageIO,
        },
        type_fitting::IntType,
    },
};

use super::temp_scope::TempScope;

/// Smallest I/O buffer a sort reader or writer is given.
const MIN_IO_BYTES: usize = 64;

/// How a sort spends its memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortPlan {
    /// Rows sorted in memory at once.
    pub chunk_rows: u64,
    /// Bytes each dataset reader or writer of the sort buffers.
    pub io_bytes: usize,
    /// Runs merged in one pass.
    pub fan_in: usize,
}

impl SortPlan {
    /// Picks the chunk size for `rows` items of `item_size` bytes under
    /// `budget` bytes: one chunk when everything fits, else about
    /// `TARGET_SORT_CHUNKS` chunks when they fit, else the largest chunk
    /// that fits.
    ///
    /// Chunks get `MEMORY_HEADROOM` of the budget. The I/O buffers share an
    /// eighth of the rest each, so reading and writing stay under the budget.
    pub fn for_budget(rows: u64, item_size: usize, budget: u64) -> SortPlan {
        let amount = rows as f64 * item_size as f64;
        let usable = MEMORY_HEADROOM * budget as f64;

        let chunk_rows = if amount <= usable {
            rows
        } else if amount / TARGET_SORT_CHUNKS as f64 <= usable {
            rows.div_ceil(TARGET_SORT_CHUNKS)
        } else {
            (usable / item_size.max(1) as f64) as u64
        };

        let io_bytes = ((budget as f64 - usable) / 8.0) as usize;

        SortPlan {
            chunk_rows: chunk_rows.max(1),
            io_bytes: io_bytes.clamp(MIN_IO_BYTES, WRITE_BATCH_SIZE),
            fan_in: MERGE_FAN_IN,
        }
    }

    pub fn nb_chunks(&self, rows: u64) -> u64 {
        rows.div_ceil(self.chunk_rows)
    }
}

/// Cursor over one sorted run.
struct RunCursor {
    reader: DatasetReader<LocalStorageProvider>,
    buffer: Vec<u64>,
    position: usize,
}

impl RunCursor {
    fn open(path: &Path, rows: usize) -> Result<RunCursor> {
        let io = LocalStorageProvider::open(path)
            .map_err(|e| AbxError::Resource(format!("cannot reopen sort run {}: {}", path.display(), e)))?;

        let mut reader = DatasetReader::new(io, rows)?;
        reader.set_batch_bytes(rows * reader.item_type().size());

        let mut cursor = RunCursor {
            reader,
            buffer: Vec::new(),
            position: 0,
        };
        cursor.refill()?;
        Ok(cursor)
    }

    fn refill(&mut self) -> Result<()> {
        self.reader.read_into(&mut self.buffer)?;
        self.position = 0;
        Ok(())
    }

    fn peek(&self) -> Option<u64> {
        self.buffer.get(self.position).copied()
    }

    fn advance(&mut self) -> Result<()> {
        self.position += 1;
        if self.position >= self.buffer.len() {
            self.refill()?;
        }
        Ok(())
    }
}

/// Sorts a single column dataset into `output`.
///
/// Chunks of `plan.chunk_rows` rows are sorted in memory and spilled as runs
/// under `temp`, then merged through a min-heap, at most `plan.fan_in` runs
/// at a time. A single chunk is written straight to the output. Returns the
/// rows written.
pub fn external_sort<S: StorageIO, T: StorageIO>(
    input: &mut DatasetReader<S>,
    output: &mut DatasetWriter<T>,
    plan: &SortPlan,
    temp: &TempScope,
) -> Result<u64> {
    if input.columns() != 1 || output.columns() != 1 {
        return Err(AbxError::InvalidData("external sort needs single column datasets".to_string()));
    }

    let stopwatch = Stopwatch::start_new();
    let rows = input.rows();
    let chunk_rows = plan.chunk_rows.min(usize::MAX as u64) as usize;
    let item_type = output.item_type();

    input.set_chunk_rows(chunk_rows);
    input.set_batch_bytes(plan.io_bytes);
    output.set_batch_bytes(plan.io_bytes)?;

    if rows <= plan.chunk_rows {
        let mut values = Vec::new();
        input.read_into(&mut values)?;
        values.sort_unstable();
        output.append(&values)?;
        debug!("Sorted {} rows in one chunk in {}ms", rows, stopwatch.elapsed_ms());
        return Ok(values.len() as u64);
    }

    let runs_scope = temp.child("runs")?;
    let mut runs = Vec::new();
    let mut next_run = 0;

    let mut values = Vec::new();
    while input.read_into(&mut values)? > 0 {
        values.sort_unstable();

        let (path, mut writer) = create_run(&runs_scope, next_run, item_type, plan.io_bytes)?;
        next_run += 1;
        writer.append(&values)?;
        writer.finish()?;
        runs.push(path);
    }
    drop(values);

    let nb_runs = runs.len();
    let memory = chunk_rows.saturating_mul(size_of::<u64>());
    let value_bytes = size_of::<u64>() + item_type.size();
    let fan_in = plan.fan_in.max(2);
    let mut passes = 1;

    while runs.len() > fan_in {
        let mut merged = Vec::with_capacity(runs.len().div_ceil(fan_in));

        for group in runs.chunks(fan_in) {
            let (path, mut writer) = create_run(&runs_scope, next_run, item_type, plan.io_bytes)?;
            next_run += 1;
            merge_runs(group, &mut writer, merge_rows(memory, group.len(), value_bytes))?;
            writer.finish()?;

            for run in group {
                fs::remove_file(run).map_err(|e| {
                    AbxError::Resource(format!("cannot remove sort run {}: {}", run.display(), e))
                })?;
            }

            merged.push(path);
        }

        runs = merged;
        passes += 1;
    }

    let written = merge_runs(&runs, output, merge_rows(memory, runs.len(), value_bytes))?;
    runs_scope.close()?;

    debug!(
        "Sorted {} rows in {} runs of {} rows, {} merge passes, in {}ms",
        rows,
        nb_runs,
        chunk_rows,
        passes,
        stopwatch.elapsed_ms()
    );

    Ok(written)
}

/// Rows per cursor so that `runs` cursors and the output buffer share
/// `memory` bytes.
fn merge_rows(memory: usize, runs: usize, value_bytes: usize) -> usize {
    (memory / ((runs + 1) * value_bytes)).max(1)
}

fn create_run(
    scope: &TempScope,
    id: usize,
    item_type: IntType,
    io_bytes: usize,
) -> Result<(PathBuf, DatasetWriter<LocalStorageProvider>)> {
    let name = format!("run_{}.ds", id);
    let io = LocalStorageProvider::create(scope.path(), &name)
        .map_err(|e| AbxError::Resource(format!("cannot create sort run {}: {}", name, e)))?;

    let mut writer = DatasetWriter::new(io, 1, item_type, 0)?;
    writer.set_batch_bytes(io_bytes)?;

    Ok((scope.path().join(name), writer))
}

/// K-way merge of sorted runs into `output`.
fn merge_runs<T: StorageIO>(runs: &[PathBuf], output: &mut DatasetWriter<T>, merge_rows: usize) -> Result<u64> {
    let mut cursors = Vec::with_capacity(runs.len());
    for path in runs {
        cursors.push(RunCursor::open(path, merge_rows)?);
    }

    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(cursors.len());
    for (run, cursor) in cursors.iter().enumerate() {
        if let Some(key) = cursor.peek() {
            heap.push(Reverse((key, run)));
        }
    }

    let mut out = Vec::with_capacity(merge_rows);
    let mut written = 0u64;

    while let Some(Reverse((key, run))) = heap.pop() {
        out.push(key);

        let cursor = &mut cursors[run];
        cursor.advance()?;
        if let Some(next) = cursor.peek() {
            heap.push(Reverse((next, run)));
        }

        if out.len() >= merge_rows {
            output.append(&out)?;
            written += out.len() as u64;
            out.clear();
        }
    }

    output.append(&out)?;
    written += out.len() as u64;

    Ok(written)
}
