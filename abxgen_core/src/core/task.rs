use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::join_all;
use itertools::Itertools;
use log::{debug, error, info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use stopwatch::Stopwatch;
use tokio::sync::Semaphore;

use crate::{
    configuration::Configuration,
    core::{
        block_index::{BlockIndex, ColumnRef, SYNTHETIC_BY, resolve_attribute, resolve_attributes},
        database::{FeatureTable, ItemDatabase, ItemTable},
        error::{AbxError, Result},
        pairs::{SortPlan, TempScope, dedup_sorted, external_sort, extract_pairs, pair_key_type},
        sampling::{IncrementalSampler, sample_amount, seeded_rng},
        sideop::{
            filters::{FilterManager, Predicate},
            regressors::{RegressorFn, RegressorManager},
        },
        stats::{Stats, compute_nb_levels, compute_statistics},
        storage_providers::{
            dataset::{DatasetReader, DatasetWriter},
            store::DatasetStore,
            traits::StorageIO,
        },
        triplets::{Threshold, TripletGenerator},
        type_fitting::{IntType, fit_integer_type},
    },
};

pub const TRIPLETS: &str = "triplets";
pub const TRIPLETS_INDEX: &str = "triplets_index";
pub const REGRESSORS: &str = "regressors";
pub const RUNS: &str = "runs";
pub const UNIQUE_PAIRS: &str = "unique_pairs";
pub const UNIQUE_PAIRS_INDEX: &str = "unique_pairs_index";
pub const BY_KEYS: &str = "by_keys";
pub const FEATURES: &str = "features";

const PAIRS: &str = "pairs";
const SORTED_PAIRS: &str = "sorted_pairs";
const TEMP_PREFIX: &str = "abxgen-tmp";

/// A configured ABX task: the database, its on/across/by grouping, the
/// filters and regressors, and the statistics computed at construction.
pub struct Task {
    table: Arc<ItemTable>,
    features: FeatureTable,
    index: BlockIndex,
    filters: FilterManager,
    regressors: RegressorManager,
    stats: Stats,
}

impl Task {
    /// Builds a task with exact statistics.
    pub fn build(
        db: ItemDatabase,
        on: &str,
        across: &[String],
        by: &[String],
        filters: Vec<Arc<dyn Predicate>>,
        regressors: Vec<Arc<dyn RegressorFn>>,
    ) -> Result<Task> {
        Task::build_with(db, on, across, by, filters, regressors, false)
    }

    /// Builds a task. With `approximate`, filtered block counts are
    /// estimated with the unfiltered product and the task cannot sample.
    pub fn build_with(
        db: ItemDatabase,
        on: &str,
        across: &[String],
        by: &[String],
        filters: Vec<Arc<dyn Predicate>>,
        regressors: Vec<Arc<dyn RegressorFn>>,
        approximate: bool,
    ) -> Result<Task> {
        let stopwatch = Stopwatch::start_new();

        let ItemDatabase { attributes, features } = db;
        let table = Arc::new(attributes);

        let on = resolve_attribute(&table, on)?;
        let across = resolve_attributes(&table, across, ColumnRef::RowNumber)?;
        let by = resolve_attributes(&table, by, ColumnRef::Constant)?;

        check_roles(&table, on, &across, &by)?;

        let filters = FilterManager::new(filters);
        let regressors = RegressorManager::new(regressors)?;

        let index = BlockIndex::build(table.clone(), on, across, by, &filters)?;
        let stats = compute_statistics(&index, &filters, approximate)?;

        info!(
            "Built task on '{}' over {} items: {} by groups, {} blocks, {} triplets in {}ms",
            table.column(on).name,
            table.len(),
            stats.nb_by_levels,
            stats.nb_blocks,
            stats.nb_triplets,
            stopwatch.elapsed_ms()
        );

        Ok(Task {
            table,
            features,
            index,
            filters,
            regressors,
            stats,
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn table(&self) -> &ItemTable {
        &self.table
    }

    pub fn filters(&self) -> &FilterManager {
        &self.filters
    }

    pub fn regressors(&self) -> &RegressorManager {
        &self.regressors
    }

    /// Statistics under the requested counting mode.
    pub fn estimate_statistics(&self, approximate: bool) -> Result<Stats> {
        if !self.stats.approximate || approximate == self.stats.approximate_nb_triplets {
            return Ok(self.stats.clone());
        }

        compute_statistics(&self.index, &self.filters, approximate)
    }

    /// Fills the level combination counts of the task statistics and
    /// returns the total.
    pub fn compute_nb_levels(&mut self) -> Result<u64> {
        compute_nb_levels(&self.index, &self.filters, &mut self.stats)?;
        Ok(self.stats.nb_levels.unwrap_or(0))
    }
}

pub fn build(
    db: ItemDatabase,
    on: &str,
    across: &[String],
    by: &[String],
    filters: Vec<Arc<dyn Predicate>>,
    regressors: Vec<Arc<dyn RegressorFn>>,
) -> Result<Task> {
    Task::build(db, on, across, by, filters, regressors)
}

pub fn estimate_statistics(task: &Task, approximate: bool) -> Result<Stats> {
    task.estimate_statistics(approximate)
}

fn check_roles(table: &ItemTable, on: usize, across: &[ColumnRef], by: &[ColumnRef]) -> Result<()> {
    let on = ColumnRef::Column(on);
    let role_of = |column: &ColumnRef| -> u8 {
        u8::from(*column == on) + u8::from(across.contains(column)) + u8::from(by.contains(column))
    };

    for column in across.iter().chain(by.iter()).filter(|c| matches!(c, ColumnRef::Column(_))) {
        if role_of(column) > 1 {
            return Err(AbxError::Configuration(format!(
                "attribute '{}' has several roles among on, across and by",
                column.name(table, "")
            )));
        }
    }

    Ok(())
}

/// Output directory, sampling and capping of a [`generate`] run.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub output: PathBuf,
    /// Proportion below 1, triplet count otherwise.
    pub sample: Option<f64>,
    /// Triplets kept per regressor signature and block.
    pub threshold: Option<usize>,
    pub config: Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateSummary {
    pub output: PathBuf,
    pub nb_by_groups: usize,
    pub nb_triplets: u64,
    pub nb_unique_pairs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// No triplet survived; nothing was written.
    Empty,
    Written(GenerateSummary),
}

struct GroupJob {
    position: usize,
    sampler: Option<IncrementalSampler>,
    rng: StdRng,
    threshold: Option<usize>,
    memory_budget: u64,
    read_chunk_rows: usize,
    scope: TempScope,
}

struct GroupOutput {
    position: usize,
    scope: TempScope,
    nb_triplets: u64,
    nb_unique_pairs: u64,
    modulus: u64,
    index_type: IntType,
    key_type: IntType,
}

/// Generates the triplets, regressors and unique pairs of `task` into
/// `request.output`.
///
/// By-groups run on blocking workers, at most `concurrent_threads` at once,
/// each into its own temporary datasets. The non-empty groups are then
/// merged in group order. Temporary storage is removed on every exit path.
pub async fn generate(task: Arc<Task>, request: GenerateRequest) -> Result<GenerateOutcome> {
    let created = !request.output.exists();
    let result = generate_into(task, &request).await;

    if created && !matches!(result, Ok(GenerateOutcome::Written(_))) {
        // Only removes the directory when nothing is left in it.
        _ = fs::remove_dir(&request.output);
    }

    result
}

async fn generate_into(task: Arc<Task>, request: &GenerateRequest) -> Result<GenerateOutcome> {
    let stopwatch = Stopwatch::start_new();
    let stats = task.stats();

    if stats.nb_triplets == 0 {
        warn!("The task yields no triplets, nothing to write");
        return Ok(GenerateOutcome::Empty);
    }

    if request.sample.is_some() && stats.approximate_nb_triplets {
        return Err(AbxError::Configuration(
            "sampling needs exact triplet counts, build the task without approximation".to_string(),
        ));
    }

    let config = &request.config;
    let workers = config.concurrent_threads();
    let memory_budget = config.memory_budget() / workers as u64;
    let read_chunk_rows = config.read_chunk_rows();
    let mut rng = seeded_rng(config.seed);

    let nb_groups = task.index.groups.len();

    let samplers: Vec<Option<IncrementalSampler>> = match request.sample {
        Some(requested) => {
            let amount = sample_amount(requested, stats.nb_triplets)?;
            info!("Sampling {} of {} triplets", amount, stats.nb_triplets);

            let sampler = IncrementalSampler::new(stats.nb_triplets, amount, StdRng::seed_from_u64(rng.random()))?;
            let sizes: Vec<u64> = stats.by_stats.iter().map(|s| s.nb_triplets).collect();
            sampler.split(&sizes)?.into_iter().map(Some).collect()
        }
        None => (0..nb_groups).map(|_| None).collect(),
    };

    let temp_root = config.temp_location.clone().unwrap_or_else(|| request.output.clone());
    let temp = TempScope::new(&temp_root, TEMP_PREFIX)?;

    let mut jobs = Vec::with_capacity(nb_groups);
    for (position, sampler) in samplers.into_iter().enumerate() {
        jobs.push(GroupJob {
            position,
            sampler,
            rng: StdRng::seed_from_u64(rng.random()),
            threshold: request.threshold,
            memory_budget,
            read_chunk_rows,
            scope: temp.child(&format!("group-{}", position))?,
        });
    }

    debug!(
        "Processing {} by groups on {} workers, {} bytes of sort memory each",
        nb_groups, workers, memory_budget
    );

    let semaphore = Arc::new(Semaphore::new(workers));
    let mut handles = Vec::with_capacity(nb_groups);

    for job in jobs {
        let semaphore = semaphore.clone();
        let task = task.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| AbxError::Resource(format!("worker pool closed: {}", e)))?;

            tokio::task::spawn_blocking(move || process_group(&task, job))
                .await
                .map_err(|e| AbxError::Resource(format!("by group worker failed: {}", e)))?
        }));
    }

    let mut outputs = Vec::with_capacity(nb_groups);
    let mut failure = None;

    for joined in join_all(handles).await {
        let result = joined
            .map_err(|e| AbxError::Resource(format!("by group worker failed: {}", e)))
            .and_then(|result| result);

        match result {
            Ok(Some(output)) => outputs.push(output),
            Ok(None) => {}
            Err(e) => {
                error!("By group processing failed: {}", e);
                failure.get_or_insert(e);
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    if outputs.is_empty() {
        warn!("Every by group ended up empty, nothing to write");
        return Ok(GenerateOutcome::Empty);
    }

    let output = request.output.clone();
    let threshold = request.threshold.is_some();
    let merge_task = task.clone();

    let summary = tokio::task::spawn_blocking(move || merge_outputs(&merge_task, &output, threshold, read_chunk_rows, outputs))
        .await
        .map_err(|e| AbxError::Resource(format!("merge worker failed: {}", e)))??;

    if let Err(e) = temp.close() {
        warn!("{}", e);
    }

    info!(
        "Wrote {} triplets and {} unique pairs of {} by groups to {} in {}ms",
        summary.nb_triplets,
        summary.nb_unique_pairs,
        summary.nb_by_groups,
        summary.output.display(),
        stopwatch.elapsed_ms()
    );

    Ok(GenerateOutcome::Written(summary))
}

/// Triplets, regressors and unique pairs of one by-group, written under the
/// job's temporary directory. `None` when the group has no triplet.
fn process_group(task: &Task, mut job: GroupJob) -> Result<Option<GroupOutput>> {
    let stopwatch = Stopwatch::start_new();
    let group = &task.index.groups[job.position];
    let store = DatasetStore::open(job.scope.path())?;

    let generator = TripletGenerator::new(&task.index, &task.filters, &task.regressors);
    let outputs = task.regressors.outputs();
    let with_regressors = !outputs.is_empty() || job.threshold.is_some();
    let hint = task.stats.by_stats.get(job.position).map_or(0, |s| s.nb_triplets);

    let mut triplets = store.create_dataset("", TRIPLETS, hint, 3, group.index_type)?;
    let mut regressors = outputs
        .iter()
        .map(|o| store.create_dataset(REGRESSORS, &o.name, hint, o.width, o.item_type))
        .collect::<Result<Vec<_>>>()?;
    let mut runs = match job.threshold {
        Some(_) => Some(store.create_dataset(REGRESSORS, RUNS, 0, 1, IntType::U64)?),
        None => None,
    };

    let mut flat = Vec::new();

    for block in &group.blocks {
        if !generator.block_enabled(group, block)? {
            continue;
        }

        let threshold = job.threshold.map(|cap| Threshold { cap, rng: &mut job.rng });
        let generated = generator.on_across_triplets(group, block, with_regressors, job.sampler.as_mut(), threshold)?;

        if generated.is_empty() {
            continue;
        }

        let offset = triplets.rows();

        if let (Some(runs), Some(starts)) = (runs.as_mut(), generated.run_starts.as_ref()) {
            let shifted: Vec<u64> = starts.iter().map(|start| start + offset).collect();
            runs.append(&shifted)?;
        }

        flat.clear();
        flat.extend(generated.triplets.iter().flatten().map(|item| *item as u64));
        triplets.append(&flat)?;

        for (writer, named) in regressors.iter_mut().zip(generated.regressors.iter()) {
            writer.append(&named.values.to_bits())?;
        }
    }

    let nb_triplets = triplets.finish()?;
    for writer in regressors {
        writer.finish()?;
    }
    if let Some(runs) = runs {
        runs.finish()?;
    }

    if nb_triplets == 0 {
        debug!("By group {} has no triplet after filtering and sampling", group.id);
        return Ok(None);
    }

    let modulus = group.modulus();
    let key_type = pair_key_type(modulus)?;

    let mut input = store.open_dataset("", TRIPLETS, job.read_chunk_rows)?;
    let mut pairs = store.create_dataset("", PAIRS, nb_triplets * 2, 1, key_type)?;
    let nb_pairs = extract_pairs(&mut input, modulus, &mut pairs)?;
    pairs.finish()?;
    drop(input);

    let plan = SortPlan::for_budget(nb_pairs, size_of::<u64>(), job.memory_budget);
    let mut input = store.open_dataset("", PAIRS, job.read_chunk_rows)?;
    let mut sorted = store.create_dataset("", SORTED_PAIRS, 0, 1, key_type)?;
    external_sort(&mut input, &mut sorted, &plan, &job.scope)?;
    sorted.finish()?;
    drop(input);
    store.remove_dataset("", PAIRS)?;

    let mut input = store.open_dataset("", SORTED_PAIRS, job.read_chunk_rows)?;
    let mut unique = store.create_dataset("", UNIQUE_PAIRS, nb_pairs, 1, key_type)?;
    dedup_sorted(&mut input, &mut unique)?;
    let nb_unique_pairs = unique.finish()?;
    drop(input);
    store.remove_dataset("", SORTED_PAIRS)?;

    if let Some(usage) = memory_stats::memory_stats() {
        debug!(
            "By group {} done, physical memory {} MB, virtual memory {} MB",
            group.id,
            usage.physical_mem / (1024 * 1024),
            usage.virtual_mem / (1024 * 1024)
        );
    }

    info!(
        "By group {}: {} triplets, {} pairs, {} unique pairs in {} sort chunks, {}ms",
        group.id,
        nb_triplets,
        nb_pairs,
        nb_unique_pairs,
        plan.nb_chunks(nb_pairs),
        stopwatch.elapsed_ms()
    );

    Ok(Some(GroupOutput {
        position: job.position,
        scope: job.scope,
        nb_triplets,
        nb_unique_pairs,
        modulus,
        index_type: group.index_type,
        key_type,
    }))
}

fn copy_dataset<S: StorageIO, T: StorageIO>(
    input: &mut DatasetReader<S>,
    output: &mut DatasetWriter<T>,
    shift: u64,
) -> Result<u64> {
    let mut copied = 0u64;

    while let Some(mut chunk) = input.read()? {
        if shift != 0 {
            chunk.iter_mut().for_each(|value| *value += shift);
        }

        output.append(&chunk)?;
        copied += (chunk.len() / output.columns()) as u64;
    }

    Ok(copied)
}

/// Concatenates the group datasets in group order into the final layout.
fn merge_outputs(
    task: &Task,
    output: &Path,
    threshold: bool,
    read_chunk_rows: usize,
    groups: Vec<GroupOutput>,
) -> Result<GenerateSummary> {
    let stopwatch = Stopwatch::start_new();
    let store = DatasetStore::open(output)?;

    let nb_triplets: u64 = groups.iter().map(|g| g.nb_triplets).sum();
    let nb_unique_pairs: u64 = groups.iter().map(|g| g.nb_unique_pairs).sum();

    let triplet_type = groups.iter().map(|g| g.index_type).fold(IntType::U8, IntType::widest);
    let key_type = groups.iter().map(|g| g.key_type).fold(IntType::U8, IntType::widest);
    let largest_offset = groups
        .iter()
        .map(|g| g.modulus.max(task.index.groups[g.position].id as u64))
        .fold(nb_triplets.max(nb_unique_pairs), u64::max);
    let offset_type = fit_integer_type(largest_offset, false);

    let outputs = task.regressors.outputs();
    let nb_groups = groups.len() as u64;

    let mut triplets = store.create_dataset("", TRIPLETS, nb_triplets, 3, triplet_type)?;
    let mut triplets_index = store.create_dataset("", TRIPLETS_INDEX, nb_groups, 3, offset_type)?;
    let mut regressors = outputs
        .iter()
        .map(|o| store.create_dataset(REGRESSORS, &o.name, nb_triplets, o.width, o.item_type))
        .collect::<Result<Vec<_>>>()?;
    let mut runs = if threshold {
        Some(store.create_dataset(REGRESSORS, RUNS, 0, 1, fit_integer_type(nb_triplets, false))?)
    } else {
        None
    };
    let mut unique_pairs = store.create_dataset("", UNIQUE_PAIRS, nb_unique_pairs, 1, key_type)?;
    let mut pairs_index = store.create_dataset("", UNIQUE_PAIRS_INDEX, nb_groups, 4, offset_type)?;

    let mut by_keys = Vec::with_capacity(groups.len());

    for group_output in &groups {
        let group = &task.index.groups[group_output.position];
        let source = DatasetStore::open(group_output.scope.path())?;
        let by_id = group.id as u64;

        let start = triplets.rows();
        copy_dataset(&mut source.open_dataset("", TRIPLETS, read_chunk_rows)?, &mut triplets, 0)?;
        triplets_index.append(&[by_id, start, triplets.rows()])?;

        for (writer, regressor) in regressors.iter_mut().zip(outputs.iter()) {
            copy_dataset(&mut source.open_dataset(REGRESSORS, &regressor.name, read_chunk_rows)?, writer, 0)?;
        }

        if let Some(runs) = runs.as_mut() {
            copy_dataset(&mut source.open_dataset(REGRESSORS, RUNS, read_chunk_rows)?, runs, start)?;
        }

        let pair_start = unique_pairs.rows();
        copy_dataset(&mut source.open_dataset("", UNIQUE_PAIRS, read_chunk_rows)?, &mut unique_pairs, 0)?;
        pairs_index.append(&[by_id, group_output.modulus, pair_start, unique_pairs.rows()])?;

        by_keys.push(
            std::iter::once(group.id.to_string())
                .chain(group.key_values.iter().cloned())
                .collect_vec(),
        );

        if !task.features.names.is_empty() {
            let features = task.features.select(group.view.global_rows());
            store.write_table(FEATURES, &group.id.to_string(), &features.names, &features.rows)?;
        }
    }

    triplets.finish()?;
    triplets_index.finish()?;
    for writer in regressors {
        writer.finish()?;
    }
    if let Some(runs) = runs {
        runs.finish()?;
    }
    unique_pairs.finish()?;
    pairs_index.finish()?;

    let header = std::iter::once("by_id".to_string())
        .chain(task.index.by.iter().map(|c| c.name(&task.table, SYNTHETIC_BY).to_string()))
        .collect_vec();
    store.write_table("", BY_KEYS, &header, &by_keys)?;

    debug!("Merged {} by groups in {}ms", groups.len(), stopwatch.elapsed_ms());

    Ok(GenerateSummary {
        output: output.to_path_buf(),
        nb_by_groups: groups.len(),
        nb_triplets,
        nb_unique_pairs,
    })
}

#[cfg(test)]
mod tests {
    use temp_testdir::TempDir;

    use super::*;

    fn rows(values: &[&[&str]]) -> Vec<Vec<String>> {
        values
            .iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect()
    }

    fn database() -> ItemDatabase {
        ItemDatabase::from_rows(
            &["phone", "talker"],
            &rows(&[&["a", "t1"], &["a", "t2"], &["b", "t1"], &["b", "t2"]]),
            &["file"],
            rows(&[&["f0"], &["f1"], &["f2"], &["f3"]]),
        )
        .unwrap()
    }

    #[test]
    fn test_build_rejects_bad_attributes() {
        assert!(matches!(
            Task::build(database(), "vowel", &[], &[], vec![], vec![]),
            Err(AbxError::Configuration(_))
        ));
        assert!(matches!(
            Task::build(database(), "phone", &["phone".to_string()], &[], vec![], vec![]),
            Err(AbxError::Configuration(_))
        ));
        assert!(matches!(
            Task::build(database(), "phone", &["#across".to_string()], &[], vec![], vec![]),
            Err(AbxError::Configuration(_))
        ));
    }

    #[test]
    fn test_statistics_and_levels() {
        let mut task = Task::build(database(), "phone", &["talker".to_string()], &[], vec![], vec![]).unwrap();
        assert_eq!(task.stats().nb_triplets, 4);
        assert_eq!(task.estimate_statistics(true).unwrap(), *task.stats());
        assert_eq!(task.compute_nb_levels().unwrap(), 4);
    }

    #[test]
    fn test_generate_writes_layout() {
        let temp = TempDir::default();
        let output = temp.as_ref().join("out.abx");
        let task = Arc::new(Task::build(database(), "phone", &["talker".to_string()], &[], vec![], vec![]).unwrap());

        let request = GenerateRequest {
            output: output.clone(),
            config: Configuration {
                concurrent_threads: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let outcome = rt.block_on(generate(task, request)).unwrap();

        let GenerateOutcome::Written(summary) = outcome else {
            panic!("expected written output");
        };
        assert_eq!(summary.nb_triplets, 4);
        assert_eq!(summary.nb_by_groups, 1);

        let store = DatasetStore::open(&output).unwrap();
        assert_eq!(store.open_dataset("", TRIPLETS, 16).unwrap().rows(), 4);
        assert_eq!(
            store.open_dataset("", TRIPLETS_INDEX, 16).unwrap().read_all().unwrap(),
            vec![0, 0, 4]
        );
        assert!(store.table_path(FEATURES, "0").exists());

        let leftovers = fs::read_dir(&output)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }
}
