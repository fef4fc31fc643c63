use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ahash::AHashSet;
use temp_testdir::TempDir;
use tokio::runtime;

use abxgen_core::{
    configuration::Configuration,
    core::{
        database::ItemDatabase,
        error::{AbxError, Result},
        pairs::decode_pair_key,
        sideop::{
            Context, GroupView,
            expressions::{parse_filter, parse_regressor},
            filters::{FilterScope, Predicate},
            regressors::{ItemRegressor, RegressorFn, RegressorScope},
        },
        storage_providers::store::DatasetStore,
        task::{GenerateOutcome, GenerateRequest, Task, generate},
        triplets::Triplet,
        type_fitting::IntType,
    },
};

fn rows(values: &[&[&str]]) -> Vec<Vec<String>> {
    values
        .iter()
        .map(|r| r.iter().map(|v| v.to_string()).collect())
        .collect()
}

fn four_items() -> ItemDatabase {
    ItemDatabase::from_rows(
        &["on", "across"],
        &rows(&[&["x", "p"], &["x", "q"], &["y", "p"], &["y", "q"]]),
        &[],
        Vec::new(),
    )
    .unwrap()
}

/// phone × context × talker, item `i` has talker `i / 4`.
fn eight_items() -> ItemDatabase {
    ItemDatabase::from_rows(
        &["phone", "context", "talker"],
        &rows(&[
            &["a", "c1", "t1"],
            &["a", "c2", "t1"],
            &["b", "c1", "t1"],
            &["b", "c2", "t1"],
            &["a", "c1", "t2"],
            &["a", "c2", "t2"],
            &["b", "c1", "t2"],
            &["b", "c2", "t2"],
        ]),
        &["file"],
        (0..8).map(|i| vec![format!("f{}", i)]).collect(),
    )
    .unwrap()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn request(output: &Path, seed: Option<u64>) -> GenerateRequest {
    GenerateRequest {
        output: output.to_path_buf(),
        config: Configuration {
            concurrent_threads: Some(2),
            seed,
            read_chunk_rows: Some(3),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn run(task: Task, request: GenerateRequest) -> Result<GenerateOutcome> {
    let rt = runtime::Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(generate(Arc::new(task), request))
}

fn read(output: &Path, group: &str, name: &str) -> Vec<u64> {
    DatasetStore::open(output)
        .unwrap()
        .open_dataset(group, name, 5)
        .unwrap()
        .read_all()
        .unwrap()
}

fn triplets(output: &Path) -> Vec<Triplet> {
    read(output, "", "triplets")
        .chunks_exact(3)
        .map(|t| [t[0] as u32, t[1] as u32, t[2] as u32])
        .collect()
}

#[test]
fn test_four_items_end_to_end() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("four.abx");
    let task = Task::build(four_items(), "on", &strings(&["across"]), &[], vec![], vec![]).unwrap();

    let outcome = run(task, request(&output, None)).unwrap();
    assert!(matches!(outcome, GenerateOutcome::Written(ref s) if s.nb_triplets == 4 && s.nb_unique_pairs == 8));

    assert_eq!(triplets(&output), vec![[0, 2, 1], [1, 3, 0], [2, 0, 3], [3, 1, 2]]);
    assert_eq!(read(&output, "", "triplets_index"), vec![0, 0, 4]);

    // (0, 2, 1) yields AX = 0 + 4·1 and BX = 2 + 4·1.
    let unique = read(&output, "", "unique_pairs");
    assert_eq!(unique, vec![1, 3, 4, 6, 9, 11, 12, 14]);
    assert_eq!(decode_pair_key(4, 4), (0, 1));
    assert_eq!(decode_pair_key(6, 4), (2, 1));
    assert_eq!(read(&output, "", "unique_pairs_index"), vec![0, 4, 0, 8]);

    let store = DatasetStore::open(&output).unwrap();
    let (header, by_keys) = store.read_table("", "by_keys").unwrap();
    assert_eq!(header, strings(&["by_id", "#by"]));
    assert_eq!(by_keys.len(), 1);
}

#[test]
fn test_by_groups_are_merged_in_order() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("by.abx");
    let task = Task::build(
        eight_items(),
        "phone",
        &strings(&["context"]),
        &strings(&["talker"]),
        vec![],
        vec![],
    )
    .unwrap();

    run(task, request(&output, None)).unwrap();

    // Both talkers replay the four item layout with local indices.
    let expected = [[0, 2, 1], [1, 3, 0], [2, 0, 3], [3, 1, 2]];
    let all = triplets(&output);
    assert_eq!(all[..4], expected);
    assert_eq!(all[4..], expected);

    assert_eq!(read(&output, "", "triplets_index"), vec![0, 0, 4, 1, 4, 8]);
    assert_eq!(read(&output, "", "unique_pairs_index"), vec![0, 4, 0, 8, 1, 4, 8, 16]);

    let store = DatasetStore::open(&output).unwrap();
    let (_, by_keys) = store.read_table("", "by_keys").unwrap();
    assert_eq!(by_keys, vec![strings(&["0", "t1"]), strings(&["1", "t2"])]);

    let (header, features) = store.read_table("features", "1").unwrap();
    assert_eq!(header, strings(&["file"]));
    assert_eq!(features, vec![strings(&["f4"]), strings(&["f5"]), strings(&["f6"]), strings(&["f7"])]);
}

#[test]
fn test_filters_and_regressors() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("filtered.abx");

    let db = eight_items();
    let filter = parse_filter("talker_A == talker_X", &db.attributes, &[]).unwrap();
    let regressor = parse_regressor("talker_B", &db.attributes).unwrap();
    let task = Task::build(db, "phone", &strings(&["context"]), &[], vec![filter], vec![regressor]).unwrap();

    // Each block has |A| = |B| = |X| = 2 and one X per A shares its talker.
    assert_eq!(task.stats().nb_triplets, 16);

    run(task, request(&output, None)).unwrap();

    let all = triplets(&output);
    assert_eq!(all.len(), 16);
    assert!(all.iter().all(|t| t[0] / 4 == t[2] / 4));

    let talkers = read(&output, "regressors", "talker_B");
    assert_eq!(talkers.len(), all.len());
    for (triplet, talker) in all.iter().zip(talkers) {
        assert_eq!(triplet[1] as u64 / 4, talker);
    }

    // Every triplet contributes its AX and BX keys.
    let unique = read(&output, "", "unique_pairs");
    assert!(unique.windows(2).all(|w| w[0] < w[1]));
    let keys: AHashSet<u64> = unique.into_iter().collect();
    for t in &all {
        assert!(keys.contains(&(t[0] as u64 + 8 * t[2] as u64)));
        assert!(keys.contains(&(t[1] as u64 + 8 * t[2] as u64)));
    }
}

#[test]
fn test_sampling_is_exact_and_reproducible() {
    let temp = TempDir::default();

    let full_output = temp.as_ref().join("full.abx");
    let task = Task::build(eight_items(), "phone", &strings(&["context"]), &[], vec![], vec![]).unwrap();
    run(task, request(&full_output, None)).unwrap();
    let full: AHashSet<Triplet> = triplets(&full_output).into_iter().collect();
    assert_eq!(full.len(), 32);

    let mut samples = Vec::new();
    for name in ["first.abx", "second.abx"] {
        let output = temp.as_ref().join(name);
        let task = Task::build(eight_items(), "phone", &strings(&["context"]), &[], vec![], vec![]).unwrap();
        let mut request = request(&output, Some(11));
        request.sample = Some(10.0);
        run(task, request).unwrap();
        samples.push(triplets(&output));
    }

    assert_eq!(samples[0], samples[1]);
    assert_eq!(samples[0].len(), 10);
    let distinct: AHashSet<Triplet> = samples[0].iter().copied().collect();
    assert_eq!(distinct.len(), 10);
    assert!(distinct.is_subset(&full));
}

#[test]
fn test_threshold_caps_signature_runs() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("threshold.abx");

    let db = eight_items();
    let regressor = parse_regressor("talker_X", &db.attributes).unwrap();
    let task = Task::build(db, "phone", &strings(&["context"]), &[], vec![], vec![regressor]).unwrap();

    let mut request = request(&output, Some(5));
    request.threshold = Some(1);
    run(task, request).unwrap();

    // Four blocks, two X talkers each, one triplet per talker.
    let all = triplets(&output);
    assert_eq!(all.len(), 8);
    assert_eq!(read(&output, "regressors", "runs"), (0..8).collect::<Vec<u64>>());

    let talkers = read(&output, "regressors", "talker_X");
    for pair in talkers.chunks_exact(2) {
        assert_eq!(pair, [0, 1]);
    }
}

#[test]
fn test_regressor_values_must_fit_their_type() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("wide.abx");

    let regressor: Arc<dyn RegressorFn> = Arc::new(
        ItemRegressor::new("wide_A", RegressorScope::A, IntType::U8, |_: &Context, _: &GroupView, i| 300 - 1000 * (i as i64 % 2))
            .unwrap(),
    );
    let task = Task::build(eight_items(), "phone", &strings(&["context"]), &[], vec![], vec![regressor]).unwrap();

    assert!(matches!(run(task, request(&output, None)), Err(AbxError::Evaluation { .. })));
    assert!(!output.exists());
}

#[test]
fn test_empty_task_writes_nothing() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("empty.abx");

    let db = four_items();
    let filter = parse_filter("on == 'z'", &db.attributes, &[]).unwrap();
    let task = Task::build(db, "on", &strings(&["across"]), &[], vec![filter], vec![]).unwrap();
    assert_eq!(task.stats().nb_triplets, 0);

    assert_eq!(run(task, request(&output, None)).unwrap(), GenerateOutcome::Empty);
    assert!(!output.exists());
}

#[test]
fn test_sampling_needs_exact_counts() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("approximate.abx");

    let db = eight_items();
    let filter = parse_filter("talker_A == talker_X", &db.attributes, &[]).unwrap();
    let task = Task::build_with(db, "phone", &strings(&["context"]), &[], vec![filter], vec![], true).unwrap();
    assert!(task.stats().approximate_nb_triplets);

    let mut request = request(&output, Some(1));
    request.sample = Some(0.5);
    assert!(matches!(run(task, request), Err(AbxError::Configuration(_))));
}

/// Passes the first `budget` calls, then fails.
struct Exhausted {
    calls: AtomicUsize,
    budget: usize,
}

impl Predicate for Exhausted {
    fn name(&self) -> &str {
        "exhausted"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::Abx
    }

    fn retain_triplets(&self, _ctx: &Context, _view: &GroupView, triplets: &[Triplet]) -> Result<Vec<bool>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.budget {
            Ok(vec![true; triplets.len()])
        } else {
            Err(AbxError::evaluation("exhausted", "no calls left"))
        }
    }
}

#[test]
fn test_temporary_files_removed_on_failure() {
    let temp = TempDir::default();
    let output = temp.as_ref().join("failed.abx");
    let scratch = temp.as_ref().join("scratch");
    fs::create_dir_all(&scratch).unwrap();

    // Statistics use one call per block, generation fails on the first.
    let filter: Arc<dyn Predicate> = Arc::new(Exhausted {
        calls: AtomicUsize::new(0),
        budget: 4,
    });
    let task = Task::build(four_items(), "on", &strings(&["across"]), &[], vec![filter], vec![]).unwrap();

    let mut request = request(&output, None);
    request.config.temp_location = Some(scratch.clone());

    assert!(matches!(run(task, request), Err(AbxError::Evaluation { .. })));
    assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
}
