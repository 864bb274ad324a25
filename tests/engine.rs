//! Download engine tests against an in-memory bucket.

use async_trait::async_trait;
use dsfetch::{
    download_object, download_with_retry, get_dataset, run_batch, BatchContext, Bucket,
    BucketSource, DatasetError, DatasetInfo, DownloadOutcome, DownloadTask, GetConfig,
    ManifestEntry, MetadataApi, ObjectPage, ObjectSummary, OpenedBucket, ProgressTracker,
    Prompter, RemoteObject, RetryContext, RoundState, TransferError, TransferOptions,
    TransferRequest, TRAFFIC_LIMIT_HEADER,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

#[derive(Clone, Copy)]
enum Failure {
    Server,
    Other,
    Panic,
}

/// Bucket that materialises objects as sparse files and fails on demand.
#[derive(Default)]
struct FakeBucket {
    entries: Vec<ObjectSummary>,
    /// Remaining failures per key; `u32::MAX` fails forever.
    failures: Mutex<HashMap<String, (u32, Option<Failure>)>>,
    attempts: Mutex<HashMap<String, u32>>,
    headers: Mutex<Vec<Option<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeBucket {
    fn with_entries(entries: Vec<ObjectSummary>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    fn fail(self, key: &str, times: u32) -> Self {
        self.fail_with(key, times, Failure::Server)
    }

    fn fail_with(self, key: &str, times: u32, kind: Failure) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), (times, Some(kind)));
        self
    }

    fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Bucket for FakeBucket {
    async fn list_page(
        &self,
        prefix: &str,
        _continuation: Option<&str>,
    ) -> Result<ObjectPage, DatasetError> {
        Ok(ObjectPage {
            entries: self
                .entries
                .iter()
                .filter(|e| e.key.starts_with(prefix))
                .cloned()
                .collect(),
            next_continuation: None,
        })
    }

    async fn resumable_download(
        &self,
        request: TransferRequest<'_>,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), TransferError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(request.key.to_string())
            .or_default() += 1;
        self.headers.lock().unwrap().push(
            request
                .headers
                .get(TRAFFIC_LIMIT_HEADER)
                .map(|v| v.to_str().unwrap().to_string()),
        );

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(request.key) {
                Some((remaining, kind)) if *remaining > 0 => {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    *kind
                }
                _ => None,
            }
        };

        on_progress(request.size / 2);
        match failure {
            Some(Failure::Server) => return Err(TransferError::Server { status: 503 }),
            Some(Failure::Other) => return Err(TransferError::Other("boom".to_string())),
            Some(Failure::Panic) => panic!("worker crashed on {}", request.key),
            None => {}
        }

        let file = std::fs::File::create(request.dest)?;
        file.set_len(request.size)?;
        on_progress(request.size);
        Ok(())
    }
}

/// Hands out the same bucket and counts refreshes.
struct SameBucket {
    bucket: Arc<FakeBucket>,
    refreshes: AtomicUsize,
}

impl SameBucket {
    fn new(bucket: Arc<FakeBucket>) -> Self {
        Self {
            bucket,
            refreshes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BucketSource for SameBucket {
    async fn refresh(&self) -> Result<Arc<dyn Bucket>, DatasetError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.bucket.clone())
    }
}

/// Hands out a replacement bucket, or fails when there is none.
struct SwapBucket {
    fresh: Option<Arc<FakeBucket>>,
    refreshes: AtomicUsize,
}

impl SwapBucket {
    fn new(fresh: Option<Arc<FakeBucket>>) -> Self {
        Self {
            fresh,
            refreshes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BucketSource for SwapBucket {
    async fn refresh(&self) -> Result<Arc<dyn Bucket>, DatasetError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        match &self.fresh {
            Some(bucket) => Ok(bucket.clone()),
            None => Err(DatasetError::Storage("credentials expired".to_string())),
        }
    }
}

fn summary(key: &str, size: u64) -> ObjectSummary {
    ObjectSummary {
        key: key.to_string(),
        size,
        etag: None,
        is_prefix: false,
    }
}

fn objects(n: usize) -> Vec<RemoteObject> {
    (0..n)
        .map(|i| RemoteObject::new(format!("org/demo/raw/file-{:02}.bin", i), 100 + i as u64))
        .collect()
}

fn batch_context(dir: &Path, threads: usize) -> BatchContext {
    BatchContext {
        root_dir: dir.to_path_buf(),
        threads,
        traffic_limit: 0,
        options: TransferOptions::default(),
        progress: Arc::new(ProgressTracker::hidden()),
    }
}

fn retry_context(dir: &Path) -> RetryContext {
    RetryContext {
        root_dir: dir.to_path_buf(),
        threads: 3,
        traffic_limit: 0,
        options: TransferOptions::default(),
        max_rounds: 3,
        round_backoff: Duration::ZERO,
        show_progress: false,
    }
}

#[tokio::test]
async fn test_batch_returns_exactly_the_failing_objects() {
    let dir = tempfile::tempdir().unwrap();
    let objects = objects(10);
    let bucket = FakeBucket::default()
        .fail(&objects[7].key, u32::MAX)
        .fail(&objects[2].key, u32::MAX)
        .fail_with(&objects[4].key, u32::MAX, Failure::Other);

    let ctx = batch_context(dir.path(), 4);
    let failed = run_batch(Arc::new(bucket), &objects, &ctx).await;

    let mut keys: Vec<_> = failed.iter().map(|o| o.key.clone()).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            objects[2].key.clone(),
            objects[4].key.clone(),
            objects[7].key.clone()
        ]
    );
    assert!(!dir.path().join("file-02.bin").exists());
    assert!(dir.path().join("file-03.bin").exists());
}

#[tokio::test]
async fn test_batch_progress_sums_object_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let objects = objects(12);
    let ctx = batch_context(dir.path(), 5);

    let failed = run_batch(Arc::new(FakeBucket::default()), &objects, &ctx).await;

    assert!(failed.is_empty());
    let expected: u64 = objects.iter().map(|o| o.size).sum();
    assert_eq!(ctx.progress.advanced(), expected);
    for object in &objects {
        assert_eq!(ctx.progress.consumed(&object.key), object.size);
    }
}

#[tokio::test]
async fn test_batch_concurrency_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let bucket = Arc::new(FakeBucket::default());
    let ctx = batch_context(dir.path(), 2);

    let failed = run_batch(bucket.clone(), &objects(8), &ctx).await;

    assert!(failed.is_empty());
    assert!(bucket.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_batch_dedups_repeated_objects() {
    let dir = tempfile::tempdir().unwrap();
    let mut objects = objects(3);
    objects.push(objects[1].clone());
    let bucket = FakeBucket::default().fail(&objects[1].key, u32::MAX);

    let failed = run_batch(Arc::new(bucket), &objects, &batch_context(dir.path(), 2)).await;

    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, objects[1].key);
}

#[tokio::test]
async fn test_batch_counts_panicked_worker_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let objects = objects(5);
    let bucket = FakeBucket::default().fail_with(&objects[3].key, u32::MAX, Failure::Panic);
    let ctx = batch_context(dir.path(), 2);

    let failed = run_batch(Arc::new(bucket), &objects, &ctx).await;

    assert_eq!(failed, vec![objects[3].clone()]);
    for (i, object) in objects.iter().enumerate() {
        assert_eq!(dir.path().join(object.local_name()).exists(), i != 3);
    }
}

#[tokio::test]
async fn test_download_object_classifies_failures() {
    let dir = tempfile::tempdir().unwrap();
    let object = RemoteObject::new("org/demo/a.bin", 10);
    let bucket = FakeBucket::default()
        .fail(&object.key, 1)
        .fail_with("org/demo/b.bin", 1, Failure::Other);
    let task = |object: RemoteObject| DownloadTask {
        object,
        root_dir: dir.path().to_path_buf(),
        traffic_limit: 0,
        options: TransferOptions::default(),
        progress: Arc::new(ProgressTracker::hidden()),
    };

    let outcome = download_object(&bucket, &task(object.clone())).await;
    assert!(matches!(outcome, DownloadOutcome::Transient(_)));

    let outcome = download_object(&bucket, &task(RemoteObject::new("org/demo/b.bin", 10))).await;
    assert!(matches!(outcome, DownloadOutcome::Unclassified(_)));

    let outcome = download_object(&bucket, &task(object)).await;
    assert_eq!(outcome, DownloadOutcome::Success);
    assert_eq!(std::fs::metadata(dir.path().join("a.bin")).unwrap().len(), 10);
}

#[tokio::test]
async fn test_download_object_sends_traffic_limit_header() {
    let dir = tempfile::tempdir().unwrap();
    let bucket = FakeBucket::default();
    let mut task = DownloadTask {
        object: RemoteObject::new("org/demo/a.bin", 10),
        root_dir: dir.path().to_path_buf(),
        traffic_limit: 409_600,
        options: TransferOptions::default(),
        progress: Arc::new(ProgressTracker::hidden()),
    };

    assert!(download_object(&bucket, &task).await.is_success());
    task.traffic_limit = 0;
    assert!(download_object(&bucket, &task).await.is_success());

    let headers = bucket.headers.lock().unwrap().clone();
    assert_eq!(headers, vec![Some("409600".to_string()), None]);
}

#[tokio::test]
async fn test_retry_succeeds_on_second_round() {
    let dir = tempfile::tempdir().unwrap();
    let objects = objects(5);
    let bucket = Arc::new(
        FakeBucket::default()
            .fail(&objects[0].key, 1)
            .fail(&objects[3].key, 1),
    );
    let source = SameBucket::new(bucket.clone());

    let report =
        download_with_retry(&source, bucket.clone(), objects.clone(), &retry_context(dir.path()))
            .await;

    assert_eq!(report.state, RoundState::Done);
    assert!(report.is_complete());
    assert_eq!(report.rounds, 2);
    assert!(report.failed.is_empty());
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(bucket.attempts(&objects[0].key), 2);
    assert_eq!(bucket.attempts(&objects[1].key), 1);
}

#[tokio::test]
async fn test_retry_exhausts_after_three_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let objects = objects(4);
    let bucket = Arc::new(FakeBucket::default().fail(&objects[2].key, u32::MAX));
    let source = SameBucket::new(bucket.clone());

    let report =
        download_with_retry(&source, bucket.clone(), objects.clone(), &retry_context(dir.path()))
            .await;

    assert_eq!(report.state, RoundState::Exhausted);
    assert_eq!(report.rounds, 3);
    assert_eq!(report.failed, vec![objects[2].clone()]);
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(bucket.attempts(&objects[2].key), 3);
    assert_eq!(bucket.attempts(&objects[0].key), 1);
}

#[tokio::test]
async fn test_retry_uses_refreshed_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let objects = objects(3);
    let stale = objects
        .iter()
        .fold(FakeBucket::default(), |b, o| b.fail(&o.key, u32::MAX));
    let stale = Arc::new(stale);
    let fresh = Arc::new(FakeBucket::default());
    let source = SwapBucket::new(Some(fresh.clone()));

    let report =
        download_with_retry(&source, stale.clone(), objects.clone(), &retry_context(dir.path()))
            .await;

    assert_eq!(report.state, RoundState::Done);
    assert_eq!(report.rounds, 2);
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    for object in &objects {
        assert_eq!(stale.attempts(&object.key), 1);
        assert_eq!(fresh.attempts(&object.key), 1);
    }
}

#[tokio::test]
async fn test_retry_keeps_old_bucket_when_refresh_fails() {
    let dir = tempfile::tempdir().unwrap();
    let objects = objects(4);
    let bucket = Arc::new(FakeBucket::default().fail(&objects[1].key, 1));
    let source = SwapBucket::new(None);

    let report =
        download_with_retry(&source, bucket.clone(), objects.clone(), &retry_context(dir.path()))
            .await;

    assert_eq!(report.state, RoundState::Done);
    assert_eq!(report.rounds, 2);
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(bucket.attempts(&objects[1].key), 2);
    assert_eq!(bucket.attempts(&objects[0].key), 1);
}

#[tokio::test]
async fn test_retry_all_succeed_in_one_round() {
    let dir = tempfile::tempdir().unwrap();
    let bucket = Arc::new(FakeBucket::default());
    let source = SameBucket::new(bucket.clone());

    let report = download_with_retry(&source, bucket, objects(6), &retry_context(dir.path())).await;

    assert_eq!(report.state, RoundState::Done);
    assert_eq!(report.rounds, 1);
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 0);
}

/// Metadata API backed by one fake bucket.
struct FakeApi {
    bucket: Arc<FakeBucket>,
    has_record: bool,
    audits: Mutex<Vec<(String, Vec<ManifestEntry>)>>,
    records: Mutex<Vec<String>>,
    opens: AtomicUsize,
}

impl FakeApi {
    fn new(bucket: FakeBucket, has_record: bool) -> Self {
        Self {
            bucket: Arc::new(bucket),
            has_record,
            audits: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MetadataApi for FakeApi {
    async fn dataset_info(&self, name: &str) -> Result<DatasetInfo, DatasetError> {
        if name == "demo" {
            Ok(DatasetInfo {
                name: "demo".to_string(),
            })
        } else {
            Err(DatasetError::NotFound(format!("{} not exists!", name)))
        }
    }

    async fn open_bucket(
        &self,
        dataset: &str,
        _compressed: bool,
    ) -> Result<OpenedBucket, DatasetError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(OpenedBucket {
            bucket: self.bucket.clone(),
            prefix: format!("org/{}/", dataset),
        })
    }

    async fn submit_download_audit(
        &self,
        dataset: &str,
        manifest: &[ManifestEntry],
    ) -> Result<(), DatasetError> {
        self.audits
            .lock()
            .unwrap()
            .push((dataset.to_string(), manifest.to_vec()));
        Ok(())
    }

    async fn has_download_record(&self, _dataset: &str) -> Result<bool, DatasetError> {
        Ok(self.has_record)
    }

    async fn record_download(&self, dataset: &str) -> Result<(), DatasetError> {
        self.records.lock().unwrap().push(dataset.to_string());
        Ok(())
    }
}

struct Answer {
    agreement: bool,
    directory: bool,
    asked_agreement: AtomicUsize,
}

impl Answer {
    fn yes() -> Self {
        Self {
            agreement: true,
            directory: true,
            asked_agreement: AtomicUsize::new(0),
        }
    }
}

impl Prompter for Answer {
    fn accept_agreement(&self, _notice: &str) -> bool {
        self.asked_agreement.fetch_add(1, Ordering::SeqCst);
        self.agreement
    }

    fn confirm_directory(&self, _dir: &Path) -> bool {
        self.directory
    }
}

fn demo_bucket() -> FakeBucket {
    FakeBucket::with_entries(vec![
        summary("org/demo/", 0),
        summary("org/demo/raw/a.bin", 10 * MB),
        summary("org/demo/raw/b.bin", 20 * MB),
        summary("org/demo/raw/nested/", 0),
        summary("org/demo/raw/nested/c.bin", 30 * MB),
    ])
}

fn demo_config(dir: &Path, name: &str) -> GetConfig {
    GetConfig {
        name: name.to_string(),
        threads: 2,
        limit_speed: 0,
        output_dir: dir.to_path_buf(),
        round_backoff: Duration::ZERO,
        show_progress: false,
        ..GetConfig::default()
    }
}

#[tokio::test]
async fn test_get_dataset_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeApi::new(demo_bucket(), false);
    let prompter = Answer::yes();

    let report = get_dataset(&api, &demo_config(dir.path(), "demo"), &prompter)
        .await
        .unwrap();

    assert_eq!(report.total_files, 3);
    assert_eq!(report.total_size, 60 * MB);
    assert_eq!(report.retry.rounds, 1);
    assert_eq!(report.retry.state, RoundState::Done);
    assert_eq!(report.message(), "demo, download completed!");
    assert_eq!(report.local_dir, dir.path().join("demo"));

    for (name, size) in [("a.bin", 10 * MB), ("b.bin", 20 * MB), ("c.bin", 30 * MB)] {
        let len = std::fs::metadata(dir.path().join("demo").join(name)).unwrap().len();
        assert_eq!(len, size);
    }

    let audits = api.audits.lock().unwrap().clone();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].0, "demo");
    assert_eq!(
        audits[0].1,
        vec![
            ManifestEntry {
                name: "a.bin".to_string(),
                size: 10 * MB
            },
            ManifestEntry {
                name: "b.bin".to_string(),
                size: 20 * MB
            },
            ManifestEntry {
                name: "c.bin".to_string(),
                size: 30 * MB
            },
        ]
    );
    assert_eq!(*api.records.lock().unwrap(), vec!["demo".to_string()]);
    assert_eq!(prompter.asked_agreement.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_get_dataset_sub_path_and_prior_record() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeApi::new(demo_bucket(), true);
    let prompter = Answer::yes();

    let report = get_dataset(&api, &demo_config(dir.path(), "demo/raw/nested"), &prompter)
        .await
        .unwrap();

    assert_eq!(report.total_files, 1);
    assert_eq!(report.total_size, 30 * MB);
    assert!(dir.path().join("demo").join("c.bin").exists());
    assert!(!dir.path().join("demo").join("a.bin").exists());
    assert_eq!(prompter.asked_agreement.load(Ordering::SeqCst), 0);
    assert!(api.records.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_get_dataset_reports_incomplete_download() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeApi::new(demo_bucket().fail("org/demo/raw/b.bin", u32::MAX), true);

    let report = get_dataset(&api, &demo_config(dir.path(), "demo"), &Answer::yes())
        .await
        .unwrap();

    assert_eq!(report.retry.state, RoundState::Exhausted);
    assert_eq!(report.retry.rounds, 3);
    assert_eq!(report.retry.failed.len(), 1);
    assert!(report.message().starts_with("demo, download incomplete"));
    // Initial open plus one refresh before each retry round.
    assert_eq!(api.opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_get_dataset_missing_path_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeApi::new(demo_bucket(), true);

    let err = get_dataset(&api, &demo_config(dir.path(), "demo/missing"), &Answer::yes())
        .await
        .unwrap_err();

    assert!(matches!(err, DatasetError::NotFound(ref msg) if msg == "demo/missing not exists!"));
    assert!(api.audits.lock().unwrap().is_empty());
    assert!(!dir.path().join("demo").exists());
}

#[tokio::test]
async fn test_get_dataset_declined_agreement() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeApi::new(demo_bucket(), false);
    let prompter = Answer {
        agreement: false,
        directory: true,
        asked_agreement: AtomicUsize::new(0),
    };

    let err = get_dataset(&api, &demo_config(dir.path(), "demo"), &prompter)
        .await
        .unwrap_err();

    assert!(matches!(err, DatasetError::Declined));
    assert!(api.records.lock().unwrap().is_empty());
    assert!(!dir.path().join("demo").exists());
}

#[tokio::test]
async fn test_get_dataset_declined_directory() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeApi::new(demo_bucket(), true);
    let prompter = Answer {
        agreement: true,
        directory: false,
        asked_agreement: AtomicUsize::new(0),
    };

    let err = get_dataset(&api, &demo_config(dir.path(), "demo"), &prompter)
        .await
        .unwrap_err();

    assert!(matches!(err, DatasetError::Declined));
    assert!(!dir.path().join("demo").exists());
}
