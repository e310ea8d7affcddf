use crate::archive::{extract_dem, verify_archive};
use crate::dem::DemTileRef;
use crate::error::{DemError, Result};
use crate::inventory::{Inventory, InventoryEntry};
use crate::remote::{ArchiveFetch, CatalogSearch, IdentityService};
use crate::report::{BatchReport, FailureReason, ReportBuilder, RetrievalOutcome};
use crate::retry::{retry_if, with_retry, RetryConfig};
use crate::token::{Clock, TokenManager};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub tile: DemTileRef,
    /// `<output>/<collection>/<resolution>/<model>`
    pub target_dir: PathBuf,
}

impl DownloadTask {
    pub fn new(tile: DemTileRef, output_root: &Path) -> Self {
        let target_dir = tile.product.directory(output_root);
        DownloadTask { tile, target_dir }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Downloads running at once, all sharing one bearer snapshot
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Where per-item scratch directories are created; system temp if unset
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryConfig::default(),
            scratch_dir: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct DownloadPlan {
    tasks: Vec<DownloadTask>,
}

impl DownloadPlan {
    pub fn new(tiles: Vec<DemTileRef>, output_root: &Path) -> Self {
        let tasks = tiles
            .into_iter()
            .map(|tile| DownloadTask::new(tile, output_root))
            .collect();
        Self { tasks }
    }

    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)
            .map_err(|e| DemError::Config(format!("Unreadable download plan: {e}")))?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Report for a run that stopped before the first item, e.g. because
    /// the session could not be opened. Every item is `failed(token-expired)`.
    pub fn abandoned(&self, err: &DemError) -> BatchReport {
        let mut builder = ReportBuilder::new(self.tasks.iter().map(|t| t.tile.clone()).collect());
        builder.abort(err);
        builder.finish()
    }

    /// Retrieves every planned tile and reports one outcome per tile.
    ///
    /// Work proceeds in waves of `config.concurrency` items. The token is
    /// checked once before each wave; if it cannot be made valid the run
    /// stops and the items not yet started are reported as
    /// `failed(token-expired)`. Any other failure only affects its item.
    pub async fn execute<S, C, R>(
        &self,
        tokens: &mut TokenManager<S, C>,
        remote: &R,
        config: &PipelineConfig,
    ) -> BatchReport
    where
        S: IdentityService,
        C: Clock,
        R: CatalogSearch + ArchiveFetch,
    {
        let concurrency = config.concurrency.max(1);
        let mut builder = ReportBuilder::new(self.tasks.iter().map(|t| t.tile.clone()).collect());
        let mut inventories: BTreeMap<PathBuf, Inventory> = BTreeMap::new();
        let indices: Vec<usize> = (0..self.tasks.len()).collect();

        for wave in indices.chunks(concurrency) {
            let bearer = match tokens.ensure_valid().await {
                Ok(bearer) => bearer,
                Err(e) => {
                    error!("Stopping the batch: {e}");
                    builder.abort(&e);
                    break;
                }
            };

            let mut pending = Vec::with_capacity(wave.len());
            for &i in wave {
                let task = &self.tasks[i];
                let inventory = inventories
                    .entry(task.target_dir.clone())
                    .or_insert_with(|| Inventory::load(&task.target_dir));
                match inventory.intact(&task.tile.cell, &task.target_dir) {
                    Some(path) => {
                        info!("{} already present, skipping", task.tile);
                        builder.record(i, RetrievalOutcome::skipped(task.tile.clone(), path));
                    }
                    None => pending.push(i),
                }
            }

            let tasks = &self.tasks;
            let bearer = bearer.as_str();
            let results: Vec<(usize, Result<InventoryEntry>)> = stream::iter(pending)
                .map(move |i| async move { (i, retrieve(remote, &tasks[i], bearer, config).await) })
                .buffered(concurrency)
                .collect()
                .await;

            let mut touched = BTreeSet::new();
            for (i, result) in results {
                let task = &self.tasks[i];
                match result {
                    Ok(entry) => {
                        let path = task.target_dir.join(&entry.files[0].name);
                        info!("Fetched {} into {}", task.tile, path.display());
                        inventories
                            .entry(task.target_dir.clone())
                            .or_default()
                            .record(&task.tile.cell, entry);
                        touched.insert(task.target_dir.clone());
                        builder.record(i, RetrievalOutcome::fetched(task.tile.clone(), path));
                    }
                    Err(e) => {
                        let reason = FailureReason::from(&e);
                        warn!("{} failed: {reason}", task.tile);
                        builder.record(i, RetrievalOutcome::failed(task.tile.clone(), reason));
                    }
                }
            }

            for dir in touched {
                if let Some(inventory) = inventories.get(&dir) {
                    if let Err(e) = inventory.save(&dir) {
                        warn!("Unable to update inventory in {}: {e}", dir.display());
                    }
                }
            }
        }

        builder.finish()
    }
}

/// Search, download, verify and extract one tile. The scratch directory
/// holding the archive is removed whatever the outcome.
async fn retrieve<R>(
    remote: &R,
    task: &DownloadTask,
    bearer: &str,
    config: &PipelineConfig,
) -> Result<InventoryEntry>
where
    R: CatalogSearch + ArchiveFetch,
{
    let tile = &task.tile;
    let product = with_retry(&config.retry, &format!("Search for {tile}"), move || {
        remote.search(tile, bearer)
    })
    .await?;

    let mut builder = tempfile::Builder::new();
    builder.prefix("cdse-dem-");
    let scratch = match &config.scratch_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            builder.tempdir_in(dir)?
        }
        None => builder.tempdir()?,
    };
    let archive = scratch.path().join(format!("{}.zip", product.id));

    let product_ref = &product;
    let archive_ref = archive.as_path();
    retry_if(
        &config.retry,
        &format!("Download of {}", product.name),
        |e| matches!(e, DemError::Network(_) | DemError::Integrity(_)),
        move || async move {
            remote.fetch(product_ref, bearer, archive_ref).await?;
            let (path, descriptor) = (archive_ref.to_path_buf(), product_ref.clone());
            blocking(move || verify_archive(&path, &descriptor)).await
        },
    )
    .await?;

    let target_dir = task.target_dir.clone();
    let files = blocking(move || extract_dem(&archive, &target_dir)).await?;

    Ok(InventoryEntry {
        product_id: product.id,
        product_name: product.name,
        files,
    })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DemError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::md5_file;
    use crate::archive::tests::write_product_zip;
    use crate::credentials::Credential;
    use crate::dem::{DemCell, DemProduct};
    use crate::remote::{Checksum, ChecksumAlgorithm, Grant, ProductDescriptor};
    use crate::report::{OutcomeStatus, Termination, Verdict};
    use crate::token::{ManualClock, TokenPolicy};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Issues the same token every time; refreshes fail when the identity
    /// service is unreachable.
    #[derive(Default)]
    struct StaticIdentity {
        unreachable_on_refresh: bool,
        refresh_attempts: AtomicU32,
    }

    impl IdentityService for StaticIdentity {
        async fn request_token(&self, _identity: &str, _secret: &str) -> Result<Grant> {
            Ok(Grant {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_in: Duration::from_secs(600),
            })
        }

        async fn refresh_token(&self, _refresh_token: &str) -> Result<Grant> {
            self.refresh_attempts.fetch_add(1, Ordering::SeqCst);
            if self.unreachable_on_refresh {
                return Err(DemError::Network("connection refused".into()));
            }
            self.request_token("", "").await
        }
    }

    /// In-memory catalog and download service.
    #[derive(Default)]
    struct FakeRemote {
        archives: HashMap<DemCell, (String, Vec<u8>)>,
        fetches: AtomicU32,
        corrupt_downloads: AtomicU32,
        /// Advanced by `clock_step` after each download
        clock: Option<(ManualClock, Duration)>,
    }

    impl FakeRemote {
        fn with_cells(cells: &[DemCell]) -> Self {
            let dir = tempdir().unwrap();
            let archives = cells
                .iter()
                .map(|cell| {
                    let name = format!("Copernicus_DSM_30_{}", cell.product_token());
                    let path = dir.path().join("a.zip");
                    write_product_zip(&path, &name, cell.to_string().as_bytes());
                    (*cell, (name, fs::read(&path).unwrap()))
                })
                .collect();
            Self {
                archives,
                ..Default::default()
            }
        }
    }

    impl CatalogSearch for FakeRemote {
        async fn search(&self, tile: &DemTileRef, bearer: &str) -> Result<ProductDescriptor> {
            assert_eq!(bearer, "access");
            let (name, bytes) = self
                .archives
                .get(&tile.cell)
                .ok_or_else(|| DemError::NotFound(tile.to_string()))?;
            let dir = tempdir().unwrap();
            let path = dir.path().join("a.zip");
            fs::write(&path, bytes).unwrap();
            Ok(ProductDescriptor {
                id: tile.cell.to_string(),
                name: name.clone(),
                download_url: format!("http://localhost/Products({})/$value", tile.cell),
                checksums: vec![Checksum {
                    algorithm: ChecksumAlgorithm::Md5,
                    value: md5_file(&path).unwrap(),
                }],
                size: Some(bytes.len() as u64),
            })
        }
    }

    impl ArchiveFetch for FakeRemote {
        async fn fetch(&self, product: &ProductDescriptor, _bearer: &str, dest: &Path) -> Result<u64> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let (_, bytes) = self
                .archives
                .values()
                .find(|(name, _)| *name == product.name)
                .ok_or_else(|| DemError::NotFound(product.name.clone()))?;
            let mut bytes = bytes.clone();
            if self.corrupt_downloads.load(Ordering::SeqCst) > 0 {
                self.corrupt_downloads.fetch_sub(1, Ordering::SeqCst);
                let last = bytes.len() - 1;
                bytes[last] ^= 0xff;
            }
            fs::write(dest, &bytes)?;
            if let Some((clock, step)) = &self.clock {
                clock.advance(*step);
            }
            Ok(bytes.len() as u64)
        }
    }

    fn tiles(cells: &[DemCell]) -> Vec<DemTileRef> {
        cells
            .iter()
            .map(|&cell| DemTileRef {
                cell,
                product: DemProduct::default(),
            })
            .collect()
    }

    fn config(scratch: &TempDir) -> PipelineConfig {
        PipelineConfig {
            concurrency: 1,
            retry: RetryConfig::immediate(3),
            scratch_dir: Some(scratch.path().to_path_buf()),
        }
    }

    async fn authenticated(clock: ManualClock) -> TokenManager<StaticIdentity, ManualClock> {
        authenticated_with(StaticIdentity::default(), clock).await
    }

    async fn authenticated_with(
        identity: StaticIdentity,
        clock: ManualClock,
    ) -> TokenManager<StaticIdentity, ManualClock> {
        let mut manager = TokenManager::with_clock(
            identity,
            clock,
            TokenPolicy::default(),
            RetryConfig::immediate(2),
        );
        manager
            .authenticate(&Credential::new("jane@example.org", "secret"))
            .await
            .unwrap();
        manager
    }

    fn mock_download_plan(output: &Path) -> DownloadPlan {
        DownloadPlan::new(
            tiles(&[DemCell::new(48, 7), DemCell::new(48, 8), DemCell::new(49, 7)]),
            output,
        )
    }

    #[test]
    fn test_write_and_read_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("download_plan.json");
        let plan = mock_download_plan(&dir.path().join("out"));
        plan.write(&path).unwrap();

        let read = DownloadPlan::read(&path).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read.tasks(), plan.tasks());
        assert_eq!(
            read.tasks()[0].target_dir,
            dir.path().join("out/COP-DEM/90/DGED")
        );
    }

    #[tokio::test]
    async fn test_fetches_every_tile() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [DemCell::new(48, 7), DemCell::new(48, 8)];
        let remote = FakeRemote::with_cells(&cells);
        let mut tokens = authenticated(ManualClock::new()).await;

        let plan = DownloadPlan::new(tiles(&cells), out.path());
        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;

        assert_eq!(report.verdict(), Verdict::FullySucceeded);
        assert_eq!(report.outcomes.len(), 2);
        for outcome in &report.outcomes {
            assert_eq!(outcome.status, OutcomeStatus::Fetched);
            assert!(outcome.output_path.as_ref().unwrap().exists());
        }
        let raster = out
            .path()
            .join("COP-DEM/90/DGED/Copernicus_DSM_30_N48_00_E007_00_DEM.tif");
        assert_eq!(fs::read_to_string(raster).unwrap(), "N48E007");
        // scratch directories are cleaned up
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_rerun_skips_present_tiles() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [DemCell::new(48, 7), DemCell::new(48, 8)];
        let remote = FakeRemote::with_cells(&cells);
        let mut tokens = authenticated(ManualClock::new()).await;
        let plan = DownloadPlan::new(tiles(&cells), out.path());

        plan.execute(&mut tokens, &remote, &config(&scratch)).await;
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 2);

        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 2);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::SkippedExists));
        assert_eq!(report.verdict(), Verdict::FullySucceeded);
    }

    #[tokio::test]
    async fn test_tampered_tile_is_fetched_again() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [DemCell::new(48, 7)];
        let remote = FakeRemote::with_cells(&cells);
        let mut tokens = authenticated(ManualClock::new()).await;
        let plan = DownloadPlan::new(tiles(&cells), out.path());

        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;
        fs::write(report.outcomes[0].output_path.as_ref().unwrap(), "truncated").unwrap();

        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Fetched);
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_product_does_not_stop_the_batch() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let remote = FakeRemote::with_cells(&[DemCell::new(48, 8)]);
        let mut tokens = authenticated(ManualClock::new()).await;
        let plan = DownloadPlan::new(
            tiles(&[DemCell::new(48, 7), DemCell::new(48, 8)]),
            out.path(),
        );

        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;
        assert_eq!(
            report.outcomes[0].status,
            OutcomeStatus::Failed(FailureReason::NotFound)
        );
        assert_eq!(report.outcomes[1].status, OutcomeStatus::Fetched);
        assert_eq!(report.verdict(), Verdict::Partial);
    }

    #[tokio::test]
    async fn test_integrity_failure_is_retried() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [DemCell::new(48, 7)];
        let remote = FakeRemote::with_cells(&cells);
        remote.corrupt_downloads.store(1, Ordering::SeqCst);
        let mut tokens = authenticated(ManualClock::new()).await;

        let plan = DownloadPlan::new(tiles(&cells), out.path());
        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;

        assert_eq!(report.outcomes[0].status, OutcomeStatus::Fetched);
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_integrity_failure() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [DemCell::new(48, 7)];
        let remote = FakeRemote::with_cells(&cells);
        remote.corrupt_downloads.store(10, Ordering::SeqCst);
        let mut tokens = authenticated(ManualClock::new()).await;

        let plan = DownloadPlan::new(tiles(&cells), out.path());
        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;

        assert!(matches!(
            report.outcomes[0].status,
            OutcomeStatus::Failed(FailureReason::Integrity(_))
        ));
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(report.verdict(), Verdict::AllFailed);
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_archive_without_raster_is_extract_error() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cell = DemCell::new(48, 7);
        let mut remote = FakeRemote::default();
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        let mut zip = zip::ZipWriter::new(fs::File::create(&path).unwrap());
        zip.start_file("readme.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.finish().unwrap();
        remote
            .archives
            .insert(cell, ("empty".to_string(), fs::read(&path).unwrap()));
        let mut tokens = authenticated(ManualClock::new()).await;

        let plan = DownloadPlan::new(tiles(&[cell]), out.path());
        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;
        assert!(matches!(
            report.outcomes[0].status,
            OutcomeStatus::Failed(FailureReason::ExtractError(_))
        ));
    }

    #[tokio::test]
    async fn test_token_expiry_aborts_remaining_items() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [DemCell::new(48, 7), DemCell::new(48, 8), DemCell::new(49, 7)];
        let clock = ManualClock::new();
        let mut remote = FakeRemote::with_cells(&cells);
        remote.clock = Some((clock.clone(), Duration::from_secs(61 * 60)));
        let mut tokens = authenticated(clock).await;

        let plan = DownloadPlan::new(tiles(&cells), out.path());
        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Fetched);
        for outcome in &report.outcomes[1..] {
            assert_eq!(
                outcome.status,
                OutcomeStatus::Failed(FailureReason::TokenExpired)
            );
        }
        assert!(matches!(report.termination, Termination::Aborted { .. }));
        assert_eq!(report.verdict(), Verdict::Aborted);
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);
        assert!(tokens.state().is_expired());
    }

    #[tokio::test]
    async fn test_failed_refresh_aborts_remaining_items() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [DemCell::new(48, 7), DemCell::new(48, 8), DemCell::new(49, 7)];
        let clock = ManualClock::new();
        let mut remote = FakeRemote::with_cells(&cells);
        remote.clock = Some((clock.clone(), Duration::from_secs(11 * 60)));
        let identity = StaticIdentity {
            unreachable_on_refresh: true,
            ..StaticIdentity::default()
        };
        let mut tokens = authenticated_with(identity, clock).await;

        let plan = DownloadPlan::new(tiles(&cells), out.path());
        let report = plan.execute(&mut tokens, &remote, &config(&scratch)).await;

        assert_eq!(report.outcomes[0].status, OutcomeStatus::Fetched);
        for outcome in &report.outcomes[1..] {
            assert_eq!(
                outcome.status,
                OutcomeStatus::Failed(FailureReason::TokenExpired)
            );
        }
        assert_eq!(report.verdict(), Verdict::Aborted);
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.service().refresh_attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_abandoned_plan_reports_every_item() {
        let dir = tempdir().unwrap();
        let plan = mock_download_plan(dir.path());
        let report = plan.abandoned(&DemError::AuthRejected("invalid_grant".to_string()));

        assert_eq!(report.outcomes.len(), 3);
        for (outcome, task) in report.outcomes.iter().zip(plan.tasks()) {
            assert_eq!(outcome.tile, task.tile);
            assert_eq!(
                outcome.status,
                OutcomeStatus::Failed(FailureReason::TokenExpired)
            );
        }
        assert!(matches!(
            &report.termination,
            Termination::Aborted { reason } if reason.contains("invalid_grant")
        ));
        assert_eq!(report.verdict(), Verdict::Aborted);
        assert_eq!(report.summary().token_expired, 3);
    }

    #[tokio::test]
    async fn test_parallel_waves_share_one_token() {
        let out = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cells = [
            DemCell::new(48, 7),
            DemCell::new(48, 8),
            DemCell::new(49, 7),
            DemCell::new(49, 8),
            DemCell::new(50, 7),
        ];
        let remote = FakeRemote::with_cells(&cells);
        let mut tokens = authenticated(ManualClock::new()).await;
        let config = PipelineConfig {
            concurrency: 2,
            ..config(&scratch)
        };

        let plan = DownloadPlan::new(tiles(&cells), out.path());
        let report = plan.execute(&mut tokens, &remote, &config).await;

        assert_eq!(report.verdict(), Verdict::FullySucceeded);
        let order: Vec<_> = report.outcomes.iter().map(|o| o.tile.cell).collect();
        assert_eq!(order, cells);
        let inventory = Inventory::load(&out.path().join("COP-DEM/90/DGED"));
        assert_eq!(inventory.len(), 5);
    }
}
