//! Parallel baseline processing
//!
//! Baseline requests come in two flavours: ones backed by a local file (the
//! content is already on disk and only needs compressing into the store) and
//! ones that must be downloaded. Each flavour runs on its own rayon pool.
//! Local requests that fail and carry a download URL fall through to the
//! download pool.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::unbounded;
use dashmap::DashSet;
use lws_config::{log_baseline_debug, log_baseline_info, log_baseline_warn, BaselineConfig};
use rayon::ThreadPool;
use uuid::Uuid;

use crate::{BaselineError, BaselineStore, ContentHash, Result, StoredBaseline};

/// Maximum threads in either pool.
const MAX_THREADS: usize = 4;

// ============================================================================
// Requests and results
// ============================================================================

/// One baseline to write (or delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineRequest {
    pub guid: Uuid,
    /// Local file holding the content, if it is already on disk
    pub source_local_item: Option<PathBuf>,
    /// Where to fetch the content from otherwise
    pub download_url: Option<String>,
    /// Expected content hash
    pub hash: Option<ContentHash>,
    /// Local item the baseline belongs to; picks its partition folder
    pub local_hint: Option<PathBuf>,
}

impl BaselineRequest {
    pub fn from_local(guid: Uuid, source: impl Into<PathBuf>, hash: Option<ContentHash>) -> Self {
        let source = source.into();
        Self {
            guid,
            local_hint: Some(source.clone()),
            source_local_item: Some(source),
            download_url: None,
            hash,
        }
    }

    pub fn from_url(guid: Uuid, url: impl Into<String>, hash: Option<ContentHash>) -> Self {
        Self {
            guid,
            source_local_item: None,
            download_url: Some(url.into()),
            hash,
            local_hint: None,
        }
    }

    /// A request with neither a source nor a URL deletes the baseline.
    pub fn delete(guid: Uuid) -> Self {
        Self {
            guid,
            source_local_item: None,
            download_url: None,
            hash: None,
            local_hint: None,
        }
    }
}

/// Summary of one `process_requests` call.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub stored: Vec<(Uuid, StoredBaseline)>,
    pub deleted: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
    /// Requests dropped because an earlier request had the same GUID
    pub duplicates: usize,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fetches baseline content from the server.
pub trait BaselineDownloader: Send + Sync {
    fn download(&self, url: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Shared cancellation flag. Checked before each unit of work is submitted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Outcome {
    Stored(Uuid, StoredBaseline),
    LocalFailed(BaselineRequest, String),
    Failed(Uuid, String),
}

// ============================================================================
// Worker pools
// ============================================================================

/// Get default thread count: half the CPUs, between 1 and MAX_THREADS.
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_THREADS)
}

fn create_thread_pool(threads: Option<usize>, prefix: &'static str) -> Result<ThreadPool> {
    let n = threads.unwrap_or_else(default_thread_count).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(n)
        .thread_name(move |i| format!("{}-{}", prefix, i))
        .build()
        .map_err(|e| BaselineError::ThreadPool(e.to_string()))
}

/// The local (compression) pool and the download pool.
pub struct BaselineWorkers {
    local_pool: ThreadPool,
    download_pool: ThreadPool,
}

impl BaselineWorkers {
    pub fn new(config: &BaselineConfig) -> Result<Self> {
        Ok(Self {
            local_pool: create_thread_pool(config.threads, "lws-baseline")?,
            download_pool: create_thread_pool(config.download_threads, "lws-download")?,
        })
    }

    /// Process a batch of baseline requests.
    ///
    /// Both pools run at once: download requests start on the download pool
    /// while local requests compress on the local pool. Local requests that
    /// fail but carry a URL are handed to the download pool once the local
    /// pool drains. Requests with neither a source nor a URL delete the
    /// baseline. Once `cancel` is set no further units are submitted; units
    /// already running finish, then `Canceled` is returned.
    pub fn process_requests(
        &self,
        store: &BaselineStore,
        requests: Vec<BaselineRequest>,
        downloader: Option<&dyn BaselineDownloader>,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let seen: DashSet<Uuid> = DashSet::new();

        let mut local = Vec::new();
        let mut remote = Vec::new();
        for request in requests {
            if !seen.insert(request.guid) {
                report.duplicates += 1;
                continue;
            }
            if request.source_local_item.is_some() {
                local.push(request);
            } else if request.download_url.is_some() {
                remote.push(request);
            } else {
                store.delete(&request.guid)?;
                report.deleted.push(request.guid);
            }
        }

        log_baseline_info!(
            "Processing baseline requests",
            local = local.len(),
            remote = remote.len(),
            deleted = report.deleted.len()
        );

        let (download_tx, download_rx) = unbounded::<Outcome>();

        self.download_pool.in_place_scope(|downloads| {
            let submit = |request: BaselineRequest| {
                let tx = download_tx.clone();
                downloads.spawn(move |_| {
                    let _ = tx.send(download_one(store, downloader, request));
                });
            };

            for request in remote {
                if cancel.is_canceled() {
                    break;
                }
                submit(request);
            }

            let (local_tx, local_rx) = unbounded::<Outcome>();
            self.local_pool.scope(|s| {
                for request in local {
                    if cancel.is_canceled() {
                        break;
                    }
                    let tx = local_tx.clone();
                    s.spawn(move |_| {
                        let _ = tx.send(store_local(store, request));
                    });
                }
            });
            drop(local_tx);

            for outcome in local_rx.iter() {
                match outcome {
                    Outcome::LocalFailed(request, _)
                        if request.download_url.is_some() && !cancel.is_canceled() =>
                    {
                        submit(request)
                    }
                    other => record(&mut report, other),
                }
            }
        });
        drop(download_tx);

        for outcome in download_rx.iter() {
            record(&mut report, outcome);
        }

        if cancel.is_canceled() {
            return Err(BaselineError::Canceled);
        }

        if !report.failed.is_empty() {
            log_baseline_warn!("Some baselines failed", failed = report.failed.len());
        }
        Ok(report)
    }
}

fn store_local(store: &BaselineStore, request: BaselineRequest) -> Outcome {
    let Some(source) = request.source_local_item.as_deref() else {
        return Outcome::Failed(request.guid, "no local source".to_string());
    };
    let result = store.store_from_local(
        &request.guid,
        source,
        request.hash.as_ref(),
        request.local_hint.as_deref(),
    );
    match result {
        Ok(stored) => Outcome::Stored(request.guid, stored),
        Err(e) => {
            log_baseline_debug!(
                "Local baseline failed",
                guid = tracing::field::display(request.guid),
                error = tracing::field::display(&e)
            );
            Outcome::LocalFailed(request, e.to_string())
        }
    }
}

fn download_one(
    store: &BaselineStore,
    downloader: Option<&dyn BaselineDownloader>,
    request: BaselineRequest,
) -> Outcome {
    let (Some(downloader), Some(url)) = (downloader, request.download_url.as_deref()) else {
        return Outcome::Failed(request.guid, "no downloader available".to_string());
    };
    let result = downloader
        .download(url)
        .map_err(BaselineError::from)
        .and_then(|mut reader| {
            store.store_from_reader(
                &request.guid,
                &mut reader,
                request.hash.as_ref(),
                request.local_hint.as_deref(),
            )
        });
    match result {
        Ok(stored) => Outcome::Stored(request.guid, stored),
        Err(e) => Outcome::Failed(request.guid, e.to_string()),
    }
}

fn record(report: &mut BatchReport, outcome: Outcome) {
    match outcome {
        Outcome::Stored(guid, stored) => report.stored.push((guid, stored)),
        Outcome::LocalFailed(request, error) => report.failed.push((request.guid, error)),
        Outcome::Failed(guid, error) => report.failed.push((guid, error)),
    }
}
