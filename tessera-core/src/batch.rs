//! Many documents on a bounded worker pool.
//!
//! Every document gets its own task, its own child cancellation token and
//! optionally its own deadline. A failed, cancelled or timed-out document
//! never affects the others.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    config::Settings,
    error::{ConversionError, ExitCategory},
    output::{sanitize_doc_name, write_outputs},
    pipeline::{ConversionRequest, ConversionResult, Converter},
};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub workers: usize,
    pub document_timeout: Option<Duration>,
    /// Outputs are written here when set, and only kept in memory otherwise.
    pub output_dir: Option<PathBuf>,
}

impl BatchOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            document_timeout: settings.document_timeout,
            output_dir: settings.output_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DocumentOutput {
    pub result: ConversionResult,
    pub written: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct BatchItem {
    /// Position in the submitted request list.
    pub index: usize,
    pub path: PathBuf,
    pub duration: Duration,
    pub outcome: Result<DocumentOutput, ConversionError>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// One item per request, in submission order.
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = (&BatchItem, &ConversionError)> {
        self.items
            .iter()
            .filter_map(|item| item.outcome.as_ref().err().map(|e| (item, e)))
    }

    /// Most severe failure category, `None` when every document converted.
    pub fn worst_category(&self) -> Option<ExitCategory> {
        self.failed().map(|(_, e)| e.category()).max()
    }

    pub fn exit_code(&self) -> i32 {
        self.worst_category().map_or(0, ExitCategory::exit_code)
    }
}

async fn convert_one(
    converter: &Converter,
    request: &ConversionRequest,
    options: &BatchOptions,
    cancel: CancellationToken,
) -> Result<DocumentOutput, ConversionError> {
    let conversion = converter.convert(request, &cancel);
    let result = match options.document_timeout {
        Some(limit) => match tokio::time::timeout(limit, conversion).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                return Err(ConversionError::Cancelled(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                )));
            }
        },
        None => conversion.await,
    }?;
    let written = match &options.output_dir {
        Some(dir) => write_outputs(&result, dir)?,
        None => Vec::new(),
    };
    Ok(DocumentOutput { result, written })
}

/// Gives documents whose output names would collide distinct names: the
/// extension is appended, then a counter if that still clashes. Names are
/// compared the way they land on disk, sanitized and case-folded.
fn distinct_doc_names(requests: &mut [ConversionRequest]) {
    let key = |name: &str| sanitize_doc_name(name).to_lowercase();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for request in requests.iter() {
        *counts.entry(key(&request.resolved_doc_name())).or_default() += 1;
    }
    let mut taken: HashSet<String> = counts.keys().cloned().collect();

    for (index, request) in requests.iter_mut().enumerate() {
        let name = request.resolved_doc_name();
        if counts.get(&key(&name)).copied().unwrap_or_default() < 2 {
            continue;
        }
        let base = match request.path.extension() {
            Some(ext) => format!("{name}-{}", ext.to_string_lossy()),
            None => name.clone(),
        };
        let mut candidate = base.clone();
        let mut n = index;
        while !taken.insert(key(&candidate)) {
            candidate = format!("{base}-{n}");
            n += 1;
        }
        debug!(path = %request.path.display(), from = %name, to = %candidate, "renamed colliding document");
        request.doc_name = Some(candidate);
    }
}

/// Converts `requests` with at most `options.workers` documents in flight.
///
/// Documents that would write to the same results directory are renamed
/// first, see [`distinct_doc_names`].
///
/// `on_done` is called as each document finishes, in completion order. The
/// returned report lists documents in submission order.
pub async fn convert_batch<F>(
    converter: Arc<Converter>,
    requests: Vec<ConversionRequest>,
    options: BatchOptions,
    cancel: &CancellationToken,
    mut on_done: F,
) -> BatchReport
where
    F: FnMut(&BatchItem),
{
    let started = Instant::now();
    let mut requests = requests;
    distinct_doc_names(&mut requests);
    let total = requests.len();
    let workers = options.workers.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let options = Arc::new(options);
    info!(documents = total, workers, "starting batch");

    let paths: Vec<PathBuf> = requests.iter().map(|r| r.path.clone()).collect();
    let mut tasks = JoinSet::new();
    for (index, request) in requests.into_iter().enumerate() {
        let converter = converter.clone();
        let semaphore = semaphore.clone();
        let options = options.clone();
        let doc_cancel = cancel.child_token();
        let span = tracing::info_span!("document", index, path = %request.path.display());
        tasks.spawn(
            async move {
                let permit = tokio::select! {
                    biased;
                    _ = doc_cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let doc_started = Instant::now();
                let outcome = match permit {
                    Some(_permit) => convert_one(&converter, &request, &options, doc_cancel).await,
                    None => Err(ConversionError::Cancelled("batch".to_owned())),
                };
                BatchItem {
                    index,
                    path: request.path,
                    duration: doc_started.elapsed(),
                    outcome,
                }
            }
            .instrument(span),
        );
    }

    let mut slots: Vec<Option<BatchItem>> = (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(item) => {
                match &item.outcome {
                    Ok(_) => info!(
                        path = %item.path.display(),
                        "converted in {}ms",
                        item.duration.as_millis()
                    ),
                    Err(e) => warn!(path = %item.path.display(), stage = %e.stage(), "failed: {e}"),
                }
                on_done(&item);
                let index = item.index;
                slots[index] = Some(item);
            }
            Err(e) => error!("batch worker crashed: {e}"),
        }
    }

    let items: Vec<BatchItem> = slots
        .into_iter()
        .zip(paths)
        .enumerate()
        .map(|(index, (slot, path))| {
            slot.unwrap_or_else(|| BatchItem {
                index,
                path,
                duration: Duration::ZERO,
                outcome: Err(ConversionError::Internal("worker task crashed".to_owned())),
            })
        })
        .collect();
    let report = BatchReport { items };
    info!(
        succeeded = report.succeeded(),
        failed = total - report.succeeded(),
        "batch done in {}ms",
        started.elapsed().as_millis()
    );
    report
}
