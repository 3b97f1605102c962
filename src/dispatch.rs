use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::acquire::Acquirer;
use crate::config::RunConfig;
use crate::domain::{Outcome, OutcomeRow, Record, ResolvedTarget, Status};
use crate::error::HarvestError;
use crate::output::{ProgressEvent, ProgressSink};
use crate::placement::{Placement, Plan};
use crate::poll::purge_dir;
use crate::resolver::{OaLookup, Resolver};
use crate::result_log::ResultLog;
use crate::retry::RetryPolicy;
use crate::session::SessionFactory;

/// Splits `items` into exactly `workers` contiguous chunks in input order.
/// The first `len % workers` chunks get one extra item; trailing chunks may
/// be empty when there are more workers than items.
pub fn partition<T>(items: &[T], workers: usize) -> Vec<&[T]> {
    let workers = workers.max(1);
    let base = items.len() / workers;
    let extra = items.len() % workers;
    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    for index in 0..workers {
        let len = base + usize::from(index < extra);
        chunks.push(&items[start..start + len]);
        start += len;
    }
    chunks
}

/// A worker's private download directory, removed when dropped.
#[derive(Debug)]
pub struct WorkerScratch {
    path: PathBuf,
}

impl WorkerScratch {
    pub fn create(root: &Utf8Path, worker: usize) -> Result<Self, HarvestError> {
        let path = root.as_std_path().join(format!("worker_{worker}"));
        fs::create_dir_all(&path)
            .map_err(|err| HarvestError::Filesystem(format!("{}: {err}", path.display())))?;
        purge_dir(&path)
            .map_err(|err| HarvestError::Filesystem(format!("{}: {err}", path.display())))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkerScratch {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub success: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl StatusCounts {
    fn record(&mut self, status: Status) {
        match status {
            Status::Success => self.success += 1,
            Status::Migrated => self.migrated += 1,
            Status::Skipped => self.skipped += 1,
            Status::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: StatusCounts) {
        self.success += other.success;
        self.migrated += other.migrated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.success + self.migrated + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub workers: usize,
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub log_path: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Runs every record through placement, resolution and acquisition on a
/// fixed set of worker threads, one contiguous chunk per worker.
pub struct Dispatcher<'a, L: OaLookup, F: SessionFactory> {
    config: &'a RunConfig,
    resolver: &'a Resolver<L>,
    factory: &'a F,
    placement: &'a Placement,
    log: &'a ResultLog,
    sink: &'a dyn ProgressSink,
    retry: RetryPolicy,
}

impl<'a, L: OaLookup, F: SessionFactory> Dispatcher<'a, L, F> {
    pub fn new(
        config: &'a RunConfig,
        resolver: &'a Resolver<L>,
        factory: &'a F,
        placement: &'a Placement,
        log: &'a ResultLog,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            config,
            resolver,
            factory,
            placement,
            log,
            sink,
            retry: RetryPolicy::new(config.max_attempts),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn run(&self, records: &[Record]) -> Result<RunSummary, HarvestError> {
        let started_at = Utc::now();
        fs::create_dir_all(self.config.scratch_root.as_std_path()).map_err(|err| {
            HarvestError::Filesystem(format!("{}: {err}", self.config.scratch_root))
        })?;

        let chunks = partition(records, self.config.workers);
        info!(
            records = records.len(),
            workers = self.config.workers,
            "dispatching"
        );

        let mut counts = StatusCounts::default();
        thread::scope(|scope| {
            let mut handles = Vec::new();
            for (worker, chunk) in chunks.iter().copied().enumerate() {
                if chunk.is_empty() {
                    continue;
                }
                let spawned = thread::Builder::new()
                    .name(format!("worker-{worker}"))
                    .spawn_scoped(scope, move || self.run_worker(worker, chunk));
                match spawned {
                    Ok(handle) => handles.push((worker, handle)),
                    Err(err) => {
                        error!(worker, error = %err, "failed to spawn worker; running inline");
                        counts.merge(self.run_worker(worker, chunk));
                    }
                }
            }
            for (worker, handle) in handles {
                match handle.join() {
                    Ok(worker_counts) => counts.merge(worker_counts),
                    Err(_) => error!(worker, "worker panicked"),
                }
            }
        });

        let finished_at = Utc::now();
        info!(
            success = counts.success,
            migrated = counts.migrated,
            skipped = counts.skipped,
            failed = counts.failed,
            "run complete"
        );
        Ok(RunSummary {
            total: records.len(),
            workers: self.config.workers,
            counts,
            log_path: self.log.path().to_string(),
            started_at,
            finished_at,
        })
    }

    #[instrument(name = "worker", skip(self, chunk), fields(records = chunk.len()))]
    fn run_worker(&self, worker: usize, chunk: &[Record]) -> StatusCounts {
        self.sink.event(ProgressEvent::WorkerStarted {
            worker,
            records: chunk.len(),
        });
        let mut counts = StatusCounts::default();

        let scratch = match WorkerScratch::create(&self.config.scratch_root, worker) {
            Ok(scratch) => scratch,
            Err(err) => {
                error!(error = %err, "scratch directory unavailable");
                let outcome = Outcome::Failed(format!("scratch directory unavailable: {err}"));
                for record in chunk {
                    self.emit(worker, record, None, &outcome);
                    counts.record(outcome.status());
                }
                return counts;
            }
        };
        let mut acquirer = Acquirer::new(
            self.factory,
            scratch.path(),
            self.config.poll_interval,
            self.config.download_timeout,
        );

        for record in chunk {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.process(&mut acquirer, worker, record)
            }));
            let (outcome, target) = match result {
                Ok(result) => result,
                Err(_) => {
                    error!(id = %record.id, "record processing panicked");
                    (Outcome::Failed("internal error".to_string()), None)
                }
            };
            self.emit(worker, record, target.as_ref(), &outcome);
            counts.record(outcome.status());
        }

        acquirer.shutdown();
        drop(acquirer);
        drop(scratch);
        self.sink.event(ProgressEvent::WorkerFinished {
            worker,
            processed: chunk.len(),
        });
        counts
    }

    fn emit(
        &self,
        worker: usize,
        record: &Record,
        target: Option<&ResolvedTarget>,
        outcome: &Outcome,
    ) {
        let row = OutcomeRow::new(record, target, outcome);
        if let Err(err) = self.log.append(&row) {
            error!(id = %record.id, error = %err, "failed to append result row");
        }
        self.sink.event(ProgressEvent::Finished {
            worker,
            record,
            outcome,
        });
    }

    fn process(
        &self,
        acquirer: &mut Acquirer<'_, F>,
        worker: usize,
        record: &Record,
    ) -> (Outcome, Option<ResolvedTarget>) {
        if record.id.is_empty() {
            return (Outcome::Failed("missing identifier".to_string()), None);
        }
        self.sink.event(ProgressEvent::Processing { worker, record });

        let final_path = match self.placement.plan(record) {
            Ok(Plan::AlreadyDone(path)) => {
                debug!(id = %record.id, path = %path, "already downloaded");
                return (Outcome::Skipped("already exists".to_string()), None);
            }
            Ok(Plan::Migrated(path)) => return (Outcome::Migrated(path), None),
            Ok(Plan::NeedsFetch(path)) => path,
            Err(err) => return (Outcome::Failed(err.to_string()), None),
        };

        let Some(target) = self.resolver.resolve(record) else {
            return (Outcome::Failed("no url".to_string()), None);
        };
        debug!(id = %record.id, source = %target.source, url = %target.url, "resolved");

        let mut attempt = 1;
        loop {
            self.sink.event(ProgressEvent::Attempt {
                worker,
                target: &target,
                attempt,
            });
            match acquirer.fetch(&target.url) {
                Ok(file) => {
                    let outcome = match self.placement.commit(&file, &final_path) {
                        Ok(()) => Outcome::Success(final_path),
                        Err(err) => Outcome::Failed(err.to_string()),
                    };
                    return (outcome, Some(target));
                }
                Err(failure) => {
                    let delay = failure
                        .is_retryable()
                        .then(|| self.retry.delay_after(attempt))
                        .flatten();
                    match delay {
                        Some(delay) => {
                            warn!(
                                id = %record.id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                reason = %failure,
                                "retrying"
                            );
                            thread::sleep(delay);
                            attempt += 1;
                        }
                        None => return (Outcome::Failed(failure.to_string()), Some(target)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_even_and_uneven() {
        let items = (0..10).collect::<Vec<_>>();
        let chunks = partition(&items, 3);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![4, 3, 3]);
        assert_eq!(chunks.concat(), items);
    }

    #[test]
    fn partition_single_worker() {
        let items = (0..5).collect::<Vec<_>>();
        let chunks = partition(&items, 1);
        assert_eq!(chunks, vec![&items[..]]);
    }

    #[test]
    fn partition_more_workers_than_items() {
        let items = vec!['a', 'b'];
        let chunks = partition(&items, 5);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks.iter().filter(|c| !c.is_empty()).count(), 2);
        assert_eq!(chunks.concat(), items);
    }

    #[test]
    fn partition_is_lossless_for_many_shapes() {
        for len in 0..40 {
            let items = (0..len).collect::<Vec<_>>();
            for workers in 1..12 {
                let chunks = partition(&items, workers);
                assert_eq!(chunks.concat(), items);
                let sizes = chunks.iter().map(|c| c.len()).collect::<Vec<_>>();
                let max = sizes.iter().max().copied().unwrap_or(0);
                let min = sizes.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn scratch_is_removed_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let scratch = WorkerScratch::create(root, 3).unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.ends_with("worker_3"));
        fs::write(path.join("left.pdf"), b"x").unwrap();
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn scratch_creation_clears_leftovers() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        fs::create_dir_all(temp.path().join("worker_0")).unwrap();
        fs::write(temp.path().join("worker_0/old.pdf"), b"x").unwrap();
        let scratch = WorkerScratch::create(root, 0).unwrap();
        assert!(!scratch.path().join("old.pdf").exists());
    }
}
