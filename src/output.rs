use std::io::{self, Write};

use serde::Serialize;

use crate::dispatch::RunSummary;
use crate::domain::{Outcome, Record, ResolvedTarget};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent<'a> {
    WorkerStarted {
        worker: usize,
        records: usize,
    },
    Processing {
        worker: usize,
        record: &'a Record,
    },
    Attempt {
        worker: usize,
        target: &'a ResolvedTarget,
        attempt: u32,
    },
    Finished {
        worker: usize,
        record: &'a Record,
        outcome: &'a Outcome,
    },
    WorkerFinished {
        worker: usize,
        processed: usize,
    },
}

/// Receives progress from every worker thread.
pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent<'_>);
}

/// Line-per-event console output.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent<'_>) {
        let line = match event {
            ProgressEvent::WorkerStarted { worker, records } => {
                format!("[worker {worker}] starting with {records} records")
            }
            ProgressEvent::Processing { worker, record } => {
                format!("[worker {worker}] processing {} ({})", record.id, record.position)
            }
            ProgressEvent::Attempt {
                worker,
                target,
                attempt,
            } => format!(
                "[worker {worker}]   attempt {attempt} via {}: {}",
                target.source, target.url
            ),
            ProgressEvent::Finished {
                worker,
                record,
                outcome,
            } => match outcome {
                Outcome::Skipped(reason) => {
                    format!("[worker {worker}]   skipped {}: {reason}", record.id)
                }
                Outcome::Migrated(path) => {
                    format!("[worker {worker}]   migrated {} to {path}", record.id)
                }
                Outcome::Success(path) => {
                    format!("[worker {worker}]   saved {} to {path}", record.id)
                }
                Outcome::Failed(reason) => {
                    format!("[worker {worker}]   failed {}: {reason}", record.id)
                }
            },
            ProgressEvent::WorkerFinished { worker, processed } => {
                format!("[worker {worker}] done ({processed} records)")
            }
        };
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Discards progress; used when stdout carries the JSON summary.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent<'_>) {}
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub fn print_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}paper-fetch summary{reset}");
    println!("  records:  {}", summary.total);
    println!("  workers:  {}", summary.workers);
    println!("{green}  success:  {}{reset}", summary.counts.success);
    println!("{green}  migrated: {}{reset}", summary.counts.migrated);
    println!("{yellow}  skipped:  {}{reset}", summary.counts.skipped);
    println!("{red}  failed:   {}{reset}", summary.counts.failed);
    println!("  log:      {}", summary.log_path);
}
