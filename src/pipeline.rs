//! The three-stage cooperative pipeline (`Prepare → Run → Download`) that drives every
//! instance through its lifecycle (§2 System Overview; §4.9). Built directly on
//! `crossbeam_channel::bounded(1)` hand-off channels and `std::thread` worker pools,
//! generalizing `bench-harness::worker::WorkerPool` (one undifferentiated pool) into an
//! ordered sequence of per-stage pools, matching the queue-per-boundary shape of
//! `examples/original_source/grevling/workflow/__init__.py`'s `Pipe`/`Pipeline`
//! (`asyncio.Queue(maxsize=1)` per stage boundary).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info};

/// Per-stage and overall completion counts after a pipeline run drains.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub submitted: usize,
    pub prepared: usize,
    pub ran: usize,
    pub downloaded: usize,
    pub failed: usize,
}

/// Runs `items` through three stages with `n_prepare`/`n_run`/`n_download` worker threads per
/// stage, each stage's output bounded-(1)-channel-fed into the next. A stage closure returns
/// `Ok(true)` to advance the item, `Ok(false)` to drop it (counted as failed, not re-raised),
/// or `Err` to abort that item's progress through the pipeline (also counted as failed).
///
/// Cancellation is cooperative: `should_stop` is polled between items; in-flight subprocess
/// work is expected to poll it too (see `command::Command::execute`). A single-threaded
/// configuration (`n_prepare == n_run == n_download == 1`) is a valid degenerate case.
pub fn run_pipeline<T, P, R, D>(
    items: Vec<T>,
    n_prepare: usize,
    n_run: usize,
    n_download: usize,
    prepare: P,
    run: R,
    download: D,
    should_stop: Arc<dyn Fn() -> bool + Send + Sync>,
) -> PipelineReport
where
    T: Send + 'static,
    P: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    R: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    D: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    let submitted = items.len();
    let prepared = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));
    let downloaded = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let (to_prepare_tx, to_prepare_rx) = bounded::<T>(1);
    let (to_run_tx, to_run_rx) = bounded::<T>(1);
    let (to_download_tx, to_download_rx) = bounded::<T>(1);

    let prepare = Arc::new(prepare);
    let run = Arc::new(run);
    let download = Arc::new(download);

    let prepare_workers = spawn_stage(
        "prepare",
        n_prepare,
        to_prepare_rx,
        Some(to_run_tx),
        prepare,
        Arc::clone(&prepared),
        Arc::clone(&failed),
        Arc::clone(&should_stop),
    );
    let run_workers = spawn_stage(
        "run",
        n_run,
        to_run_rx,
        Some(to_download_tx),
        run,
        Arc::clone(&ran),
        Arc::clone(&failed),
        Arc::clone(&should_stop),
    );
    let download_workers = spawn_stage(
        "download",
        n_download,
        to_download_rx,
        None,
        download,
        Arc::clone(&downloaded),
        Arc::clone(&failed),
        Arc::clone(&should_stop),
    );

    for item in items {
        if should_stop.as_ref()() {
            failed.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        if to_prepare_tx.send(item).is_err() {
            break;
        }
    }
    drop(to_prepare_tx);

    for handle in prepare_workers {
        let _ = handle.join();
    }
    for handle in run_workers {
        let _ = handle.join();
    }
    for handle in download_workers {
        let _ = handle.join();
    }

    PipelineReport {
        submitted,
        prepared: prepared.load(Ordering::SeqCst),
        ran: ran.load(Ordering::SeqCst),
        downloaded: downloaded.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_stage<T, F>(
    stage_name: &'static str,
    n_workers: usize,
    input: Receiver<T>,
    output: Option<Sender<T>>,
    action: Arc<F>,
    npiped: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    should_stop: Arc<dyn Fn() -> bool + Send + Sync>,
) -> Vec<std::thread::JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    (0..n_workers.max(1))
        .map(|worker_id| {
            let input = input.clone();
            let output = output.clone();
            let action = Arc::clone(&action);
            let npiped = Arc::clone(&npiped);
            let failed = Arc::clone(&failed);
            let should_stop = Arc::clone(&should_stop);
            std::thread::Builder::new()
                .name(format!("grevling-{stage_name}-{worker_id}"))
                .spawn(move || {
                    while let Ok(item) = input.recv() {
                        if should_stop.as_ref()() {
                            failed.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        let outcome = action(&item);
                        match outcome {
                            Ok(true) => {
                                npiped.fetch_add(1, Ordering::SeqCst);
                                if let Some(out) = &output {
                                    if out.send(item).is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(false) => {
                                failed.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => {
                                error!(stage = stage_name, error = %e, "pipeline stage failed");
                                failed.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                    info!(stage = stage_name, worker = worker_id, "pipeline worker exiting");
                })
                .expect("spawning pipeline worker thread")
        })
        .collect()
}

/// Shared cooperative-cancellation flag, set from a `ctrlc` handler (see `src/lib.rs`).
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn as_predicate(&self) -> Arc<dyn Fn() -> bool + Send + Sync> {
        let flag = self.0.clone();
        Arc::new(move || flag.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn all_items_flow_through_three_stages() {
        let seen = Arc::new(Mutex::new(vec![]));
        let seen_clone = Arc::clone(&seen);
        let cancel = CancelFlag::new();
        let report = run_pipeline(
            vec![1, 2, 3, 4],
            2,
            2,
            1,
            |_: &i32| Ok(true),
            |_: &i32| Ok(true),
            move |item: &i32| {
                seen_clone.lock().unwrap().push(*item);
                Ok(true)
            },
            cancel.as_predicate(),
        );
        assert_eq!(report.submitted, 4);
        assert_eq!(report.prepared, 4);
        assert_eq!(report.ran, 4);
        assert_eq!(report.downloaded, 4);
        assert_eq!(report.failed, 0);
        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[test]
    fn failures_are_counted_and_stop_propagation() {
        let cancel = CancelFlag::new();
        let report = run_pipeline(
            vec![1, 2, 3],
            1,
            1,
            1,
            |item: &i32| Ok(*item != 2),
            |_: &i32| Ok(true),
            |_: &i32| Ok(true),
            cancel.as_predicate(),
        );
        assert_eq!(report.submitted, 3);
        assert_eq!(report.prepared, 2);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn cancel_flag_short_circuits_remaining_submissions() {
        let cancel = CancelFlag::new();
        cancel.trigger();
        let report = run_pipeline(vec![1, 2, 3], 1, 1, 1, |_: &i32| Ok(true), |_: &i32| Ok(true), |_: &i32| Ok(true), cancel.as_predicate());
        assert_eq!(report.failed, 3);
        assert_eq!(report.downloaded, 0);
    }
}
