// crates/vidpress-media/src/worker.rs
//
// CompressWorker: background compression jobs with per-job cancellation.
// Callers that cannot block (a UI, an upload queue) start jobs here and
// drain `rx` for progress and terminal results.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendError, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use vidpress_core::{CancelToken, CompressOptions, CompressResult, CompressionError, QualityTier};

use crate::pipeline::compress_with;

/// Everything needed to run one compression in the background.
#[derive(Clone, Debug)]
pub struct CompressJob {
    pub source:  PathBuf,
    pub tier:    QualityTier,
    pub options: CompressOptions,
}

impl CompressJob {
    pub fn new(source: impl Into<PathBuf>, tier: QualityTier) -> Self {
        Self { source: source.into(), tier, options: CompressOptions::default() }
    }

    pub fn with_options(mut self, options: CompressOptions) -> Self {
        self.options = options;
        self
    }
}

pub struct CompressWorker {
    /// Progress, Done and Error results for every job, tagged by job id.
    pub rx:   Receiver<CompressResult>,
    tx:       Sender<CompressResult>,
    shutdown: CancelToken,
    /// Per-job cancel tokens. Inserted by `start`, removed when the job ends.
    cancels:  Arc<Mutex<HashMap<Uuid, CancelToken>>>,
    /// Joined on drop so no job outlives the worker.
    jobs:     Mutex<Vec<JoinHandle<()>>>,
}

impl Default for CompressWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressWorker {
    pub fn new() -> Self {
        let (tx, rx) = bounded(512);
        Self {
            rx,
            tx,
            shutdown: CancelToken::new(),
            cancels:  Arc::new(Mutex::new(HashMap::new())),
            jobs:     Mutex::new(Vec::new()),
        }
    }

    /// Spawn a thread that runs `job` to completion. The returned token is
    /// the same one `cancel(job_id)` signals.
    pub fn start(&self, job: CompressJob) -> (Uuid, CancelToken) {
        let job_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let tx     = self.tx.clone();
        let sd     = self.shutdown.clone();

        // Register before spawning so a cancel() right after start() is not lost.
        self.cancels.lock().insert(job_id, cancel.clone());

        let cancels_ref = Arc::clone(&self.cancels);
        let token = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("vidpress-job-{}", &job_id.simple().to_string()[..8]))
            .spawn(move || {
                let result = if sd.is_cancelled() {
                    Err(CompressionError::Unknown("worker shutting down".into()))
                } else {
                    let progress_tx = tx.clone();
                    compress_with(&job.source, job.tier, &job.options, &token, |ev| {
                        let _ = progress_tx.send(CompressResult::Progress {
                            job_id,
                            fraction: ev.fraction,
                            message:  ev.message,
                        });
                    })
                };

                // Drop the token before the terminal result so a caller that
                // reacts to Done/Error never sees this job as still cancellable.
                cancels_ref.lock().remove(&job_id);
                let sent = tx.send(match result {
                    Ok(output) => CompressResult::Done { job_id, output },
                    Err(error) => CompressResult::Error { job_id, error },
                });
                if let Err(SendError(unclaimed)) = sent {
                    discard_output(unclaimed);
                }
            });

        match spawned {
            Ok(handle) => {
                let mut jobs = self.jobs.lock();
                jobs.retain(|h| !h.is_finished());
                jobs.push(handle);
            }
            Err(e) => {
                self.cancels.lock().remove(&job_id);
                let _ = self.tx.send(CompressResult::Error {
                    job_id,
                    error: CompressionError::Unknown(format!("spawn job thread: {e}")),
                });
            }
        }
        (job_id, cancel)
    }

    /// Signal the job identified by `job_id` to stop. It finishes its current
    /// sample, cleans up its partial output and reports `Cancelled`.
    /// Unknown or already-finished ids are ignored.
    pub fn cancel(&self, job_id: Uuid) {
        if let Some(token) = self.cancels.lock().get(&job_id) {
            log::info!("[worker] cancel {job_id}");
            token.cancel();
        }
    }

    /// Number of jobs that have not yet produced a terminal result.
    pub fn active_jobs(&self) -> usize {
        self.cancels.lock().len()
    }

    /// Cancel every running job and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for token in self.cancels.lock().values() {
            token.cancel();
        }
    }
}

impl Drop for CompressWorker {
    /// Cancels running jobs and waits for them. A file that finished anyway
    /// but was never received is deleted, since nobody is left to own it.
    fn drop(&mut self) {
        self.shutdown();
        let handles = std::mem::take(self.jobs.get_mut());
        // Keep draining while waiting: a job blocked on a full channel
        // would otherwise never reach its cancel check.
        while !handles.iter().all(|h| h.is_finished()) {
            if let Ok(unclaimed) = self.rx.recv_timeout(Duration::from_millis(10)) {
                discard_output(unclaimed);
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                log::error!("[worker] job thread panicked");
            }
        }
        for unclaimed in self.rx.try_iter() {
            discard_output(unclaimed);
        }
    }
}

/// Delete the file behind a Done result that no caller will see.
fn discard_output(result: CompressResult) {
    if let CompressResult::Done { job_id, output } = result {
        log::warn!("[worker] {job_id} finished with no receiver, removing {}", output.path.display());
        if let Err(e) = std::fs::remove_file(&output.path) {
            log::warn!("[worker] could not remove {}: {e}", output.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_terminal(worker: &CompressWorker, job_id: Uuid) -> CompressResult {
        loop {
            let r = worker.rx.recv_timeout(Duration::from_secs(10)).expect("worker result");
            assert_eq!(r.job_id(), job_id);
            if r.is_terminal() {
                return r;
            }
        }
    }

    #[test]
    fn missing_source_reports_error_and_clears_token() {
        let dir = tempfile::tempdir().unwrap();
        let worker = CompressWorker::new();
        let options = CompressOptions { temp_dir: dir.path().to_path_buf(), ..CompressOptions::default() };
        let (job_id, _token) = worker.start(CompressJob::new("/nope/missing.mov", QualityTier::Low).with_options(options));

        match next_terminal(&worker, job_id) {
            CompressResult::Error { error, .. } => {
                assert!(matches!(error, CompressionError::SourceUnreadable(_)), "{error:?}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(worker.active_jobs(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn jobs_after_shutdown_are_refused() {
        let worker = CompressWorker::new();
        worker.shutdown();
        let (job_id, _) = worker.start(CompressJob::new("/nope/missing.mov", QualityTier::Medium));
        match next_terminal(&worker, job_id) {
            CompressResult::Error { error: CompressionError::Unknown(msg), .. } => {
                assert!(msg.contains("shutting down"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancel_of_unknown_job_is_ignored() {
        let worker = CompressWorker::new();
        worker.cancel(Uuid::new_v4());
        assert_eq!(worker.active_jobs(), 0);
    }

    #[test]
    fn dropping_the_worker_leaves_no_files() {
        if !crate::testclip::encoders_available() {
            eprintln!("mpeg4/aac/h264 encoders missing, skipping");
            return;
        }
        let src = tempfile::tempdir().unwrap();
        let source = src.path().join("source.mp4");
        crate::testclip::write_clip(&source, &crate::testclip::Clip::video(320, 240)).unwrap();
        let out = tempfile::tempdir().unwrap();

        let worker = CompressWorker::new();
        let options = CompressOptions { temp_dir: out.path().to_path_buf(), ..CompressOptions::default() };
        worker.start(CompressJob::new(&source, QualityTier::Original).with_options(options));
        // Nobody reads rx: whether the job was cancelled or had already
        // finished, the drop must leave the directory empty.
        drop(worker);

        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }
}
