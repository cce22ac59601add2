// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Runs one long-lived operation at a time from an ordered backlog, with
//! progress and cancellation (spec §4.9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::error::CoreError;

/// Poll interval of the [`JobManager`] scheduler thread (spec §4.9).
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Lifecycle of a single [`Job`] (spec §4.9).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    /// Queued, not yet started.
    New,
    /// Currently executing on its own thread.
    Running,
    /// Completed without error.
    FinishedOk,
    /// Completed with an error, captured on the job.
    FinishedError,
    /// Cancelled before or during execution.
    FinishedCancelled,
}

impl JobState {
    /// Whether this state is one of the three terminal states.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::FinishedOk | JobState::FinishedError | JobState::FinishedCancelled
        )
    }
}

struct JobShared {
    state: Mutex<JobState>,
    progress: Mutex<f32>,
    error: Mutex<Option<String>>,
    cancel: AtomicBool,
}

/// One queued or running operation. Cloning shares the same underlying
/// state, matching the handle-to-background-work pattern a GUI caller binds
/// against (spec §4.9).
#[derive(Clone)]
pub struct Job {
    name: String,
    shared: Arc<JobShared>,
}

/// What a job's body reports back to its [`Job`] handle while it runs.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    /// Updates the fractional progress in `[0.0, 1.0]`.
    pub fn set_progress(&self, value: f32) {
        *self.shared.progress.lock().expect("progress mutex poisoned") = value.clamp(0.0, 1.0);
    }

    /// Whether the job has been asked to cancel; long-running bodies should
    /// poll this between frames.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }
}

impl Job {
    fn new(name: String) -> Self {
        Self {
            name,
            shared: Arc::new(JobShared {
                state: Mutex::new(JobState::New),
                progress: Mutex::new(0.0),
                error: Mutex::new(None),
                cancel: AtomicBool::new(false),
            }),
        }
    }

    /// The job's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> JobState {
        *self.shared.state.lock().expect("state mutex poisoned")
    }

    /// Fractional progress in `[0.0, 1.0]` as last reported by the job body.
    #[must_use]
    pub fn progress(&self) -> f32 {
        *self.shared.progress.lock().expect("progress mutex poisoned")
    }

    /// The captured error message, if the job finished in the error state.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.shared.error.lock().expect("error mutex poisoned").clone()
    }

    /// Requests cancellation. Has no effect once the job has finished.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    fn handle(&self) -> JobHandle {
        JobHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn set_state(&self, state: JobState) {
        *self.shared.state.lock().expect("state mutex poisoned") = state;
    }
}

type JobBody = Box<dyn FnOnce(&JobHandle) -> Result<(), CoreError> + Send + 'static>;

struct QueuedJob {
    job: Job,
    body: Option<JobBody>,
}

/// Holds an ordered backlog of jobs and runs at most one at a time on a
/// dedicated thread per job, polled by a one-second scheduler (spec §4.9).
pub struct JobManager {
    queue: Arc<Mutex<Vec<QueuedJob>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl JobManager {
    /// Creates an empty manager and starts its scheduler thread.
    #[must_use]
    pub fn start() -> Self {
        let queue = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let scheduler = {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            thread::spawn(move || scheduler_loop(&queue, &stop))
        };

        Self {
            queue,
            scheduler: Mutex::new(Some(scheduler)),
            stop,
        }
    }

    /// Appends a new job running `body`, returning a handle the caller can
    /// poll or cancel.
    pub fn add<F>(&self, name: impl Into<String>, body: F) -> Job
    where
        F: FnOnce(&JobHandle) -> Result<(), CoreError> + Send + 'static,
    {
        let job = Job::new(name.into());
        let mut queue = self.queue.lock().expect("job queue mutex poisoned");
        queue.push(QueuedJob {
            job: job.clone(),
            body: Some(Box::new(body)),
        });
        job
    }

    /// Snapshot of every job the manager has ever held, in submission order.
    #[must_use]
    pub fn jobs(&self) -> Vec<Job> {
        self.queue
            .lock()
            .expect("job queue mutex poisoned")
            .iter()
            .map(|q| q.job.clone())
            .collect()
    }

    /// Stops the scheduler thread. Already-running jobs are left to finish
    /// on their own threads.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.scheduler.lock().expect("scheduler mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scheduler_loop(queue: &Arc<Mutex<Vec<QueuedJob>>>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let already_running = {
            let guard = queue.lock().expect("job queue mutex poisoned");
            guard.iter().any(|q| q.job.status() == JobState::Running)
        };

        if !already_running {
            let next = {
                let mut guard = queue.lock().expect("job queue mutex poisoned");
                guard
                    .iter_mut()
                    .find(|q| q.job.status() == JobState::New)
                    .and_then(|q| q.body.take().map(|body| (q.job.clone(), body)))
            };

            if let Some((job, body)) = next {
                run_job(job, body);
            }
        }

        thread::sleep(SCHEDULER_TICK);
    }
}

fn run_job(job: Job, body: JobBody) {
    if job.handle().is_cancelled() {
        job.set_state(JobState::FinishedCancelled);
        return;
    }

    job.set_state(JobState::Running);
    debug!(name = job.name(), "job started");
    let handle = job.handle();

    // Each job runs on its own thread so the scheduler's one-second poll
    // loop never blocks on job work.
    let runner = thread::spawn(move || body(&handle));
    match runner.join() {
        Ok(Ok(())) => {
            if job.handle().is_cancelled() {
                job.set_state(JobState::FinishedCancelled);
            } else {
                job.set_state(JobState::FinishedOk);
            }
        }
        Ok(Err(CoreError::Cancelled)) => {
            job.set_state(JobState::FinishedCancelled);
        }
        Ok(Err(err)) => {
            error!(name = job.name(), %err, "job failed");
            *job.shared.error.lock().expect("error mutex poisoned") = Some(err.to_string());
            job.set_state(JobState::FinishedError);
        }
        Err(_panic) => {
            *job.shared.error.lock().expect("error mutex poisoned") = Some("job thread panicked".to_string());
            job.set_state(JobState::FinishedError);
        }
    }
}
