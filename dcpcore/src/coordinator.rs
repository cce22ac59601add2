// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Dispatches prepared frames to local and remote workers, enforcing
//! backpressure and ordering handoff to the [`crate::writer::Writer`]
//! (spec §4.6).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, warn};

use crate::discovery::{ServerFinder, ServerFound};
use crate::error::CoreError;
use crate::frame_cache::FrameCache;
use crate::j2k::J2kEncoder;
use crate::local_worker::encode_local;
use crate::model::{EncodeQueueEntry, Eye, PcmBlock, PreparedFrame, ServerDescription};
use crate::remote_client::{Backoff, encode_remote};
use crate::writer::Writer;

/// Sliding window size for [`EncodeCoordinator::current_rate`] (spec §4.6).
const RATE_WINDOW: usize = 25;

/// Consecutive failures before a worker gives up on its binding (spec §4.6).
const MAX_CONSECUTIVE_FAILURES: u32 = 4;

/// Which path a worker thread is bound to.
#[derive(Clone)]
enum WorkerBinding {
    Local,
    Remote(ServerDescription),
}

struct Queue {
    entries: VecDeque<EncodeQueueEntry>,
    cap: usize,
}

/// State shared by every worker thread, held behind an `Arc`.
struct Shared {
    queue: Mutex<Queue>,
    not_full: Condvar,
    not_empty: Condvar,
    terminate: AtomicBool,
    writer: Writer,
    encoder: Box<dyn J2kEncoder>,
    frame_cache: Option<Mutex<FrameCache>>,
    prior_essence_path: Option<PathBuf>,
    j2k_bandwidth: u64,
    fps: u32,
    protocol_version: u32,
    completions: Mutex<VecDeque<Instant>>,
}

impl Shared {
    fn record_completion(&self) {
        let mut completions = self.completions.lock().expect("completions mutex poisoned");
        completions.push_back(Instant::now());
        while completions.len() > RATE_WINDOW {
            completions.pop_front();
        }
    }

    fn dequeue(&self) -> Option<EncodeQueueEntry> {
        let mut queue = self.queue.lock().expect("queue mutex poisoned");
        loop {
            if let Some(entry) = queue.entries.pop_front() {
                self.not_full.notify_all();
                return Some(entry);
            }
            if self.terminate.load(Ordering::SeqCst) {
                return None;
            }
            queue = self.not_empty.wait(queue).expect("queue mutex poisoned");
        }
    }

    fn requeue_front(&self, entry: EncodeQueueEntry) {
        let mut queue = self.queue.lock().expect("queue mutex poisoned");
        queue.entries.push_front(entry);
        self.not_empty.notify_all();
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().expect("queue mutex poisoned").entries.is_empty()
    }

    fn lookup_cache(&self, index: u32, eye: Eye) -> Option<crate::model::FrameInfo> {
        let cache = self.frame_cache.as_ref()?;
        let mut cache = cache.lock().expect("frame cache mutex poisoned");
        if index >= cache.first_missing() {
            return None;
        }
        cache.lookup(index, eye).ok().flatten()
    }

    fn run_worker(&self, binding: &WorkerBinding) {
        let mut backoff = Backoff::default();
        let mut consecutive_failures = 0u32;

        while let Some(entry) = self.dequeue() {
            match entry {
                EncodeQueueEntry::Full { index, eye, frame } => {
                    let result = match binding {
                        WorkerBinding::Local => {
                            encode_local(self.encoder.as_ref(), index, &frame, self.j2k_bandwidth, self.fps)
                        }
                        WorkerBinding::Remote(server) => encode_remote(
                            index,
                            &frame,
                            server,
                            self.protocol_version,
                            self.j2k_bandwidth,
                            self.fps,
                        ),
                    };
                    match result {
                        Ok(encoded) => {
                            consecutive_failures = 0;
                            backoff.record_success();
                            self.writer
                                .write_video(encoded.index(), encoded.eye(), encoded.data().clone());
                            self.record_completion();
                        }
                        Err(err @ CoreError::Protocol(_)) => {
                            warn!(index, ?eye, %err, "server protocol mismatch, marking unusable");
                            self.requeue_front(EncodeQueueEntry::Full { index, eye, frame });
                            return;
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            backoff.record_failure();
                            warn!(index, ?eye, %err, consecutive_failures, "encode attempt failed, requeuing");
                            self.requeue_front(EncodeQueueEntry::Full { index, eye, frame });
                            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                                warn!("worker giving up after repeated failures");
                                return;
                            }
                            thread::sleep(backoff.duration());
                        }
                    }
                }
                EncodeQueueEntry::Fake { index, eye } => {
                    if let (Some(info), Some(path)) =
                        (self.lookup_cache(index, eye), self.prior_essence_path.as_ref())
                    {
                        if let Err(err) = self.writer.fake_write(index, eye, path, info) {
                            warn!(index, ?eye, %err, "fake write failed");
                        }
                    }
                    self.record_completion();
                }
                EncodeQueueEntry::Repeat { index, eye } => {
                    self.writer.repeat(index, eye);
                    self.record_completion();
                }
            }

            if self.terminate.load(Ordering::SeqCst) && self.queue_is_empty() {
                break;
            }
        }
    }
}

/// Mutable submission-side state: the index/eye cursor and whether the last
/// submitted entry was a real encode (needed for `same_as_previous`).
struct SubmissionCursor {
    next: (u32, Eye),
    stereoscopic: bool,
    last_was_full: bool,
}

impl SubmissionCursor {
    fn new(stereoscopic: bool) -> Self {
        Self {
            next: (0, if stereoscopic { Eye::Left } else { Eye::Mono }),
            stereoscopic,
            last_was_full: false,
        }
    }

    fn advance(&mut self) -> (u32, Eye) {
        let key = self.next;
        self.next = if self.stereoscopic {
            match key.1 {
                Eye::Left => (key.0, Eye::Right),
                _ => (key.0 + 1, Eye::Left),
            }
        } else {
            (key.0 + 1, Eye::Mono)
        };
        key
    }
}

/// Owns the work queue, the worker pool, and the dynamically-growing set of
/// remote bindings discovered via the [`ServerFinder`] (spec §4.6).
pub struct EncodeCoordinator {
    shared: Arc<Shared>,
    cursor: Mutex<SubmissionCursor>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    server_finder: Mutex<Option<ServerFinder>>,
    finder_relay: Mutex<Option<JoinHandle<()>>>,
}

impl EncodeCoordinator {
    /// Builds an un-started coordinator.
    ///
    /// `frame_cache` and `prior_essence_path` are `Some` only when resuming
    /// from a previous run's FrameInfo file (spec §4.8).
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: Writer,
        encoder: Box<dyn J2kEncoder>,
        queue_cap: usize,
        j2k_bandwidth: u64,
        fps: u32,
        protocol_version: u32,
        stereoscopic: bool,
        frame_cache: Option<FrameCache>,
        prior_essence_path: Option<PathBuf>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: VecDeque::new(),
                cap: queue_cap.max(1),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            terminate: AtomicBool::new(false),
            writer,
            encoder,
            frame_cache: frame_cache.map(Mutex::new),
            prior_essence_path,
            j2k_bandwidth,
            fps,
            protocol_version,
            completions: Mutex::new(VecDeque::new()),
        });
        Self {
            shared,
            cursor: Mutex::new(SubmissionCursor::new(stereoscopic)),
            handles: Arc::new(Mutex::new(Vec::new())),
            server_finder: Mutex::new(None),
            finder_relay: Mutex::new(None),
        }
    }

    /// Spawns `local_threads` local workers and, if `discovery` is given,
    /// starts the [`ServerFinder`] and binds one thread per advertised
    /// remote-server thread as servers are discovered (spec §4.6).
    pub fn begin(&self, local_threads: u32, discovery: Option<(u16, bool, Vec<String>)>) {
        let mut handles = self.handles.lock().expect("handles mutex poisoned");
        for _ in 0..local_threads.max(1) {
            let shared = Arc::clone(&self.shared);
            handles.push(thread::spawn(move || shared.run_worker(&WorkerBinding::Local)));
        }
        drop(handles);

        if let Some((port_base, use_any_servers, explicit_servers)) = discovery {
            let (finder, events) = ServerFinder::start(port_base, use_any_servers, explicit_servers);
            *self.server_finder.lock().expect("server finder mutex poisoned") = Some(finder);

            let shared = Arc::clone(&self.shared);
            let handles = Arc::clone(&self.handles);
            let relay = thread::spawn(move || {
                for ServerFound(server) in events {
                    debug!(
                        host = server.host(),
                        port = server.port(),
                        threads = server.thread_count(),
                        "binding remote worker threads"
                    );
                    for _ in 0..server.thread_count().max(1) {
                        let shared = Arc::clone(&shared);
                        let binding = WorkerBinding::Remote(server.clone());
                        let handle = thread::spawn(move || shared.run_worker(&binding));
                        handles.lock().expect("handles mutex poisoned").push(handle);
                    }
                }
            });
            *self.finder_relay.lock().expect("finder relay mutex poisoned") = Some(relay);
        }
    }

    /// Submits one prepared picture frame (spec §4.6).
    pub fn submit_video(&self, frame: PreparedFrame, same_as_previous: bool) {
        let mut queue = self.shared.queue.lock().expect("queue mutex poisoned");
        while queue.entries.len() >= queue.cap && !self.shared.terminate.load(Ordering::SeqCst) {
            queue = self.shared.not_full.wait(queue).expect("queue mutex poisoned");
        }
        if self.shared.terminate.load(Ordering::SeqCst) {
            return;
        }

        let mut cursor = self.cursor.lock().expect("cursor mutex poisoned");
        let (index, eye) = cursor.advance();

        let entry = if self.shared.lookup_cache(index, eye).is_some() {
            cursor.last_was_full = false;
            EncodeQueueEntry::Fake { index, eye }
        } else if same_as_previous && cursor.last_was_full {
            cursor.last_was_full = false;
            EncodeQueueEntry::Repeat { index, eye }
        } else {
            cursor.last_was_full = true;
            EncodeQueueEntry::Full {
                index,
                eye,
                frame: Box::new(frame),
            }
        };
        drop(cursor);

        queue.entries.push_back(entry);
        self.shared.not_empty.notify_all();
    }

    /// Forwards `block` to the Writer's audio segment (spec §4.6).
    pub fn submit_audio(&self, block: &PcmBlock) {
        self.shared.writer.write_audio(block);
    }

    /// Sliding-window frames-per-second estimate over the last 25
    /// completions (spec §4.6).
    #[must_use]
    pub fn current_rate(&self) -> f64 {
        let completions = self.shared.completions.lock().expect("completions mutex poisoned");
        if completions.len() < 2 {
            return 0.0;
        }
        let span = completions
            .back()
            .unwrap()
            .duration_since(*completions.front().unwrap())
            .as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (completions.len() - 1) as f64 / span
    }

    /// Sets the terminate flag and wakes every waiter, without joining
    /// threads. Used by cancellation (spec §5, §4.9).
    pub fn cancel(&self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
    }

    /// Waits for the queue to drain, terminates workers, stops discovery,
    /// and flushes the Writer (spec §4.6).
    ///
    /// # Errors
    /// * Returns the Writer's first recorded write error, if any.
    pub fn finish(self) -> Result<(), CoreError> {
        while !self.shared.queue_is_empty() {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        self.cancel();

        // The finder must be stopped (dropping its event sender) before the
        // relay thread's `for ServerFound(..) in events` loop can observe
        // the channel closing and return.
        if let Some(mut finder) = self.server_finder.lock().expect("server finder mutex poisoned").take() {
            finder.stop();
        }
        if let Some(relay) = self.finder_relay.lock().expect("finder relay mutex poisoned").take() {
            let _ = relay.join();
        }
        for handle in self.handles.lock().expect("handles mutex poisoned").drain(..) {
            let _ = handle.join();
        }

        let shared = Arc::try_unwrap(self.shared)
            .unwrap_or_else(|_| panic!("worker threads still hold a coordinator reference after join"));
        shared.writer.finish()
    }
}
