//! # Background GC Worker
//!
//! When `background_gc` is on, collection cycles requested by the allocator
//! run on a dedicated thread instead of the thread that crossed the
//! threshold.
//!
//! ```text
//!  Database op ── take_gc_request() ──► GcRequests::request()
//!                                             │ GcMessage::Collect
//!                                             ▼
//!                                 ┌──────────────────────┐
//!                                 │ shadowstore-gc thread│
//!                                 │  collect() under the │
//!                                 │  storage + engine    │
//!                                 │  locks               │
//!                                 └──────────┬───────────┘
//!                                            │ Result<usize>
//!                                            ▼
//!                               GcWorker::wait() (await_background_gc)
//! ```
//!
//! The worker takes the same locks as a synchronous collection, so a cycle
//! never overlaps a commit. The mark bitmaps live on the worker's stack for
//! the duration of a cycle.
//!
//! Requests are sent through [`GcRequests`], which needs no lock: operations
//! that hold the engine lock can queue a cycle while another thread sits in
//! [`GcWorker::wait`]. A request made while a cycle is still queued is
//! dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info_span, warn};

pub(crate) enum GcMessage {
    Collect,
    Shutdown,
}

#[derive(Default)]
struct Counters {
    /// A `Collect` message is waiting in the channel.
    queued: AtomicBool,
    /// `Collect` messages sent so far.
    sent: AtomicUsize,
}

/// Sending side of the worker, safe to use under any lock.
#[derive(Clone)]
pub(crate) struct GcRequests {
    commands: Sender<GcMessage>,
    counters: Arc<Counters>,
}

impl GcRequests {
    /// Queues a collection unless one is already waiting.
    pub fn request(&self) -> Result<()> {
        if self.counters.queued.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.counters.sent.fetch_add(1, Ordering::AcqRel);
        if self.commands.send(GcMessage::Collect).is_err() {
            self.counters.sent.fetch_sub(1, Ordering::AcqRel);
            self.counters.queued.store(false, Ordering::Release);
            return Err(eyre!("background GC worker has stopped"));
        }
        Ok(())
    }
}

pub(crate) struct GcWorker {
    requests: GcRequests,
    completions: Receiver<Result<usize>>,
    received: usize,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    /// Starts the worker. `collect` runs one cycle and returns `None` once the
    /// database is gone, which stops the worker.
    pub fn spawn<F>(collect: F) -> Result<Self>
    where
        F: Fn() -> Option<Result<usize>> + Send + 'static,
    {
        let (commands, inbox) = crossbeam_channel::unbounded();
        let (done, completions) = crossbeam_channel::unbounded();
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name("shadowstore-gc".to_string())
            .spawn(move || run_worker(inbox, done, &worker_counters, collect))
            .wrap_err("failed to spawn background GC thread")?;

        Ok(Self {
            requests: GcRequests { commands, counters },
            completions,
            received: 0,
            handle: Some(handle),
        })
    }

    pub fn requests(&self) -> GcRequests {
        self.requests.clone()
    }

    /// Blocks until every cycle requested so far finished. Returns the
    /// objects they reclaimed, or the first failure.
    pub fn wait(&mut self) -> Result<usize> {
        let mut reclaimed = 0;
        let mut failure = None;
        while self.received < self.requests.counters.sent.load(Ordering::Acquire) {
            let Ok(result) = self.completions.recv() else {
                self.received = self.requests.counters.sent.load(Ordering::Acquire);
                return Err(eyre!("background GC worker has stopped"));
            };
            self.received += 1;
            match result {
                Ok(count) => reclaimed += count,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(reclaimed),
        }
    }

    /// Stops the worker after its current cycle.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.requests.commands.send(GcMessage::Shutdown);
        handle
            .join()
            .map_err(|_| eyre!("background GC thread panicked"))
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop background GC worker");
        }
    }
}

fn run_worker<F>(
    inbox: Receiver<GcMessage>,
    done: Sender<Result<usize>>,
    counters: &Counters,
    collect: F,
) where
    F: Fn() -> Option<Result<usize>>,
{
    let _span = info_span!("gc_worker").entered();
    debug!("background GC worker started");

    for message in inbox {
        match message {
            GcMessage::Collect => {
                counters.queued.store(false, Ordering::Release);
                let Some(result) = collect() else {
                    break;
                };
                if let Err(err) = &result {
                    warn!(error = %err, "background GC cycle failed");
                }
                if done.send(result).is_err() {
                    break;
                }
            }
            GcMessage::Shutdown => break,
        }
    }

    debug!("background GC worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn request_runs_one_cycle() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cycles);
        let mut worker = GcWorker::spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Ok(3))
        })
        .unwrap();

        worker.requests().request().unwrap();
        assert_eq!(worker.wait().unwrap(), 3);
        assert_eq!(cycles.load(Ordering::SeqCst), 1);

        assert_eq!(worker.wait().unwrap(), 0);
        worker.shutdown().unwrap();
    }

    #[test]
    fn requests_while_queued_are_merged() {
        let (release, gate) = mpsc::channel::<()>();
        let gate = std::sync::Mutex::new(gate);
        let mut worker = GcWorker::spawn(move || {
            let _ = gate.lock().unwrap().recv();
            Some(Ok(1))
        })
        .unwrap();
        let requests = worker.requests();

        // first cycle is blocked inside `collect`; the next two requests
        // share one queued message
        requests.request().unwrap();
        while requests.counters.queued.load(Ordering::Acquire) {
            thread::yield_now();
        }
        requests.request().unwrap();
        requests.request().unwrap();
        assert_eq!(requests.counters.sent.load(Ordering::Acquire), 2);

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert_eq!(worker.wait().unwrap(), 2);
        worker.shutdown().unwrap();
    }

    #[test]
    fn failures_are_reported_by_wait() {
        let mut worker = GcWorker::spawn(|| Some(Err(eyre!("sweep failed")))).unwrap();
        worker.requests().request().unwrap();
        let err = worker.wait().unwrap_err();
        assert!(err.to_string().contains("sweep failed"));
        worker.shutdown().unwrap();
    }

    #[test]
    fn worker_stops_when_database_is_gone() {
        let mut worker = GcWorker::spawn(|| None).unwrap();
        worker.requests().request().unwrap();
        assert!(worker.wait().is_err());
        assert!(worker.wait().is_ok());
    }
}
