//! The owned-mode runner: a worker thread that repeatedly steps an
//! endpoint's polling loop. Driven mode is just the application calling
//! the polling entry point itself; an endpoint handed to [`Worker::spawn`]
//! is consumed, so the two modes cannot be mixed.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One step of an endpoint's event loop. Returns the number of frames
/// processed; zero means there was nothing to do.
pub trait Pollable {
    fn poll_once(&mut self) -> usize;
}

/// Owns an endpoint on a worker thread. The worker sleeps for roughly a
/// millisecond whenever a step reports no work.
pub struct Worker<T> {
    running: Arc<AtomicBool>,
    thread: thread::JoinHandle<T>,
}

impl<T: Pollable + Send + 'static> Worker<T> {
    /// Moves `endpoint` onto a fresh worker thread.
    pub fn spawn(mut endpoint: T) -> Result<Worker<T>> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = thread::Builder::new()
            .name("squall-worker".to_string())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    let processed = endpoint.poll_once();
                    if processed == 0 && flag.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                endpoint
            })
            .map_err(|err| Error::Io(err.kind()))?;

        Ok(Worker { running, thread })
    }

    /// Stops the worker and hands the endpoint back, ready for teardown.
    pub fn stop(self) -> T {
        self.running.store(false, Ordering::Release);
        self.thread.join().expect("Worker thread panicked")
    }
}
