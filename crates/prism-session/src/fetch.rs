//! Background fetch plumbing.
//!
//! Long operations (stage-output fetches, conversions) run on a worker
//! thread. The UI-side caller polls a done flag instead of blocking, reads
//! progress from a periodic callback, and uses the handle's processing tag
//! to tell "busy with this kind of request" apart from "busy with
//! something else".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

/// What kind of request a worker is processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingTag {
    StageOutput,
    ShaderFeedback,
    PixelHistory,
    Conversion,
}

/// Periodic progress reports out of a running job. Fractions are in
/// `0.0..=1.0`; reporting is best-effort and never blocks the job.
pub struct ProgressSink {
    callback: Option<Box<dyn Fn(f32) + Send>>,
}

impl ProgressSink {
    fn new(callback: Option<Box<dyn Fn(f32) + Send>>) -> ProgressSink {
        ProgressSink { callback }
    }

    pub fn report(&self, fraction: f32) {
        if let Some(callback) = &self.callback {
            callback(fraction.clamp(0.0, 1.0));
        }
    }
}

pub struct FetchHandle<T> {
    tag: ProcessingTag,
    done: Arc<AtomicBool>,
    result: mpsc::Receiver<T>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> FetchHandle<T> {
    /// Spawns `job` on a worker thread. The job receives a progress sink
    /// wired to `progress`, if any.
    pub fn spawn<F>(
        tag: ProcessingTag,
        progress: Option<Box<dyn Fn(f32) + Send>>,
        job: F,
    ) -> FetchHandle<T>
    where
        F: FnOnce(&ProgressSink) -> T + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let worker = {
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let sink = ProgressSink::new(progress);
                let result = job(&sink);
                // Result first, then the flag: a caller that sees done=true
                // must find the result waiting.
                let _ = tx.send(result);
                done.store(true, Ordering::SeqCst);
                debug!(?tag, "background fetch finished");
            })
        };
        FetchHandle {
            tag,
            done,
            result: rx,
            worker: Some(worker),
        }
    }

    pub fn tag(&self) -> ProcessingTag {
        self.tag
    }

    /// Non-blocking: has the worker finished?
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Non-blocking result pickup; `None` while the worker is still busy.
    pub fn try_take(&mut self) -> Option<T> {
        match self.result.try_recv() {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(_) => None,
        }
    }

    /// Blocks until the worker finishes and returns its result. `None`
    /// only if the worker panicked.
    pub fn wait(mut self) -> Option<T> {
        let result = self.result.recv().ok();
        self.join();
        result
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<T> Drop for FetchHandle<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
