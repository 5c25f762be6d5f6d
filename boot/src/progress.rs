//! Progress reporting while programming.

use crate::log;

/// Receives `(bytes written, total bytes)` as an image is programmed.
pub trait Progress {
    fn report(&mut self, done: usize, total: usize);
}

impl<F: FnMut(usize, usize)> Progress for F {
    fn report(&mut self, done: usize, total: usize) {
        self(done, total)
    }
}

/// Reports through the log.
pub struct LogProgress;

impl Progress for LogProgress {
    fn report(&mut self, done: usize, total: usize) {
        log::info!("Flashing: {}% ({} / {} bytes)", percent(done, total), done, total);
    }
}

/// Discards progress.
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&mut self, _done: usize, _total: usize) {}
}

/// Whole percent complete.  An empty job is complete.
pub fn percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    (done as u64 * 100 / total as u64) as u32
}
