//! Periodic background task used to drive the cleaning pass.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs a closure on a fixed cadence from a named background thread.
///
/// The thread parks on a stop channel with a timeout, so shutdown is
/// immediate: dropping the task sends the stop signal and joins.
pub(crate) struct PeriodicTask {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn(name: &str, every: Duration, mut task: impl FnMut() + Send + 'static) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(every) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("failed to spawn periodic task thread");
        PeriodicTask {
            stop_tx,
            handle: Some(handle),
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_repeatedly_and_stops_on_drop() {
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let task = PeriodicTask::spawn("test-janitor", Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        thread::sleep(Duration::from_millis(60));
        drop(task);
        let after_drop = count.load(Ordering::Relaxed);
        assert!(after_drop >= 2, "task should have fired, got {after_drop}");

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::Relaxed), after_drop);
    }
}
