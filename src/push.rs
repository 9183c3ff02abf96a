//! Push facade: a background worker feeds requests to caller callbacks.
//!
//! The caller supplies `can_handle` (may the server take another request?)
//! and `handle` (serve this request). Submissions and completions pump the
//! dispatch decision directly; when the decision is "nothing until time t",
//! the sched-ahead worker sleeps on a condvar until t or an earlier wakeup
//! and then re-runs the decision.

use parking_lot::{Condvar, Mutex};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::client::{ClientInfo, Phase, ReqParams};
use crate::error::Error;
use crate::janitor::PeriodicTask;
use crate::scheduler::{HeapId, NextReq, QueueOptions, SchedulerCore};
use crate::telemetry::ClientStats;
use crate::time::{get_time, Time, TIME_ZERO};

struct PushInner<C, R> {
    core: Mutex<SchedulerCore<C, R>>,
    can_handle: Box<dyn Fn() -> bool + Send + Sync>,
    handle: Box<dyn Fn(C, R, Phase) + Send + Sync>,
    finishing: AtomicBool,
    /// Earliest future dispatch time recorded so far; `TIME_ZERO` when none.
    sched_when: Mutex<Time>,
    sched_cv: Condvar,
}

/// Callback-driven front end over the scheduler core.
///
/// The `handle` callback runs while the data lock is held, so it must not
/// call back into the queue; signal completion from the serving thread via
/// [`PushQueue::request_completed`] instead.
pub struct PushQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    inner: Arc<PushInner<C, R>>,
    worker: Option<JoinHandle<()>>,
    _janitor: PeriodicTask,
}

impl<C, R> PushQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new(
        client_info_f: impl Fn(&C) -> ClientInfo + Send + 'static,
        can_handle: impl Fn() -> bool + Send + Sync + 'static,
        handle: impl Fn(C, R, Phase) + Send + Sync + 'static,
        opts: QueueOptions,
    ) -> Result<Self, Error> {
        opts.validate()?;
        let inner = Arc::new(PushInner {
            core: Mutex::new(SchedulerCore::new(Box::new(client_info_f), &opts)),
            can_handle: Box::new(can_handle),
            handle: Box::new(handle),
            finishing: AtomicBool::new(false),
            sched_when: Mutex::new(TIME_ZERO),
            sched_cv: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("qclock-sched-ahead".to_string())
            .spawn(move || run_sched_ahead(&worker_inner))
            .expect("failed to spawn sched-ahead thread");

        let janitor_inner = Arc::clone(&inner);
        let janitor = PeriodicTask::spawn("qclock-janitor", opts.check_time, move || {
            janitor_inner.core.lock().do_clean();
        });

        Ok(PushQueue {
            inner,
            worker: Some(worker),
            _janitor: janitor,
        })
    }

    /// Queue a request, stamped with the current time, and pump dispatch.
    pub fn add_request(&self, request: R, client_id: C, params: ReqParams) {
        self.add_request_at(request, client_id, params, get_time(), 0.0);
    }

    /// Queue a request with an explicit submission time. `addl_cost` is
    /// accepted for interface stability but does not enter tag arithmetic.
    pub fn add_request_at(
        &self,
        request: R,
        client_id: C,
        params: ReqParams,
        time: Time,
        addl_cost: f64,
    ) {
        let mut core = self.inner.core.lock();
        core.do_add_request(request, client_id, params, time, addl_cost);
        schedule_request(&self.inner, &mut core);
    }

    /// Signal that the server finished a request and can take another.
    pub fn request_completed(&self) {
        let mut core = self.inner.core.lock();
        schedule_request(&self.inner, &mut core);
    }

    /// Drain a client's pending requests through `accum`.
    pub fn remove_by_client(&self, client_id: &C, reverse: bool, accum: impl FnMut(R)) {
        self.inner
            .core
            .lock()
            .remove_by_client(client_id, reverse, accum);
    }

    /// Drop every pending request the filter matches; `reverse` visits each
    /// client's queue back to front.
    pub fn remove_by_req_filter(&self, filter: impl FnMut(&R) -> bool, reverse: bool) -> bool {
        self.inner.core.lock().remove_by_req_filter(filter, reverse)
    }

    /// Re-fetch one client's parameters from the info callback.
    pub fn update_client_info(&self, client_id: &C) {
        self.inner.core.lock().update_client_info(client_id);
    }

    /// Re-fetch every client's parameters from the info callback.
    pub fn update_client_infos(&self) {
        self.inner.core.lock().update_client_infos();
    }

    pub fn client_stats(&self, client_id: &C) -> Option<ClientStats> {
        self.inner.core.lock().client_stats(client_id)
    }

    pub fn total_weight(&self) -> f64 {
        self.inner.core.lock().total_weight()
    }

    pub fn client_count(&self) -> usize {
        self.inner.core.lock().client_count()
    }

    pub fn request_count(&self) -> usize {
        self.inner.core.lock().request_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.core.lock().is_empty()
    }
}

impl<C, R> Drop for PushQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    fn drop(&mut self) {
        self.inner.finishing.store(true, Ordering::Release);
        {
            // Hold the wait lock while notifying so the worker cannot miss
            // the wakeup between its flag check and its wait.
            let _slot = self.inner.sched_when.lock();
            self.inner.sched_cv.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Run one dispatch decision and act on it. The data lock is held by the
/// caller; `handle` is invoked under it.
fn schedule_request<C, R>(inner: &PushInner<C, R>, core: &mut SchedulerCore<C, R>)
where
    C: Eq + Hash + Clone,
{
    let next = if (inner.can_handle)() {
        core.do_next_request(get_time())
    } else {
        NextReq::None
    };
    match next {
        NextReq::None => {}
        NextReq::Future(when) => sched_at(inner, when),
        NextReq::Returning(heap_id) => {
            let phase = match heap_id {
                HeapId::Reservation => Phase::Reservation,
                _ => Phase::Priority,
            };
            let (client, request) = core.pop_from(heap_id, get_time());
            (inner.handle)(client, request, phase);
        }
    }
}

/// Record a future dispatch time, keeping only the earliest.
fn sched_at<C, R>(inner: &PushInner<C, R>, when: Time) {
    let mut slot = inner.sched_when.lock();
    if inner.finishing.load(Ordering::Acquire) {
        return;
    }
    if *slot == TIME_ZERO || when < *slot {
        *slot = when;
        inner.sched_cv.notify_one();
    }
}

/// Worker loop: sleep until the recorded future time (or an earlier wakeup),
/// then re-run the dispatch decision.
fn run_sched_ahead<C, R>(inner: &PushInner<C, R>)
where
    C: Eq + Hash + Clone,
{
    let mut when = inner.sched_when.lock();
    while !inner.finishing.load(Ordering::Acquire) {
        if *when == TIME_ZERO {
            inner.sched_cv.wait(&mut when);
        } else {
            loop {
                if inner.finishing.load(Ordering::Acquire) {
                    return;
                }
                let now = get_time();
                if now >= *when {
                    break;
                }
                let timeout = Duration::from_secs_f64((*when - now).max(1e-6));
                inner.sched_cv.wait_for(&mut when, timeout);
            }
            *when = TIME_ZERO;
            if inner.finishing.load(Ordering::Acquire) {
                return;
            }
            drop(when);
            {
                let mut core = inner.core.lock();
                schedule_request(inner, &mut core);
            }
            when = inner.sched_when.lock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientType;
    use crossbeam_channel::{unbounded, RecvTimeoutError};

    fn opts() -> QueueOptions {
        QueueOptions {
            telemetry_path: std::env::temp_dir().join("qclock-push-test-scheduling.txt"),
            ..QueueOptions::default()
        }
    }

    #[test]
    fn submissions_flow_through_the_handle_callback() {
        let (tx, rx) = unbounded();
        let queue = PushQueue::new(
            |_: &u32| ClientInfo::new(0.0, 1.0, 0.0, ClientType::B),
            || true,
            move |client, request: u64, phase| {
                tx.send((client, request, phase)).expect("send handled");
            },
            opts(),
        )
        .expect("push queue");

        for payload in 0..3u64 {
            queue.add_request(payload, 7, ReqParams::default());
        }

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(rx.recv_timeout(Duration::from_secs(1)).expect("handled"));
        }
        assert_eq!(
            got,
            vec![
                (7, 0, Phase::Priority),
                (7, 1, Phase::Priority),
                (7, 2, Phase::Priority),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn can_handle_gates_dispatch_until_completion() {
        let gate = Arc::new(AtomicBool::new(false));
        let can = Arc::clone(&gate);
        let (tx, rx) = unbounded();
        let queue = PushQueue::new(
            |_: &u32| ClientInfo::new(0.0, 1.0, 0.0, ClientType::B),
            move || can.load(Ordering::Acquire),
            move |_, request: u64, _| {
                tx.send(request).expect("send handled");
            },
            opts(),
        )
        .expect("push queue");

        queue.add_request(1, 1, ReqParams::default());
        queue.add_request(2, 1, ReqParams::default());
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        );

        gate.store(true, Ordering::Release);
        queue.request_completed();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(1));
        queue.request_completed();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(2));
    }

    #[test]
    fn sched_ahead_worker_fires_future_dispatches() {
        let (tx, rx) = unbounded();
        // 20 req/s reservation: the second request is due 50 ms after the
        // first, which only the worker thread can deliver.
        let queue = PushQueue::new(
            |_: &u32| ClientInfo::new(20.0, 0.0, 20.0, ClientType::R),
            || true,
            move |_, request: u64, phase| {
                tx.send((request, phase)).expect("send handled");
            },
            opts(),
        )
        .expect("push queue");

        queue.add_request(1, 1, ReqParams::default());
        queue.add_request(2, 1, ReqParams::default());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Ok((1, Phase::Reservation))
        );
        queue.request_completed();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Ok((2, Phase::Reservation))
        );
    }
}
