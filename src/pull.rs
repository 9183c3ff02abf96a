//! Pull facade: callers poll for the next dispatchable request.

use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

use crate::client::{ClientInfo, Phase, ReqParams};
use crate::error::Error;
use crate::janitor::PeriodicTask;
use crate::scheduler::{HeapId, NextReq, QueueOptions, SchedulerCore};
use crate::telemetry::ClientStats;
use crate::time::{get_time, Time};

/// Outcome of one poll.
#[derive(Debug)]
pub enum PullReq<C, R> {
    /// No pending request can ever fire without new submissions.
    None,
    /// Nothing runnable yet; poll again no later than the given time.
    Future(Time),
    /// A request to serve, with the phase that justified the dispatch.
    Returning { client: C, request: R, phase: Phase },
}

impl<C, R> PullReq<C, R> {
    pub fn is_none(&self) -> bool {
        matches!(self, PullReq::None)
    }

    pub fn is_future(&self) -> bool {
        matches!(self, PullReq::Future(_))
    }

    pub fn is_returning(&self) -> bool {
        matches!(self, PullReq::Returning { .. })
    }
}

/// Polling front end over the scheduler core.
///
/// All state sits behind one data mutex; polls never block beyond it. A
/// janitor thread ages out inactive clients on the configured cadence.
pub struct PullQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    core: Arc<Mutex<SchedulerCore<C, R>>>,
    _janitor: PeriodicTask,
}

impl<C, R> PullQueue<C, R>
where
    C: Eq + Hash + Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new(
        client_info_f: impl Fn(&C) -> ClientInfo + Send + 'static,
        opts: QueueOptions,
    ) -> Result<Self, Error> {
        opts.validate()?;
        let core = Arc::new(Mutex::new(SchedulerCore::new(
            Box::new(client_info_f),
            &opts,
        )));
        let janitor_core = Arc::clone(&core);
        let janitor = PeriodicTask::spawn("qclock-janitor", opts.check_time, move || {
            janitor_core.lock().do_clean();
        });
        Ok(PullQueue {
            core,
            _janitor: janitor,
        })
    }

    /// Queue a request for a client, stamped with the current time.
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
        self.core
            .lock()
            .do_add_request(request, client_id, params, time, addl_cost);
    }

    /// Poll at the current time.
    pub fn pull_request(&self) -> PullReq<C, R> {
        self.pull_request_at(get_time())
    }

    /// Poll at an explicit time.
    pub fn pull_request_at(&self, now: Time) -> PullReq<C, R> {
        let mut core = self.core.lock();
        match core.do_next_request(now) {
            NextReq::None => PullReq::None,
            NextReq::Future(when) => PullReq::Future(when),
            NextReq::Returning(heap_id) => {
                let phase = match heap_id {
                    HeapId::Reservation => Phase::Reservation,
                    _ => Phase::Priority,
                };
                let (client, request) = core.pop_from(heap_id, now);
                PullReq::Returning {
                    client,
                    request,
                    phase,
                }
            }
        }
    }

    /// Drain a client's pending requests through `accum`.
    pub fn remove_by_client(&self, client_id: &C, reverse: bool, accum: impl FnMut(R)) {
        self.core.lock().remove_by_client(client_id, reverse, accum);
    }

    /// Drop every pending request the filter matches; `reverse` visits each
    /// client's queue back to front.
    pub fn remove_by_req_filter(&self, filter: impl FnMut(&R) -> bool, reverse: bool) -> bool {
        self.core.lock().remove_by_req_filter(filter, reverse)
    }

    /// Re-fetch one client's parameters from the info callback.
    pub fn update_client_info(&self, client_id: &C) {
        self.core.lock().update_client_info(client_id);
    }

    /// Re-fetch every client's parameters from the info callback.
    pub fn update_client_infos(&self) {
        self.core.lock().update_client_infos();
    }

    pub fn client_stats(&self, client_id: &C) -> Option<ClientStats> {
        self.core.lock().client_stats(client_id)
    }

    pub fn total_weight(&self) -> f64 {
        self.core.lock().total_weight()
    }

    pub fn client_count(&self) -> usize {
        self.core.lock().client_count()
    }

    pub fn request_count(&self) -> usize {
        self.core.lock().request_count()
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().is_empty()
    }

    /// Lifetime dispatch totals as (reservation, priority).
    pub fn sched_counts(&self) -> (u64, u64) {
        self.core.lock().sched_counts()
    }
}
