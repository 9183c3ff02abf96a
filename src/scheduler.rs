//! Scheduler core: the class-partitioned heap set and the dispatch ladder.
//!
//! One record per client is filed in the heaps of its class (three for R, two
//! for B, two for A/O), all sharing the arena. A dispatch decision walks a
//! fixed ladder: reservations first, then burst clients up to their windowed
//! share, then R surplus, then best effort, then (optionally) a limit break
//! so partially specified clients cannot starve the server. Window roll-over
//! re-fetches client parameters, migrates clients whose class changed,
//! grants reservation compensation, dumps telemetry, and resets counters.
//!
//! Everything here assumes the caller holds the facade's data lock.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::client::{ClientInfo, ClientRec, ClientType, Lane, ReqParams};
use crate::error::Error;
use crate::heap::{Arena, IndirectHeap, Precedes};
use crate::tag::{RequestTag, MAX_TAG};
use crate::telemetry::{ClientStats, ScheduleLog};
use crate::time::{min_not_zero, Time, TIME_MAX};

/// Which heap a dispatch decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapId {
    Reservation,
    Deltar,
    Burst,
    BestEffort,
}

/// Outcome of a dispatch decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum NextReq {
    /// No client has a pending request that could ever fire.
    None,
    /// Nothing runnable now; re-poll no later than the given time.
    Future(Time),
    /// The top of the named heap holds a dispatchable request.
    Returning(HeapId),
}

/// Construction parameters shared by both queue facades.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Quiescent time after which a client is marked idle.
    pub idle_age: Duration,
    /// Quiescent time after which a client record is erased.
    pub erase_age: Duration,
    /// Janitor cadence.
    pub check_time: Duration,
    /// Allow dispatch past the limit tag once every regular rung failed.
    pub allow_limit_break: bool,
    /// Idle gap, in seconds, a client may bridge without resetting its tags.
    pub anticipation_timeout: f64,
    /// Server capacity in requests per second.
    pub system_capacity: f64,
    /// Accounting window length in seconds.
    pub win_size: f64,
    /// Materialize tags only for the head request of each client (the
    /// non-deferred mode exists for A/B comparison).
    pub deferred_tags: bool,
    /// Destination of the per-window scheduling records.
    pub telemetry_path: PathBuf,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            idle_age: Duration::from_secs(600),
            erase_age: Duration::from_secs(900),
            check_time: Duration::from_secs(360),
            allow_limit_break: false,
            anticipation_timeout: 0.0,
            system_capacity: 8000.0,
            win_size: 30.0,
            deferred_tags: true,
            telemetry_path: PathBuf::from("scheduling.txt"),
        }
    }
}

impl QueueOptions {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.erase_age < self.idle_age {
            return Err(Error::EraseBeforeIdle {
                idle_age: self.idle_age,
                erase_age: self.erase_age,
            });
        }
        if self.check_time >= self.idle_age {
            return Err(Error::CheckSlowerThanIdle {
                idle_age: self.idle_age,
                check_time: self.check_time,
            });
        }
        if !(self.system_capacity > 0.0) {
            return Err(Error::NonPositiveCapacity(self.system_capacity));
        }
        if !(self.win_size > 0.0) {
            return Err(Error::NonPositiveWindow(self.win_size));
        }
        Ok(())
    }
}

/// Which tag field a heap sorts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagField {
    Reservation,
    Proportion,
    Limit,
}

/// How the ready flag folds into the ordering.
///
/// `Lowers` sorts not-ready entries first (they are what the ready walk is
/// waiting for); `Raises` sorts ready entries first (they are dispatch
/// candidates); `Ignore` compares tags alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyPolicy {
    Ignore,
    Lowers,
    Raises,
}

/// Runtime comparator configuration for one heap.
struct TagOrder {
    field: TagField,
    ready: ReadyPolicy,
    use_prop_delta: bool,
}

impl TagOrder {
    const fn new(field: TagField, ready: ReadyPolicy, use_prop_delta: bool) -> Self {
        TagOrder {
            field,
            ready,
            use_prop_delta,
        }
    }

    fn key(&self, tag: &RequestTag, prop_delta: f64) -> f64 {
        let base = match self.field {
            TagField::Reservation => tag.reservation,
            TagField::Proportion => tag.proportion,
            TagField::Limit => tag.limit,
        };
        if self.use_prop_delta {
            base + prop_delta
        } else {
            base
        }
    }
}

impl<C, R> Precedes<ClientRec<C, R>> for TagOrder {
    fn precedes(&self, a: &ClientRec<C, R>, b: &ClientRec<C, R>) -> bool {
        match (a.head_tag(), b.head_tag()) {
            (Some(t1), Some(t2)) => {
                if self.ready == ReadyPolicy::Ignore || t1.ready == t2.ready {
                    self.key(t1, a.prop_delta) < self.key(t2, b.prop_delta)
                } else if self.ready == ReadyPolicy::Raises {
                    t1.ready
                } else {
                    t2.ready
                }
            }
            // A client with no pending request sorts after any that has one.
            (Some(_), None) => true,
            _ => false,
        }
    }
}

type ClientHeap = IndirectHeap<TagOrder, 2>;

pub(crate) type ClientInfoFn<C> = Box<dyn Fn(&C) -> ClientInfo + Send>;

/// The scheduler state shared by both facades. Not synchronized itself; the
/// facades wrap it in their data mutex.
pub(crate) struct SchedulerCore<C, R> {
    client_info_f: ClientInfoFn<C>,

    arena: Arena<ClientRec<C, R>>,
    client_map: HashMap<C, usize>,
    /// Stable per-client index used in telemetry lines.
    display_index: HashMap<C, u32>,
    next_display_index: u32,

    resv_heap: ClientHeap,
    r_limit_heap: ClientHeap,
    deltar_heap: ClientHeap,
    limit_heap: ClientHeap,
    burst_heap: ClientHeap,
    best_limit_heap: ClientHeap,
    best_heap: ClientHeap,

    allow_limit_break: bool,
    anticipation_timeout: f64,
    deferred_tags: bool,

    /// Incremented once per added request; janitor ages are measured in it.
    tick: u64,
    total_wgt: f64,
    system_capacity: f64,
    win_size: f64,
    win_start: Time,
    /// Taken with try_lock so exactly one thread performs window roll-over
    /// while the rest dispatch on the previous window's counters.
    win_mtx: Arc<Mutex<()>>,

    idle_age: Duration,
    erase_age: Duration,
    mark_points: VecDeque<(Instant, u64)>,

    reserv_sched_count: u64,
    prop_sched_count: u64,

    telemetry: ScheduleLog,
}

impl<C, R> SchedulerCore<C, R>
where
    C: Eq + Hash + Clone,
{
    pub fn new(client_info_f: ClientInfoFn<C>, opts: &QueueOptions) -> Self {
        SchedulerCore {
            client_info_f,
            arena: Arena::new(),
            client_map: HashMap::new(),
            display_index: HashMap::new(),
            next_display_index: 0,
            resv_heap: ClientHeap::new(
                Lane::Resv.index(),
                TagOrder::new(TagField::Reservation, ReadyPolicy::Ignore, false),
            ),
            r_limit_heap: ClientHeap::new(
                Lane::RLimit.index(),
                TagOrder::new(TagField::Limit, ReadyPolicy::Lowers, false),
            ),
            deltar_heap: ClientHeap::new(
                Lane::Deltar.index(),
                TagOrder::new(TagField::Proportion, ReadyPolicy::Raises, true),
            ),
            limit_heap: ClientHeap::new(
                Lane::Limit.index(),
                TagOrder::new(TagField::Limit, ReadyPolicy::Lowers, false),
            ),
            burst_heap: ClientHeap::new(
                Lane::Burst.index(),
                TagOrder::new(TagField::Proportion, ReadyPolicy::Raises, true),
            ),
            best_limit_heap: ClientHeap::new(
                Lane::BestLimit.index(),
                TagOrder::new(TagField::Limit, ReadyPolicy::Lowers, false),
            ),
            best_heap: ClientHeap::new(
                Lane::Best.index(),
                TagOrder::new(TagField::Proportion, ReadyPolicy::Raises, true),
            ),
            allow_limit_break: opts.allow_limit_break,
            anticipation_timeout: opts.anticipation_timeout,
            deferred_tags: opts.deferred_tags,
            tick: 0,
            total_wgt: 0.0,
            system_capacity: opts.system_capacity,
            win_size: opts.win_size,
            win_start: 0.0,
            win_mtx: Arc::new(Mutex::new(())),
            idle_age: opts.idle_age,
            erase_age: opts.erase_age,
            mark_points: VecDeque::new(),
            reserv_sched_count: 0,
            prop_sched_count: 0,
            telemetry: ScheduleLog::new(opts.telemetry_path.clone()),
        }
    }

    // ----- request insertion -------------------------------------------------

    pub fn do_add_request(
        &mut self,
        request: R,
        client_id: C,
        params: ReqParams,
        time: Time,
        _addl_cost: f64,
    ) {
        self.tick += 1;

        let idx = match self.client_map.get(&client_id) {
            Some(&idx) => idx,
            None => self.create_client(client_id),
        };

        if self.arena.get(idx).idle {
            self.unidle_client(idx, time);
        }

        let deferred = self.deferred_tags;
        let anticipation = self.anticipation_timeout;
        let tick = self.tick;
        {
            let rec = self.arena.get_mut(idx);
            let tag = if !deferred || !rec.has_request() {
                let info = rec.dispatch_info();
                let tag = RequestTag::next(
                    &rec.prev_tag,
                    &info,
                    params.delta,
                    params.rho,
                    time,
                    anticipation,
                );
                debug_assert!(
                    tag.is_schedulable() || (info.reservation == 0.0 && info.weight == 0.0),
                    "tag must carry a finite reservation or proportion"
                );
                rec.update_prev_tag(&tag, tick);
                tag
            } else {
                // Deferred mode: later requests get a placeholder; the real
                // tag is derived from the head's tag at pop time.
                RequestTag::with_values(0.0, 0.0, 0.0, time)
            };
            rec.push_request(tag, request);
            rec.cur_rho = params.rho;
            rec.cur_delta = params.delta;
        }

        self.adjust_class_heaps(idx);
    }

    fn create_client(&mut self, client_id: C) -> usize {
        let info = (self.client_info_f)(&client_id);
        let mut rec = ClientRec::new(client_id.clone(), info, self.tick);
        rec.rebuild_compensated();
        let idx = self.arena.insert(rec);
        self.push_lanes(idx, info.client_type);

        self.client_map.insert(client_id.clone(), idx);
        self.display_index.insert(client_id, self.next_display_index);
        self.next_display_index += 1;

        if info.client_type.weight_pooled() {
            self.apply_weight_delta(info.weight);
        }
        idx
    }

    /// Realign an idle client's proportion baseline so it competes fairly
    /// with clients whose virtual time kept advancing.
    fn unidle_client(&mut self, idx: usize, time: Time) {
        let mut lowest = f64::INFINITY;
        for (_, rec) in self.arena.iter() {
            if !rec.idle {
                lowest = lowest.min(rec.effective_proportion());
            }
        }
        let rec = self.arena.get_mut(idx);
        if lowest.is_finite() {
            rec.prop_delta = lowest - time;
        }
        rec.idle = false;
    }

    // ----- dispatch decision -------------------------------------------------

    pub fn do_next_request(&mut self, now: Time) -> NextReq {
        if self.resv_heap.is_empty() && self.burst_heap.is_empty() && self.best_heap.is_empty() {
            return NextReq::None;
        }

        if now - self.win_start >= self.win_size {
            let win_mtx = Arc::clone(&self.win_mtx);
            let guard = win_mtx.try_lock();
            if guard.is_some() {
                self.roll_window(now);
            }
        }

        // 1. Reservations are served unconditionally once due.
        if let Some(top) = self.resv_heap.top() {
            let rec = self.arena.get(top);
            if matches!(rec.head_tag(), Some(tag) if tag.reservation <= now) {
                self.arena.get_mut(top).counters.r0 += 1;
                return NextReq::Returning(HeapId::Reservation);
            }
        }

        // 2. Promote every B client whose limit has been reached.
        promote_ready_tops(
            &mut self.arena,
            &mut self.limit_heap,
            &mut self.burst_heap,
            now,
        );

        // 3. Burst dispatch within the windowed share.
        if let Some(top) = self.burst_heap.top() {
            let rec = self.arena.get(top);
            if (rec.counters.b as f64) < rec.resource.max(0.0)
                && matches!(rec.head_tag(), Some(tag) if tag.ready && tag.proportion < MAX_TAG)
            {
                self.arena.get_mut(top).counters.b += 1;
                return NextReq::Returning(HeapId::Burst);
            }
        }

        // 4. Promote R clients into the surplus heap.
        promote_ready_tops(
            &mut self.arena,
            &mut self.r_limit_heap,
            &mut self.deltar_heap,
            now,
        );

        // 5. R surplus above the reservation, within what the share leaves.
        if let Some(top) = self.deltar_heap.top() {
            let rec = self.arena.get(top);
            let budget = (rec.resource - rec.info.reservation * self.win_size).max(0.0);
            if (rec.counters.deltar as f64) < budget
                && matches!(rec.head_tag(), Some(tag) if tag.ready && tag.proportion < MAX_TAG)
            {
                self.arena.get_mut(top).counters.deltar += 1;
                return NextReq::Returning(HeapId::Deltar);
            }
        }

        // 6. Promote best-effort clients.
        promote_ready_tops(
            &mut self.arena,
            &mut self.best_limit_heap,
            &mut self.best_heap,
            now,
        );

        // 7. Best effort has no budget of its own.
        if let Some(top) = self.best_heap.top() {
            let rec = self.arena.get(top);
            if matches!(rec.head_tag(), Some(tag) if tag.ready && tag.proportion < MAX_TAG) {
                self.arena.get_mut(top).counters.be += 1;
                return NextReq::Returning(HeapId::BestEffort);
            }
        }

        // 8. Limit break, so a fully backlogged server still makes progress.
        if self.allow_limit_break {
            if let Some(top) = self.burst_heap.top() {
                if matches!(self.arena.get(top).head_tag(), Some(tag) if tag.proportion < MAX_TAG) {
                    self.arena.get_mut(top).counters.b_break_limit += 1;
                    return NextReq::Returning(HeapId::Burst);
                }
            }
            if let Some(top) = self.best_heap.top() {
                if matches!(self.arena.get(top).head_tag(), Some(tag) if tag.proportion < MAX_TAG) {
                    self.arena.get_mut(top).counters.be_break_limit += 1;
                    return NextReq::Returning(HeapId::BestEffort);
                }
            }
            if let Some(top) = self.deltar_heap.top() {
                if matches!(self.arena.get(top).head_tag(), Some(tag) if tag.proportion < MAX_TAG) {
                    self.arena.get_mut(top).counters.deltar_break_limit += 1;
                    return NextReq::Returning(HeapId::Deltar);
                }
            }
            if let Some(top) = self.resv_heap.top() {
                if matches!(self.arena.get(top).head_tag(), Some(tag) if tag.reservation < MAX_TAG)
                {
                    self.arena.get_mut(top).counters.r0_break_limit += 1;
                    return NextReq::Returning(HeapId::Reservation);
                }
            }
        }

        // 9. Nothing runnable; report when the earliest tag comes due.
        let mut next_call = TIME_MAX;
        if let Some(top) = self.resv_heap.top() {
            if let Some(tag) = self.arena.get(top).head_tag() {
                next_call = min_not_zero(next_call, tag.reservation);
            }
        }
        for heap in [&self.r_limit_heap, &self.limit_heap] {
            if let Some(top) = heap.top() {
                if let Some(tag) = self.arena.get(top).head_tag() {
                    next_call = min_not_zero(next_call, tag.limit);
                }
            }
        }
        if next_call < TIME_MAX {
            NextReq::Future(next_call)
        } else {
            NextReq::None
        }
    }

    // ----- pop and post-dispatch bookkeeping ---------------------------------

    /// Commit the dispatch decided by [`do_next_request`]: move the payload
    /// out, fill in the next head's deferred tag, and re-seat the client in
    /// its heaps.
    pub fn pop_from(&mut self, heap_id: HeapId, now: Time) -> (C, R) {
        let idx = match heap_id {
            HeapId::Reservation => self.resv_heap.top(),
            HeapId::Deltar => self.deltar_heap.top(),
            HeapId::Burst => self.burst_heap.top(),
            HeapId::BestEffort => self.best_heap.top(),
        }
        .expect("dispatch decision requires a non-empty heap");

        let deferred = self.deferred_tags;
        let anticipation = self.anticipation_timeout;
        let tick = self.tick;

        let (client, class, request) = {
            let rec = self.arena.get_mut(idx);
            let popped = rec.pop_request();
            if deferred && rec.has_request() {
                let info = rec.dispatch_info();
                let arrival = rec
                    .head_tag()
                    .map(|t| t.arrival)
                    .expect("client has a request");
                let tag = RequestTag::next(
                    &popped.tag,
                    &info,
                    rec.cur_delta,
                    rec.cur_rho,
                    arrival,
                    anticipation,
                );
                if let Some(head) = rec.head_tag_mut() {
                    *head = tag;
                }
                rec.update_prev_tag(&tag, tick);
            }
            (rec.client.clone(), rec.info.client_type, popped.request)
        };

        match class {
            ClientType::R => {
                // A surplus dispatch must not also bill the reservation.
                if heap_id == HeapId::Deltar && now - self.win_start < self.win_size {
                    self.reduce_reservation_tags(idx);
                }
                self.resv_heap.demote(&mut self.arena, idx);
                self.deltar_heap.demote(&mut self.arena, idx);
                self.r_limit_heap.adjust(&mut self.arena, idx);
            }
            ClientType::B => {
                self.burst_heap.demote(&mut self.arena, idx);
                self.limit_heap.adjust(&mut self.arena, idx);
            }
            ClientType::A | ClientType::O => {
                self.best_heap.demote(&mut self.arena, idx);
                self.best_limit_heap.adjust(&mut self.arena, idx);
            }
        }

        match heap_id {
            HeapId::Reservation => self.reserv_sched_count += 1,
            _ => self.prop_sched_count += 1,
        }

        (client, request)
    }

    /// Subtract one reservation increment from the client's pending tags
    /// (front only in deferred mode; later tags are placeholders).
    fn reduce_reservation_tags(&mut self, idx: usize) {
        {
            let rec = self.arena.get_mut(idx);
            let inv = rec.dispatch_info().reservation_inv;
            if self.deferred_tags {
                if let Some(head) = rec.head_tag_mut() {
                    head.reservation -= inv;
                }
            } else {
                for req in rec.requests.iter_mut() {
                    req.tag.reservation -= inv;
                }
            }
            rec.prev_tag.reservation -= inv;
        }
        self.resv_heap.promote(&mut self.arena, idx);
    }

    // ----- window roll-over --------------------------------------------------

    fn roll_window(&mut self, now: Time) {
        self.win_start = (self.win_start + self.win_size).max(now);
        debug!(win_start = self.win_start, "window roll-over");

        let mut lines: Vec<String> = Vec::new();
        let idxs: Vec<usize> = self.client_map.values().copied().collect();
        for idx in idxs {
            {
                let rec = self.arena.get(idx);
                let display = self.display_index.get(&rec.client).copied().unwrap_or(0);
                lines.push(ScheduleLog::client_line(
                    now,
                    &rec.info,
                    display,
                    rec.resource,
                    rec.r_compensation,
                    &rec.counters,
                ));
            }

            let new_info = (self.client_info_f)(&self.arena.get(idx).client);
            let old_info = self.arena.get(idx).info;
            if new_info != old_info {
                lines.push(ScheduleLog::update_line(&old_info, &new_info));
                self.apply_new_info(idx, new_info);
            }

            let win_size = self.win_size;
            let rec = self.arena.get_mut(idx);
            if rec.info.client_type == ClientType::R {
                let target = rec.info.reservation * win_size;
                // Compensate clients that came close to their share but were
                // still under-served; capped at a tenth of the reservation.
                if rec.counters.r0 as f64 >= 0.8 * target {
                    let grant = (target - rec.counters.r0 as f64) / win_size;
                    rec.r_compensation =
                        (rec.r_compensation + grant).clamp(0.0, 0.1 * rec.info.reservation);
                    rec.rebuild_compensated();
                }
            }
            rec.counters.reset();
        }

        self.telemetry.append(&lines);
    }

    /// Install a changed `ClientInfo`, migrating between heap sets and
    /// re-balancing the weight pool as needed.
    fn apply_new_info(&mut self, idx: usize, new_info: ClientInfo) {
        let old_info = self.arena.get(idx).info;
        if new_info == old_info {
            return;
        }
        if new_info.client_type != old_info.client_type {
            self.migrate(idx, new_info);
        }
        {
            let rec = self.arena.get_mut(idx);
            rec.info = new_info;
            rec.rebuild_compensated();
        }
        let old_contrib = pooled_weight(&old_info);
        let new_contrib = pooled_weight(&new_info);
        if old_contrib != new_contrib {
            self.apply_weight_delta(new_contrib - old_contrib);
        } else if new_info.weight != old_info.weight {
            self.recompute_resources();
        }
    }

    /// Move a client to the heap set of its new class, inheriting tags from
    /// the top of the destination's primary heap so it does not jump the
    /// queue.
    fn migrate(&mut self, idx: usize, new_info: ClientInfo) {
        debug!(
            from = %self.arena.get(idx).info.client_type,
            to = %new_info.client_type,
            "client class migration"
        );
        self.remove_from_lanes(idx);

        let source_top = match new_info.client_type {
            ClientType::R => self.resv_heap.top(),
            ClientType::B => self.burst_heap.top(),
            ClientType::A | ClientType::O => self.best_heap.top(),
        };
        if let Some(top) = source_top {
            let (top_head, top_prev) = {
                let t = self.arena.get(top);
                (t.head_tag().copied(), t.prev_tag)
            };
            let rec = self.arena.get_mut(idx);
            if rec.has_request() {
                if let (Some(inherited), Some(head)) = (top_head, rec.head_tag_mut()) {
                    *head = inherited;
                }
            }
            rec.prev_tag = top_prev;
        }

        self.push_lanes(idx, new_info.client_type);
    }

    // ----- weights and resources ---------------------------------------------

    fn apply_weight_delta(&mut self, delta: f64) {
        self.total_wgt += delta;
        self.recompute_resources();
    }

    /// Windowed request budget per client from its share of capacity.
    fn recompute_resources(&mut self) {
        let total = self.total_wgt;
        let capacity = self.system_capacity;
        let win_size = self.win_size;
        for (_, rec) in self.arena.iter_mut() {
            rec.resource = if total > 0.0 {
                capacity * rec.info.weight * win_size / total
            } else {
                0.0
            };
        }
    }

    // ----- heap membership helpers -------------------------------------------

    fn push_lanes(&mut self, idx: usize, class: ClientType) {
        match class {
            ClientType::R => {
                self.resv_heap.push(&mut self.arena, idx);
                self.r_limit_heap.push(&mut self.arena, idx);
                self.deltar_heap.push(&mut self.arena, idx);
            }
            ClientType::B => {
                self.limit_heap.push(&mut self.arena, idx);
                self.burst_heap.push(&mut self.arena, idx);
            }
            ClientType::A | ClientType::O => {
                self.best_limit_heap.push(&mut self.arena, idx);
                self.best_heap.push(&mut self.arena, idx);
            }
        }
    }

    fn remove_from_lanes(&mut self, idx: usize) {
        match self.arena.get(idx).info.client_type {
            ClientType::R => {
                self.resv_heap.remove(&mut self.arena, idx);
                self.r_limit_heap.remove(&mut self.arena, idx);
                self.deltar_heap.remove(&mut self.arena, idx);
            }
            ClientType::B => {
                self.limit_heap.remove(&mut self.arena, idx);
                self.burst_heap.remove(&mut self.arena, idx);
            }
            ClientType::A | ClientType::O => {
                self.best_limit_heap.remove(&mut self.arena, idx);
                self.best_heap.remove(&mut self.arena, idx);
            }
        }
    }

    fn adjust_class_heaps(&mut self, idx: usize) {
        match self.arena.get(idx).info.client_type {
            ClientType::R => {
                self.resv_heap.adjust(&mut self.arena, idx);
                self.r_limit_heap.adjust(&mut self.arena, idx);
                self.deltar_heap.adjust(&mut self.arena, idx);
            }
            ClientType::B => {
                self.limit_heap.adjust(&mut self.arena, idx);
                self.burst_heap.adjust(&mut self.arena, idx);
            }
            ClientType::A | ClientType::O => {
                self.best_limit_heap.adjust(&mut self.arena, idx);
                self.best_heap.adjust(&mut self.arena, idx);
            }
        }
    }

    // ----- janitor -----------------------------------------------------------

    /// Record a mark point and age clients against the idle and erase
    /// thresholds. Called on the janitor cadence.
    pub fn do_clean(&mut self) {
        let now = Instant::now();
        self.mark_points.push_back((now, self.tick));

        let mut erase_point = 0;
        if let Some(cutoff) = now.checked_sub(self.erase_age) {
            while let Some(&(t, tick)) = self.mark_points.front() {
                if t <= cutoff {
                    erase_point = tick;
                    self.mark_points.pop_front();
                } else {
                    break;
                }
            }
        }
        let mut idle_point = 0;
        if let Some(cutoff) = now.checked_sub(self.idle_age) {
            for &(t, tick) in &self.mark_points {
                if t <= cutoff {
                    idle_point = tick;
                } else {
                    break;
                }
            }
        }
        if erase_point == 0 && idle_point == 0 {
            return;
        }

        let mut to_erase = Vec::new();
        let mut to_idle = Vec::new();
        for (idx, rec) in self.arena.iter() {
            if erase_point > 0 && rec.last_tick <= erase_point {
                to_erase.push(idx);
            } else if idle_point > 0 && rec.last_tick <= idle_point {
                to_idle.push(idx);
            }
        }
        for idx in to_idle {
            self.arena.get_mut(idx).idle = true;
        }
        for idx in to_erase {
            self.erase_client(idx);
        }
    }

    fn erase_client(&mut self, idx: usize) {
        self.remove_from_lanes(idx);
        let rec = self.arena.remove(idx);
        self.client_map.remove(&rec.client);
        self.display_index.remove(&rec.client);
        debug!(
            class = %rec.info.client_type,
            queued = rec.request_count(),
            "erased inactive client"
        );
        if rec.info.client_type.weight_pooled() && rec.info.weight != 0.0 {
            self.apply_weight_delta(-rec.info.weight);
        }
    }

    // ----- removal and info maintenance --------------------------------------

    /// Drain a client's pending requests through `accum`, leaving the client
    /// itself registered.
    pub fn remove_by_client(&mut self, client_id: &C, reverse: bool, mut accum: impl FnMut(R)) {
        let Some(&idx) = self.client_map.get(client_id) else {
            return;
        };
        {
            let rec = self.arena.get_mut(idx);
            if reverse {
                while let Some(req) = rec.requests.pop_back() {
                    accum(req.request);
                }
            } else {
                while let Some(req) = rec.requests.pop_front() {
                    accum(req.request);
                }
            }
        }
        self.adjust_class_heaps(idx);
    }

    /// Drop every pending request the filter matches, visiting each client's
    /// queue front to back (or back to front with `reverse`). Returns true if
    /// any request was removed.
    pub fn remove_by_req_filter(
        &mut self,
        mut filter: impl FnMut(&R) -> bool,
        reverse: bool,
    ) -> bool {
        let mut any_removed = false;
        let deferred = self.deferred_tags;
        let anticipation = self.anticipation_timeout;
        let tick = self.tick;
        let idxs: Vec<usize> = self.client_map.values().copied().collect();
        for idx in idxs {
            let mut touched = false;
            {
                let rec = self.arena.get_mut(idx);
                if reverse {
                    // Visit back to front; the head is reached last, so at
                    // most one replacement tag has to be materialized.
                    let mut head_removed = false;
                    let mut i = rec.requests.len();
                    while i > 0 {
                        i -= 1;
                        if filter(&rec.requests[i].request) {
                            rec.requests.remove(i);
                            touched = true;
                            if i == 0 {
                                head_removed = true;
                            }
                        }
                    }
                    if head_removed && deferred {
                        materialize_head_tag(rec, tick, anticipation);
                    }
                } else {
                    // Matching heads are dropped one by one so each new
                    // head's deferred tag is materialized from the previous
                    // tag.
                    while matches!(rec.requests.front(), Some(req) if filter(&req.request)) {
                        rec.requests.pop_front();
                        touched = true;
                        if deferred {
                            materialize_head_tag(rec, tick, anticipation);
                        }
                    }
                    let before = rec.requests.len();
                    rec.requests.retain(|req| !filter(&req.request));
                    touched |= rec.requests.len() != before;
                }
            }
            if touched {
                any_removed = true;
                self.adjust_class_heaps(idx);
            }
        }
        any_removed
    }

    /// Re-fetch one client's parameters from the info callback.
    pub fn update_client_info(&mut self, client_id: &C) {
        if let Some(&idx) = self.client_map.get(client_id) {
            let new_info = (self.client_info_f)(client_id);
            self.apply_new_info(idx, new_info);
        }
    }

    /// Re-fetch every client's parameters from the info callback.
    pub fn update_client_infos(&mut self) {
        let ids: Vec<C> = self.client_map.keys().cloned().collect();
        for id in ids {
            self.update_client_info(&id);
        }
    }

    // ----- introspection ------------------------------------------------------

    pub fn client_stats(&self, client_id: &C) -> Option<ClientStats> {
        let &idx = self.client_map.get(client_id)?;
        let rec = self.arena.get(idx);
        Some(ClientStats {
            client_type: rec.info.client_type,
            reservation: rec.info.reservation,
            weight: rec.info.weight,
            limit: rec.info.limit,
            resource: rec.resource,
            r_compensation: rec.r_compensation,
            prop_delta: rec.prop_delta,
            idle: rec.idle,
            queued: rec.request_count(),
            counters: rec.counters,
        })
    }

    pub fn total_weight(&self) -> f64 {
        self.total_wgt
    }

    pub fn client_count(&self) -> usize {
        self.client_map.len()
    }

    pub fn request_count(&self) -> usize {
        self.arena.iter().map(|(_, rec)| rec.request_count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.request_count() == 0
    }

    /// Totals over the queue's lifetime: (reservation dispatches, priority
    /// dispatches).
    pub fn sched_counts(&self) -> (u64, u64) {
        (self.reserv_sched_count, self.prop_sched_count)
    }
}

fn pooled_weight(info: &ClientInfo) -> f64 {
    if info.client_type.weight_pooled() {
        info.weight
    } else {
        0.0
    }
}

/// Give a head request that lost its materialized predecessor a real tag
/// derived from the previous tag, and fold it back into `prev_tag` so later
/// tags stay monotonic even if the queue drains without a dispatch.
fn materialize_head_tag<C, R>(rec: &mut ClientRec<C, R>, tick: u64, anticipation: f64) {
    let Some(arrival) = rec.head_tag().map(|t| t.arrival) else {
        return;
    };
    let info = rec.dispatch_info();
    let tag = RequestTag::next(
        &rec.prev_tag,
        &info,
        rec.cur_delta,
        rec.cur_rho,
        arrival,
        anticipation,
    );
    if let Some(head) = rec.head_tag_mut() {
        *head = tag;
    }
    rec.update_prev_tag(&tag, tick);
}

/// Walk a limit heap, marking every due top ready and moving it up in the
/// companion dispatch heap. Stops at the first top that is still early.
fn promote_ready_tops<C, R>(
    arena: &mut Arena<ClientRec<C, R>>,
    limit_heap: &mut ClientHeap,
    dispatch_heap: &mut ClientHeap,
    now: Time,
) {
    while let Some(top) = limit_heap.top() {
        let due = matches!(
            arena.get(top).head_tag(),
            Some(tag) if !tag.ready && tag.limit <= now
        );
        if !due {
            break;
        }
        if let Some(tag) = arena.get_mut(top).head_tag_mut() {
            tag.ready = true;
        }
        dispatch_heap.promote(arena, top);
        limit_heap.demote(arena, top);
    }
}
