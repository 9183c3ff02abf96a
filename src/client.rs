//! Client classes, QoS parameters, and the per-client scheduling record.
//!
//! Clients are partitioned into four classes that determine which heaps a
//! client is filed in and which rungs of the dispatch ladder can serve it.
//! The ordering of [`ClientType::ALL`] and the stable [`ClientType::index`]
//! keep class-indexed tables valid if a class is ever added.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::heap::{Slotted, NO_POS};
use crate::tag::RequestTag;
use crate::time::Time;

/// Scheduling class of a client.
///
/// `R` clients carry a reservation and may consume surplus above it; `B`
/// clients burst up to their windowed share; `A` and `O` clients are served
/// best-effort, with `O` additionally excluded from the weight pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClientType {
    R,
    B,
    A,
    O,
}

impl ClientType {
    /// All classes, in dispatch-ladder order.
    pub const ALL: [ClientType; 4] = [ClientType::R, ClientType::B, ClientType::A, ClientType::O];

    /// Stable index for class-based tables.
    pub const fn index(self) -> usize {
        match self {
            ClientType::R => 0,
            ClientType::B => 1,
            ClientType::A => 2,
            ClientType::O => 3,
        }
    }

    /// Whether this class contributes its weight to the shared pool.
    pub(crate) const fn weight_pooled(self) -> bool {
        !matches!(self, ClientType::O)
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientType::R => "R",
            ClientType::B => "B",
            ClientType::A => "A",
            ClientType::O => "O",
        };
        write!(f, "{label}")
    }
}

/// Identifies one of the class-partitioned heaps a record can sit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Resv,
    RLimit,
    Deltar,
    Limit,
    Burst,
    BestLimit,
    Best,
}

impl Lane {
    pub const COUNT: usize = 7;

    pub const fn index(self) -> usize {
        match self {
            Lane::Resv => 0,
            Lane::RLimit => 1,
            Lane::Deltar => 2,
            Lane::Limit => 3,
            Lane::Burst => 4,
            Lane::BestLimit => 5,
            Lane::Best => 6,
        }
    }
}

/// QoS parameters for one client, as supplied by the info callback.
///
/// Rates are requests per second; zero means the dimension is unused for
/// this client. The multiplicative inverses are precomputed once so tag
/// arithmetic never divides. An all-zero triple is the conventional marker
/// for a client whose backing pool no longer exists; such a client is kept
/// with zero weight until the janitor erases it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub reservation: f64,
    pub weight: f64,
    pub limit: f64,
    pub reservation_inv: f64,
    pub weight_inv: f64,
    pub limit_inv: f64,
    pub client_type: ClientType,
}

impl ClientInfo {
    pub fn new(reservation: f64, weight: f64, limit: f64, client_type: ClientType) -> Self {
        ClientInfo {
            reservation,
            weight,
            limit,
            reservation_inv: if reservation == 0.0 { 0.0 } else { 1.0 / reservation },
            weight_inv: if weight == 0.0 { 0.0 } else { 1.0 / weight },
            limit_inv: if limit == 0.0 { 0.0 } else { 1.0 / limit },
            client_type,
        }
    }

    /// Same rates with the reservation raised by `compensation`.
    pub(crate) fn with_compensation(&self, compensation: f64) -> Self {
        ClientInfo::new(
            self.reservation + compensation,
            self.weight,
            self.limit,
            self.client_type,
        )
    }

    /// The "pool no longer exists" convention: every rate zero.
    pub fn is_noexist(&self) -> bool {
        self.reservation == 0.0 && self.weight == 0.0 && self.limit == 0.0
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ {} r:{} w:{} l:{} }}",
            self.client_type, self.reservation, self.weight, self.limit
        )
    }
}

/// Distance counters sent with each request.
///
/// `rho` counts reservation-phase dispatches performed for this client
/// elsewhere since its last submission; `delta` counts all dispatches
/// elsewhere. Both default to 1 for a single-server deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqParams {
    pub rho: u32,
    pub delta: u32,
}

impl ReqParams {
    pub fn new(rho: u32, delta: u32) -> Self {
        ReqParams { rho, delta }
    }
}

impl Default for ReqParams {
    fn default() -> Self {
        ReqParams { rho: 1, delta: 1 }
    }
}

/// Why a request was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Dispatched to honor the client's minimum rate.
    Reservation,
    /// Any other rung of the ladder.
    Priority,
}

/// Per-window dispatch counters, one set per client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounters {
    pub r0: u64,
    pub r0_break_limit: u64,
    pub deltar: u64,
    pub deltar_break_limit: u64,
    pub b: u64,
    pub b_break_limit: u64,
    pub be: u64,
    pub be_break_limit: u64,
}

impl WindowCounters {
    pub(crate) fn reset(&mut self) {
        *self = WindowCounters::default();
    }
}

/// One queued request with its scheduling tag.
pub(crate) struct ClientReq<R> {
    pub tag: RequestTag,
    pub request: R,
}

/// Scheduler-owned state for one active client.
pub(crate) struct ClientRec<C, R> {
    pub client: C,
    /// Last value fetched from the info callback.
    pub info: ClientInfo,
    /// Scheduler-owned copy with `r_compensation` folded into the
    /// reservation; equal to `info` for non-R clients.
    pub compensated: ClientInfo,
    pub prev_tag: RequestTag,
    pub requests: VecDeque<ClientReq<R>>,
    /// Offset applied to proportion tags when an idle client rejoins, so its
    /// virtual time competes fairly with clients that kept running.
    pub prop_delta: f64,
    pub idle: bool,
    pub last_tick: u64,
    pub cur_rho: u32,
    pub cur_delta: u32,
    /// Windowed request budget from the share recomputation.
    pub resource: f64,
    pub r_compensation: f64,
    pub counters: WindowCounters,
    slots: [usize; Lane::COUNT],
}

impl<C, R> ClientRec<C, R> {
    pub fn new(client: C, info: ClientInfo, tick: u64) -> Self {
        ClientRec {
            client,
            info,
            compensated: info,
            prev_tag: RequestTag::initial(crate::time::TIME_ZERO),
            requests: VecDeque::new(),
            prop_delta: 0.0,
            idle: true,
            last_tick: tick,
            cur_rho: 1,
            cur_delta: 1,
            resource: 0.0,
            r_compensation: 0.0,
            counters: WindowCounters::default(),
            slots: [NO_POS; Lane::COUNT],
        }
    }

    pub fn has_request(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn head_tag(&self) -> Option<&RequestTag> {
        self.requests.front().map(|r| &r.tag)
    }

    pub fn head_tag_mut(&mut self) -> Option<&mut RequestTag> {
        self.requests.front_mut().map(|r| &mut r.tag)
    }

    pub fn push_request(&mut self, tag: RequestTag, request: R) {
        self.requests.push_back(ClientReq { tag, request });
    }

    pub fn pop_request(&mut self) -> ClientReq<R> {
        self.requests
            .pop_front()
            .expect("pop_request on empty client queue")
    }

    /// Fold a freshly computed tag into `prev_tag`, skipping pinned fields so
    /// the last finite value survives rate changes.
    pub fn update_prev_tag(&mut self, tag: &RequestTag, tick: u64) {
        assign_unpinned(&mut self.prev_tag.reservation, tag.reservation);
        assign_unpinned(&mut self.prev_tag.proportion, tag.proportion);
        assign_unpinned(&mut self.prev_tag.limit, tag.limit);
        self.prev_tag.arrival = tag.arrival;
        self.last_tick = tick;
    }

    /// The info used for this client's tag arithmetic: compensated for R
    /// clients, plain otherwise.
    pub fn dispatch_info(&self) -> ClientInfo {
        if self.info.client_type == ClientType::R {
            self.compensated
        } else {
            self.info
        }
    }

    pub fn rebuild_compensated(&mut self) {
        self.compensated = if self.info.client_type == ClientType::R {
            self.info.with_compensation(self.r_compensation)
        } else {
            self.info
        };
    }

    /// Effective proportion key of the head request (or previous tag when the
    /// queue is empty), used for idle re-entry alignment.
    pub fn effective_proportion(&self) -> f64 {
        let base = match self.head_tag() {
            Some(tag) => tag.proportion,
            None => self.prev_tag.proportion,
        };
        base + self.prop_delta
    }
}

fn assign_unpinned(field: &mut f64, value: f64) {
    if value.is_finite() {
        *field = value;
    }
}

impl<C, R> Slotted for ClientRec<C, R> {
    fn heap_pos(&self, lane: usize) -> usize {
        self.slots[lane]
    }
    fn set_heap_pos(&mut self, lane: usize, pos: usize) {
        self.slots[lane] = pos;
    }
}
