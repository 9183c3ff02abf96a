//! Class-partitioned QoS request scheduler.
//!
//! Arbitrates requests from many logical clients sharing a finite-capacity
//! server. Each client carries a reservation (guaranteed minimum rate), a
//! weight (proportional share of the surplus), and a limit (hard ceiling),
//! plus a class tag (R, B, A, O) that decides which partitioned heap set
//! serves it. Callers either poll ([`PullQueue`]) or register callbacks
//! driven by a background worker ([`PushQueue`]).

pub mod client;
pub mod error;
mod heap;
mod janitor;
pub mod pull;
pub mod push;
pub mod scheduler;
pub mod tag;
pub mod telemetry;
pub mod time;

pub use client::{ClientInfo, ClientType, Phase, ReqParams};
pub use error::Error;
pub use pull::{PullQueue, PullReq};
pub use push::PushQueue;
pub use scheduler::{HeapId, QueueOptions};
pub use telemetry::ClientStats;
pub use time::{get_time, Time};
