//! Request tag arithmetic.
//!
//! Every queued request carries a `(reservation, proportion, limit)` tag
//! triple. Each field is a virtual timestamp advanced from the client's
//! previous tag by the distance counters scaled with the inverse rate; a rate
//! of zero pins the field to a sentinel so it can never win (reservation,
//! proportion) or never delay (limit) a dispatch.

use crate::client::ClientInfo;
use crate::time::Time;

/// Tag value meaning "this field can never be scheduled on".
pub const MAX_TAG: f64 = f64::INFINITY;

/// Tag value meaning "this field is always satisfied".
pub const MIN_TAG: f64 = f64::NEG_INFINITY;

/// Scheduling tag attached to a single request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestTag {
    pub reservation: f64,
    pub proportion: f64,
    pub limit: f64,
    /// True once the limit tag has been reached and the request may be
    /// dispatched in a non-reservation phase.
    pub ready: bool,
    pub arrival: Time,
}

impl RequestTag {
    /// Seed tag for a freshly created client record.
    pub(crate) fn initial(arrival: Time) -> Self {
        RequestTag {
            reservation: 0.0,
            proportion: 0.0,
            limit: 0.0,
            ready: false,
            arrival,
        }
    }

    pub(crate) fn with_values(reservation: f64, proportion: f64, limit: f64, arrival: Time) -> Self {
        RequestTag {
            reservation,
            proportion,
            limit,
            ready: false,
            arrival,
        }
    }

    /// Compute the tag for a new request from the previous tag, the client's
    /// QoS parameters, and the distance counters.
    ///
    /// `rho` advances the reservation field, `delta` the proportion and limit
    /// fields. When the client was idle for less than `anticipation_timeout`
    /// the effective arrival is pulled back so the client resumes where it
    /// left off instead of resetting to `time`.
    pub(crate) fn next(
        prev: &RequestTag,
        info: &ClientInfo,
        delta: u32,
        rho: u32,
        time: Time,
        anticipation_timeout: f64,
    ) -> Self {
        let mut max_time = time;
        if time - anticipation_timeout < prev.arrival {
            max_time -= anticipation_timeout;
        }

        RequestTag {
            reservation: tag_calc(max_time, prev.reservation, info.reservation_inv, rho, true),
            proportion: tag_calc(max_time, prev.proportion, info.weight_inv, delta, true),
            limit: tag_calc(max_time, prev.limit, info.limit_inv, delta, false),
            ready: false,
            arrival: time,
        }
    }

    /// True when at least one schedulable field is finite. Clients with both
    /// a zero reservation and a zero weight legitimately fail this and are
    /// only ever served through a limit break.
    pub(crate) fn is_schedulable(&self) -> bool {
        self.reservation < MAX_TAG || self.proportion < MAX_TAG
    }
}

fn tag_calc(time: Time, prev: f64, mut increment: f64, dist: u32, extreme_is_high: bool) -> f64 {
    if increment == 0.0 {
        if extreme_is_high {
            MAX_TAG
        } else {
            MIN_TAG
        }
    } else {
        if dist != 0 {
            increment *= f64::from(dist);
        }
        f64::max(time, prev + increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientInfo, ClientType};

    fn info(reservation: f64, weight: f64, limit: f64) -> ClientInfo {
        ClientInfo::new(reservation, weight, limit, ClientType::R)
    }

    #[test]
    fn fields_advance_by_inverse_rate() {
        let info = info(10.0, 2.0, 5.0);
        let prev = RequestTag::with_values(100.0, 100.0, 100.0, 100.0);
        let tag = RequestTag::next(&prev, &info, 1, 1, 100.0, 0.0);
        assert_eq!(tag.reservation, 100.1);
        assert_eq!(tag.proportion, 100.5);
        assert_eq!(tag.limit, 100.2);
        assert!(!tag.ready);
    }

    #[test]
    fn distance_counters_scale_the_increment() {
        let info = info(10.0, 2.0, 5.0);
        let prev = RequestTag::with_values(100.0, 100.0, 100.0, 100.0);
        let tag = RequestTag::next(&prev, &info, 4, 3, 100.0, 0.0);
        assert!((tag.reservation - 100.3).abs() < 1e-9);
        assert!((tag.proportion - 102.0).abs() < 1e-9);
        assert!((tag.limit - 100.8).abs() < 1e-9);
    }

    #[test]
    fn zero_rates_pin_to_sentinels() {
        let info = info(0.0, 0.0, 0.0);
        let prev = RequestTag::initial(0.0);
        let tag = RequestTag::next(&prev, &info, 1, 1, 50.0, 0.0);
        assert_eq!(tag.reservation, MAX_TAG);
        assert_eq!(tag.proportion, MAX_TAG);
        assert_eq!(tag.limit, MIN_TAG);
        assert!(!tag.is_schedulable());
    }

    #[test]
    fn long_idle_resets_to_arrival_time() {
        let info = info(10.0, 0.0, 0.0);
        let prev = RequestTag::with_values(100.1, 0.0, 0.0, 100.0);
        // Arrives well past the previous tag; the tag snaps to now.
        let tag = RequestTag::next(&prev, &info, 1, 1, 500.0, 0.0);
        assert_eq!(tag.reservation, 500.0);
    }

    #[test]
    fn anticipation_window_keeps_continuity() {
        let info = info(10.0, 0.0, 0.0);
        let prev = RequestTag::with_values(100.1, 0.0, 0.0, 100.0);
        // Within the anticipation window the effective arrival is pulled
        // back, so the recurrence continues from the previous tag.
        let tag = RequestTag::next(&prev, &info, 1, 1, 100.5, 1.0);
        assert!((tag.reservation - 100.2).abs() < 1e-9);
        // Outside it the tag snaps to now as usual.
        let tag = RequestTag::next(&prev, &info, 1, 1, 102.0, 1.0);
        assert_eq!(tag.reservation, 102.0);
    }
}
