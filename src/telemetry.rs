//! Per-window telemetry records and client snapshots.
//!
//! At every window boundary the scheduler appends one line per client to a
//! plain text file (`scheduling.txt` by default) so runs can be compared
//! offline. Records are formatted under the data lock but written in one
//! batch per window; a failed write is logged and never affects dispatch.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

use crate::client::{ClientInfo, WindowCounters};
use crate::time::Time;

/// Point-in-time view of one client's scheduling state.
///
/// Returned by the queue facades for monitoring and tests; serializable in
/// case callers want to ship it to their own sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    pub client_type: crate::client::ClientType,
    pub reservation: f64,
    pub weight: f64,
    pub limit: f64,
    pub resource: f64,
    pub r_compensation: f64,
    pub prop_delta: f64,
    pub idle: bool,
    pub queued: usize,
    pub counters: WindowCounters,
}

/// Append-only writer for the per-window scheduling records.
pub(crate) struct ScheduleLog {
    path: PathBuf,
}

impl ScheduleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ScheduleLog { path: path.into() }
    }

    /// Append one window's worth of records.
    pub fn append(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                for line in lines {
                    file.write_all(line.as_bytes())?;
                    file.write_all(b"\n")?;
                }
                Ok(())
            });
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to append scheduling records");
        }
    }

    /// One client record:
    /// `<time>,<CLASS>_<index>(<resource>, <reservation>+<comp>,<weight>, <limit>):\t<counters>`.
    pub fn client_line(
        now: Time,
        info: &ClientInfo,
        index: u32,
        resource: f64,
        r_compensation: f64,
        counters: &WindowCounters,
    ) -> String {
        format!(
            "{:.6},{}_{}({:.6}, {:.6}+{:.6},{:.6}, {:.6}):\t{}, {}, {}, {}, {}, {}, {}, {}",
            now,
            info.client_type,
            index,
            resource,
            info.reservation,
            r_compensation,
            info.weight,
            info.limit,
            counters.r0,
            counters.r0_break_limit,
            counters.deltar,
            counters.deltar_break_limit,
            counters.b,
            counters.b_break_limit,
            counters.be,
            counters.be_break_limit,
        )
    }

    /// Emitted before a client's record when the info callback returned a
    /// different parameter set at the window boundary.
    pub fn update_line(old: &ClientInfo, new: &ClientInfo) -> String {
        format!(
            "update: ({},{},{},{}) -> ({},{},{},{})",
            old.client_type,
            old.reservation,
            old.weight,
            old.limit,
            new.client_type,
            new.reservation,
            new.weight,
            new.limit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientType;

    #[test]
    fn client_line_format() {
        let info = ClientInfo::new(100.0, 2.0, 200.0, ClientType::R);
        let counters = WindowCounters {
            r0: 80,
            deltar: 5,
            ..WindowCounters::default()
        };
        let line = ScheduleLog::client_line(12.5, &info, 3, 150.0, 4.0, &counters);
        assert!(line.starts_with("12.500000,R_3(150.000000, 100.000000+4.000000,"));
        assert!(line.ends_with("80, 0, 5, 0, 0, 0, 0, 0"));
    }

    #[test]
    fn update_line_shows_both_parameter_sets() {
        let old = ClientInfo::new(0.0, 1.0, 0.0, ClientType::B);
        let new = ClientInfo::new(50.0, 0.0, 50.0, ClientType::R);
        assert_eq!(
            ScheduleLog::update_line(&old, &new),
            "update: (B,0,1,0) -> (R,50,0,50)"
        );
    }

    #[test]
    fn append_creates_and_extends_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scheduling.txt");
        let log = ScheduleLog::new(&path);

        log.append(&["first".to_string()]);
        log.append(&["second".to_string()]);
        let content = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(content, "first\nsecond\n");
    }
}
