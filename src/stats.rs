//! Process-wide counters, shared by every session through the context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::StatsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    LifetimeSessions,
    LifetimeControlSessions,
    LifetimeTlsSessions,
    ActiveSessions,
    Uptime,
}

impl Stat {
    pub const ALL: [Stat; 5] = [
        Stat::LifetimeSessions,
        Stat::LifetimeControlSessions,
        Stat::LifetimeTlsSessions,
        Stat::Uptime,
        Stat::ActiveSessions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stat::LifetimeSessions => "lifetime_sessions",
            Stat::LifetimeControlSessions => "lifetime_control_sessions",
            Stat::LifetimeTlsSessions => "lifetime_tls_sessions",
            Stat::ActiveSessions => "active_sessions",
            Stat::Uptime => "uptime",
        }
    }

    pub fn is_incrementable(self) -> bool {
        matches!(
            self,
            Stat::LifetimeSessions | Stat::LifetimeControlSessions | Stat::LifetimeTlsSessions
        )
    }

    pub fn is_settable(self) -> bool {
        self == Stat::ActiveSessions
    }

    fn slot(self) -> Option<usize> {
        match self {
            Stat::LifetimeSessions => Some(0),
            Stat::LifetimeControlSessions => Some(1),
            Stat::LifetimeTlsSessions => Some(2),
            Stat::ActiveSessions => Some(3),
            Stat::Uptime => None,
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct Stats {
    started: Instant,
    counters: [AtomicU64; 4],
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Default::default(),
        }
    }

    pub fn increment(&self, stat: Stat) -> Result<(), StatsError> {
        match stat.slot() {
            Some(slot) if stat.is_incrementable() => {
                self.counters[slot].fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(StatsError::NotIncrementable(stat.name())),
        }
    }

    pub fn set(&self, stat: Stat, value: u64) -> Result<(), StatsError> {
        match stat.slot() {
            Some(slot) if stat.is_settable() => {
                self.counters[slot].store(value, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(StatsError::NotSettable(stat.name())),
        }
    }

    pub fn get(&self, stat: Stat) -> u64 {
        match stat.slot() {
            Some(slot) => self.counters[slot].load(Ordering::SeqCst),
            None => self.started.elapsed().as_secs(),
        }
    }

    /// Every tracked stat, keyed by name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Stat::ALL
            .into_iter()
            .map(|stat| (stat.name(), self.get(stat)))
            .collect()
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_lifetime_counters() {
        let stats = Stats::new();
        stats.increment(Stat::LifetimeSessions).unwrap();
        stats.increment(Stat::LifetimeSessions).unwrap();
        stats.increment(Stat::LifetimeTlsSessions).unwrap();

        assert_eq!(stats.get(Stat::LifetimeSessions), 2);
        assert_eq!(stats.get(Stat::LifetimeTlsSessions), 1);
        assert_eq!(stats.get(Stat::LifetimeControlSessions), 0);
    }

    #[test]
    fn rejects_wrong_kind_of_update() {
        let stats = Stats::new();
        assert_eq!(
            stats.increment(Stat::Uptime),
            Err(StatsError::NotIncrementable("uptime"))
        );
        assert_eq!(
            stats.increment(Stat::ActiveSessions),
            Err(StatsError::NotIncrementable("active_sessions"))
        );
        assert_eq!(
            stats.set(Stat::LifetimeSessions, 3),
            Err(StatsError::NotSettable("lifetime_sessions"))
        );

        stats.set(Stat::ActiveSessions, 7).unwrap();
        assert_eq!(stats.get(Stat::ActiveSessions), 7);
    }

    #[test]
    fn snapshot_has_every_stat() {
        let stats = Stats::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), Stat::ALL.len());
        assert_eq!(snapshot["uptime"], 0);
        assert_eq!(
            serde_json::to_string(&snapshot).unwrap(),
            r#"{"active_sessions":0,"lifetime_control_sessions":0,"lifetime_sessions":0,"lifetime_tls_sessions":0,"uptime":0}"#
        );
    }
}
