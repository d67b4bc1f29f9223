//! Service status snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Observed state of a logical service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Every expected replica is running
    Running,
    /// Replicas exist but not all are running yet
    Starting,
    /// Replicas exist and none is running or starting
    Stopped,
    /// No replica exists
    Missing,
    /// Replicas exist in a state that could not be classified
    Unknown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Running => "running",
            ServiceState::Starting => "starting",
            ServiceState::Stopped => "stopped",
            ServiceState::Missing => "missing",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// State of one container or task, as reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Starting,
    Stopped,
    Unknown,
}

/// Status of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Replicas observed running
    pub running: u32,
    /// Replicas the run expects
    pub expected: u32,
}

/// Point-in-time view of a project's services; never cached
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatusSnapshot {
    pub project: String,
    pub services: BTreeMap<String, ServiceStatus>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tally {
    running: u32,
    starting: u32,
    stopped: u32,
    unknown: u32,
}

impl ServiceStatusSnapshot {
    /// Build a snapshot from per-instance observations
    ///
    /// Every expected service appears in the result, `missing` when no
    /// instance was observed. Observed services that were not expected are
    /// included with an expected count of zero.
    pub fn aggregate<I>(project: &str, expected: &BTreeMap<String, u32>, observations: I) -> Self
    where
        I: IntoIterator<Item = (String, InstanceState)>,
    {
        let mut tallies: BTreeMap<String, Tally> = expected
            .keys()
            .map(|name| (name.clone(), Tally::default()))
            .collect();

        for (service, state) in observations {
            let tally = tallies.entry(service).or_default();
            match state {
                InstanceState::Running => tally.running += 1,
                InstanceState::Starting => tally.starting += 1,
                InstanceState::Stopped => tally.stopped += 1,
                InstanceState::Unknown => tally.unknown += 1,
            }
        }

        let services = tallies
            .into_iter()
            .map(|(name, tally)| {
                let want = expected.get(&name).copied().unwrap_or(0);
                let status = ServiceStatus {
                    state: classify(&tally, want),
                    running: tally.running,
                    expected: want,
                };
                (name, status)
            })
            .collect();

        Self {
            project: project.to_string(),
            services,
            observed_at: Utc::now(),
        }
    }

    pub fn get(&self, service: &str) -> Option<&ServiceStatus> {
        self.services.get(service)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// True once every expected service reports running
    pub fn all_running(&self) -> bool {
        let mut expected = self.services.values().filter(|s| s.expected > 0).peekable();
        expected.peek().is_some() && expected.all(|s| s.state == ServiceState::Running)
    }

    /// True when no instance of any service exists
    pub fn is_empty(&self) -> bool {
        self.services.values().all(|s| s.state == ServiceState::Missing)
    }

    /// Expected services that are not running yet, as `name (state running/expected)`
    pub fn pending(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, s)| s.expected > 0 && s.state != ServiceState::Running)
            .map(|(name, s)| format!("{} ({} {}/{})", name, s.state, s.running, s.expected))
            .collect()
    }
}

fn classify(tally: &Tally, expected: u32) -> ServiceState {
    let total = tally.running + tally.starting + tally.stopped + tally.unknown;
    if total == 0 {
        ServiceState::Missing
    } else if tally.running > 0 && tally.running >= expected {
        ServiceState::Running
    } else if tally.running > 0 || tally.starting > 0 {
        ServiceState::Starting
    } else if tally.stopped > 0 {
        ServiceState::Stopped
    } else {
        ServiceState::Unknown
    }
}

impl fmt::Display for ServiceStatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .services
            .keys()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max("SERVICE".len());

        writeln!(f, "{:<width$}  {:<9}  REPLICAS", "SERVICE", "STATE", width = width)?;
        for (name, status) in &self.services {
            writeln!(
                f,
                "{:<width$}  {:<9}  {}/{}",
                name,
                status.state.to_string(),
                status.running,
                status.expected,
                width = width
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(n, c)| (n.to_string(), *c)).collect()
    }

    fn obs(service: &str, state: InstanceState) -> (String, InstanceState) {
        (service.to_string(), state)
    }

    #[test]
    fn test_all_running() {
        let snapshot = ServiceStatusSnapshot::aggregate(
            "deepracer-0",
            &expected(&[("robomaker", 2), ("rl_coach", 1)]),
            vec![
                obs("robomaker", InstanceState::Running),
                obs("robomaker", InstanceState::Running),
                obs("rl_coach", InstanceState::Running),
            ],
        );

        assert!(snapshot.all_running());
        assert_eq!(snapshot.get("robomaker").unwrap().running, 2);
        assert!(snapshot.pending().is_empty());
    }

    #[test]
    fn test_partial_replicas_are_starting() {
        let snapshot = ServiceStatusSnapshot::aggregate(
            "p",
            &expected(&[("robomaker", 3)]),
            vec![obs("robomaker", InstanceState::Running), obs("robomaker", InstanceState::Starting)],
        );

        assert_eq!(snapshot.get("robomaker").unwrap().state, ServiceState::Starting);
        assert!(!snapshot.all_running());
        assert_eq!(snapshot.pending(), vec!["robomaker (starting 1/3)"]);
    }

    #[test]
    fn test_missing_and_stopped() {
        let snapshot = ServiceStatusSnapshot::aggregate(
            "p",
            &expected(&[("redis", 1), ("rl_coach", 1)]),
            vec![obs("rl_coach", InstanceState::Stopped)],
        );

        assert_eq!(snapshot.get("redis").unwrap().state, ServiceState::Missing);
        assert_eq!(snapshot.get("rl_coach").unwrap().state, ServiceState::Stopped);
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn test_unexpected_services_are_reported_but_ignored() {
        let snapshot = ServiceStatusSnapshot::aggregate(
            "p",
            &expected(&[("redis", 1)]),
            vec![obs("redis", InstanceState::Running), obs("orphan", InstanceState::Stopped)],
        );

        assert!(snapshot.contains("orphan"));
        assert_eq!(snapshot.get("orphan").unwrap().expected, 0);
        assert!(snapshot.all_running());
    }

    #[test]
    fn test_empty_expectations_never_running() {
        let snapshot = ServiceStatusSnapshot::aggregate("p", &BTreeMap::new(), Vec::new());
        assert!(!snapshot.all_running());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_display_table() {
        let snapshot = ServiceStatusSnapshot::aggregate(
            "p",
            &expected(&[("robomaker", 1)]),
            vec![obs("robomaker", InstanceState::Unknown)],
        );
        let table = snapshot.to_string();
        assert!(table.starts_with("SERVICE"));
        assert!(table.contains("robomaker  unknown    0/1"));
    }
}
