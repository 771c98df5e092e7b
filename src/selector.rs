//! Weighted least-loaded host selection.
//!
//! Selection is a pure function of the configured host order, a load snapshot and the
//! hosts excluded for this invocation. Given the same inputs it always picks the same host.

use std::collections::HashSet;

use crate::host::HostEntry;
use crate::store::LoadSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<'a> {
    Host(&'a HostEntry),
    /// Every entry is excluded, or there are none.
    Exhausted,
}

/// Active jobs divided (rounding down) by the host's weight.
pub fn weighted_load(active: usize, weight: u32) -> usize {
    active / weight.max(1) as usize
}

/// Walks `hosts` in order, skipping `bad` ones.
///
/// An idle host (weighted load 0) is taken immediately. Otherwise the lowest weighted load
/// wins, and among equal loads the earliest entry wins.
pub fn select_host<'a>(
    hosts: &'a [HostEntry],
    snapshot: &LoadSnapshot,
    bad: &HashSet<String>,
) -> Selection<'a> {
    let mut best: Option<(&HostEntry, usize)> = None;
    for host in hosts.iter().filter(|host| !bad.contains(&host.name)) {
        let load = snapshot.weighted_load(host);
        if load == 0 {
            return Selection::Host(host);
        }
        match best {
            Some((_, lowest)) if lowest <= load => {}
            _ => best = Some((host, load)),
        }
    }
    best.map_or(Selection::Exhausted, |(host, _)| Selection::Host(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(specs: &[(&str, u32)]) -> Vec<HostEntry> {
        specs
            .iter()
            .map(|&(name, weight)| HostEntry::new(name, weight))
            .collect()
    }

    fn snapshot(active: &[(&str, usize)]) -> LoadSnapshot {
        active.iter().copied().collect()
    }

    fn pick<'a>(
        hosts: &'a [HostEntry],
        snapshot: &LoadSnapshot,
        bad: &HashSet<String>,
    ) -> Option<&'a str> {
        match select_host(hosts, snapshot, bad) {
            Selection::Host(host) => Some(&host.name),
            Selection::Exhausted => None,
        }
    }

    #[test]
    fn test_weighted_load_floors() {
        assert_eq!(weighted_load(0, 1), 0);
        assert_eq!(weighted_load(3, 1), 3);
        assert_eq!(weighted_load(3, 2), 1);
        assert_eq!(weighted_load(1, 2), 0);
        assert_eq!(weighted_load(5, 3), 1);
    }

    #[test]
    fn test_idle_picks_first_host() {
        let hosts = hosts(&[("a", 1), ("b", 1), ("c", 4)]);
        assert_eq!(
            pick(&hosts, &LoadSnapshot::default(), &HashSet::new()),
            Some("a")
        );
    }

    #[test]
    fn test_weight_divides_load() {
        let hosts = hosts(&[("a", 1), ("b", 2)]);
        let snapshot = snapshot(&[("a", 3), ("b", 3)]);
        assert_eq!(pick(&hosts, &snapshot, &HashSet::new()), Some("b"));
    }

    #[test]
    fn test_tie_keeps_earlier_host() {
        let hosts = hosts(&[("a", 1), ("b", 1), ("c", 1)]);
        let snapshot = snapshot(&[("a", 2), ("b", 1), ("c", 1)]);
        assert_eq!(pick(&hosts, &snapshot, &HashSet::new()), Some("b"));
    }

    #[test]
    fn test_strictly_lower_load_replaces_best() {
        let hosts = hosts(&[("a", 1), ("b", 1), ("c", 1)]);
        let snapshot = snapshot(&[("a", 3), ("b", 2), ("c", 1)]);
        assert_eq!(pick(&hosts, &snapshot, &HashSet::new()), Some("c"));
    }

    #[test]
    fn test_bad_hosts_are_skipped() {
        let hosts = hosts(&[("a", 1), ("b", 1)]);
        let bad: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(pick(&hosts, &LoadSnapshot::default(), &bad), Some("b"));
    }

    #[test]
    fn test_exhausted() {
        let hosts = hosts(&[("a", 1), ("b", 1)]);
        let bad: HashSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        assert_eq!(
            select_host(&hosts, &LoadSnapshot::default(), &bad),
            Selection::Exhausted
        );
        assert_eq!(
            select_host(&[], &LoadSnapshot::default(), &HashSet::new()),
            Selection::Exhausted
        );
    }

    #[test]
    fn test_successive_dispatches_follow_weights() {
        let hosts = hosts(&[("h1", 1), ("h2", 2), ("h3", 1)]);
        let none = HashSet::new();
        let mut load = LoadSnapshot::default();

        assert_eq!(pick(&hosts, &load, &none), Some("h1"));
        load.record("h1");
        // h1 is at 1, h2 is still idle.
        assert_eq!(pick(&hosts, &load, &none), Some("h2"));
        load.record("h2");
        // floor(1/2) = 0 keeps h2 on the idle fast path ahead of h3.
        assert_eq!(pick(&hosts, &load, &none), Some("h2"));
    }

    #[test]
    fn test_duplicate_entries_are_literal() {
        let hosts = hosts(&[("a", 1), ("b", 1), ("a", 1)]);
        let snapshot = snapshot(&[("a", 1), ("b", 1)]);
        // Both "a" entries share one count; the first declared entry wins the tie.
        match select_host(&hosts, &snapshot, &HashSet::new()) {
            Selection::Host(host) => assert!(std::ptr::eq(host, &hosts[0])),
            Selection::Exhausted => panic!("expected a host"),
        }
    }

    #[test]
    fn test_localhost_is_an_ordinary_candidate() {
        let hosts = hosts(&[("a", 1), ("localhost", 1)]);
        let snapshot = snapshot(&[("a", 2)]);
        assert_eq!(pick(&hosts, &snapshot, &HashSet::new()), Some("localhost"));
    }
}
