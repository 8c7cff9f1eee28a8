//! Pure admission-controller arithmetic for the archiver (SPEC_FULL §4.2):
//! threshold sampling, trigger gating, ramp-down, and oldest-first chunk
//! carving. Kept free of I/O so it can be exhaustively unit tested.

use crate::config::ArchiverThresholds;
use crate::staging::Entry;

/// Walks `i` from 9 down to `minlevel` (0 if `lasttrigger` is nonzero, else
/// 1); the first `i` where `allusage > threshold_i_usage` is the usage
/// level. Falls through to 0 if nothing fires.
pub fn usage_level(thresholds: &ArchiverThresholds, allusage: u64, lasttrigger: usize) -> usize {
    let minlevel = if lasttrigger != 0 { 0 } else { 1 };
    for i in (minlevel..=9).rev() {
        if let Some(t) = thresholds.get(i) {
            if allusage > t {
                return i;
            }
        }
    }
    0
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Trigger(usize),
    NoTrigger,
}

/// Decides whether to trigger a new archive session this tick, and at what
/// level, per SPEC_FULL §4.2's trigger gate. The sticky-floor invariant
/// (`triggerlevel >= lasttrigger`, SPEC_FULL §8 invariant 3) is enforced
/// here: a firing decision is always raised to at least `lasttrigger`.
pub fn decide_trigger(
    usagelevel: usize,
    current_workers: usize,
    lasttrigger: usize,
    prev_usagelevel: usize,
    pending: u64,
    threshold1: Option<u64>,
) -> Decision {
    let ramp_up_boundary = prev_usagelevel == lasttrigger && lasttrigger > current_workers;
    let level_gate = usagelevel > current_workers || ramp_up_boundary;
    if !level_gate {
        return Decision::NoTrigger;
    }

    let worth_new_chunk = match threshold1 {
        Some(t1) => pending > t1,
        None => false,
    };
    let reuse_is_cheap = lasttrigger >= usagelevel;

    if worth_new_chunk || reuse_is_cheap {
        Decision::Trigger(usagelevel.max(lasttrigger))
    } else {
        Decision::NoTrigger
    }
}

/// Decrements `lasttrigger` toward `usagelevel` by one step per tick when
/// ramping down, or snaps to 0 once `usagelevel` hits 0 (SPEC_FULL §4.2
/// "Ramp-down"). The spec's qualifier "lasttrigger is not equal to the
/// next-sampled threshold index" is read literally as "don't touch it if it
/// would already decrement past usagelevel in one step" - i.e. never
/// undershoot - which a plain one-step decrement already guarantees, so no
/// separate guard is needed beyond the `usagelevel == 0` snap (SPEC_FULL §9
/// open question, documented in DESIGN.md).
pub fn ramp_down(lasttrigger: usize, usagelevel: usize) -> usize {
    if usagelevel == 0 {
        return 0;
    }
    if lasttrigger > usagelevel {
        lasttrigger - 1
    } else {
        lasttrigger
    }
}

/// Pops oldest-mtime-first entries from the front of `pending` (which must
/// already be sorted ascending by mtime) until cumulative size exceeds
/// `target`, or `pending` runs out (SPEC_FULL §4.2 "Worker spawn").
pub fn carve_chunk(pending: &mut Vec<Entry>, target: u64) -> Vec<Entry> {
    let mut chunk = Vec::new();
    let mut total = 0u64;
    while !pending.is_empty() {
        let entry = pending.remove(0);
        total += entry.size;
        chunk.push(entry);
        if total > target {
            break;
        }
    }
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use std::time::{Duration, SystemTime};

    fn thresholds(gib: &[(usize, u64)]) -> ArchiverThresholds {
        let mut raw = std::collections::BTreeMap::new();
        for (i, v) in gib {
            raw.insert(
                crate::config::schema::threshold_key(*i),
                v.to_string(),
            );
        }
        // Build through the public Config loader so GiB -> byte conversion
        // and validation run identically to production.
        let mut text = String::from("dir = /tmp\n");
        for (k, v) in &raw {
            text.push_str(&format!("{k} = {v}\n"));
        }
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("endit.conf");
        std::fs::write(&path, text).unwrap();
        crate::config::Config::from_file(&path).unwrap().archiver_thresholds
    }

    #[test]
    fn usage_level_walks_down_from_nine() {
        let t = thresholds(&[(1, 500), (2, 2000)]);
        assert_eq!(usage_level(&t, 600 * crate::config::GIB, 0), 1);
        assert_eq!(usage_level(&t, 2500 * crate::config::GIB, 0), 2);
        assert_eq!(usage_level(&t, 100 * crate::config::GIB, 0), 0);
    }

    #[test]
    fn usage_level_includes_zero_when_lasttrigger_nonzero() {
        let t = thresholds(&[(1, 500)]);
        // allusage > 0 but below threshold1: without a sticky lasttrigger
        // minlevel starts at 1 so level 0 is never reached/returned (falls
        // through to the 0 default); with lasttrigger nonzero minlevel is 0
        // so the explicit floor is visited, same outcome here since neither
        // path fires a nonzero level. This asserts both take the same
        // fallback.
        assert_eq!(usage_level(&t, 1, 0), 0);
        assert_eq!(usage_level(&t, 1, 2), 0);
    }

    #[test]
    fn trigger_fires_when_usage_exceeds_workers() {
        let d = decide_trigger(2, 0, 0, 0, 100, Some(10));
        assert_eq!(d, Decision::Trigger(2));
    }

    #[test]
    fn trigger_respects_sticky_floor() {
        // usagelevel dropped to 1 but lasttrigger is 3; ramp-up boundary not
        // met and level_gate fails since usagelevel(1) <= current_workers(3),
        // so no trigger - ramp-down handles the decrease instead.
        let d = decide_trigger(1, 3, 3, 3, 1000, Some(10));
        assert_eq!(d, Decision::NoTrigger);
    }

    #[test]
    fn trigger_does_not_fire_without_worthwhile_chunk_or_reuse() {
        let d = decide_trigger(2, 0, 0, 0, 5, Some(10));
        assert_eq!(d, Decision::NoTrigger);
    }

    #[test]
    fn trigger_fires_on_cheap_reuse_even_with_small_pending() {
        let d = decide_trigger(2, 0, 3, 0, 5, Some(10));
        assert_eq!(d, Decision::Trigger(3));
    }

    #[test]
    fn ramp_down_decrements_one_step_at_a_time() {
        assert_eq!(ramp_down(3, 1), 2);
        assert_eq!(ramp_down(2, 1), 1);
        assert_eq!(ramp_down(1, 1), 1);
    }

    #[test]
    fn ramp_down_snaps_to_zero_when_usage_is_zero() {
        assert_eq!(ramp_down(3, 0), 0);
    }

    fn entry(id: &str, size: u64, secs_ago: u64) -> Entry {
        Entry {
            id: Identifier::parse(id).unwrap(),
            size,
            mtime: SystemTime::now() - Duration::from_secs(secs_ago),
        }
    }

    #[test]
    fn carve_chunk_stops_once_target_exceeded() {
        let mut pending = vec![entry("1", 10, 300), entry("2", 10, 200), entry("3", 10, 100)];
        let chunk = carve_chunk(&mut pending, 15);
        assert_eq!(chunk.len(), 2);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.as_str(), "3");
    }

    #[test]
    fn carve_chunk_drains_when_under_target() {
        let mut pending = vec![entry("1", 10, 300)];
        let chunk = carve_chunk(&mut pending, 1000);
        assert_eq!(chunk.len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn two_chunks_are_disjoint_and_oldest_first() {
        let mut pending = vec![
            entry("a", 10, 400),
            entry("b", 10, 300),
            entry("c", 10, 200),
            entry("d", 10, 100),
        ];
        let first = carve_chunk(&mut pending, 15);
        let second = carve_chunk(&mut pending, 15);
        assert_eq!(first.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(second.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["c", "d"]);
    }
}
