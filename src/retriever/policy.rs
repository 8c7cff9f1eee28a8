//! Pure start-policy and buffer-backoff arithmetic for the retriever
//! (SPEC_FULL §4.3). Kept free of I/O so it can be exhaustively unit
//! tested.

use std::time::{Duration, SystemTime};

use super::hint::DEFAULT_VOLUME;

fn before(now: SystemTime, dur: Duration) -> SystemTime {
    now.checked_sub(dur).unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Whether to defer spawning a worker for `volume` this pass (SPEC_FULL
/// §4.3 "Start policy"). `bypass_delays` is `USR1`'s effect for the current
/// pass.
pub fn should_skip_volume(
    volume: &str,
    lastmount: Option<SystemTime>,
    now: SystemTime,
    remountdelay: Duration,
    tsoldest: SystemTime,
    tsnewest: SystemTime,
    fillwait: Duration,
    fillwaitmax: Duration,
    bypass_delays: bool,
) -> bool {
    if volume == DEFAULT_VOLUME {
        return false;
    }

    if let Some(lm) = lastmount {
        if let Some(remount_at) = lm.checked_add(remountdelay) {
            if remount_at > now {
                return true;
            }
        }
    }

    if bypass_delays {
        return false;
    }

    let still_growing = tsoldest > before(now, fillwaitmax) && tsnewest > before(now, fillwait);
    still_growing
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferState {
    Normal,
    Backoff,
    Kill,
}

/// The `in/` filesystem's buffer-pressure state (SPEC_FULL §4.3 "Buffer
/// backoff"). `blocks_total` and `free` are both in bytes.
pub fn buffer_state(
    free: u64,
    blocks_total: u64,
    buffersize: u64,
    backlog_pct: u32,
    kill_pct: u32,
) -> BufferState {
    let effective_buffer = if blocks_total < buffersize { blocks_total / 2 } else { buffersize };

    let kill_floor = effective_buffer * (100u64.saturating_sub(kill_pct as u64)) / 100;
    let backlog_floor = effective_buffer * (100u64.saturating_sub(backlog_pct as u64)) / 100;

    if free <= kill_floor {
        BufferState::Kill
    } else if free <= backlog_floor {
        BufferState::Backoff
    } else {
        BufferState::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn default_volume_never_gated() {
        let now = SystemTime::now();
        assert!(!should_skip_volume(
            DEFAULT_VOLUME,
            Some(now),
            now,
            600 * SEC,
            now,
            now,
            600 * SEC,
            3600 * SEC,
            false,
        ));
    }

    #[test]
    fn too_soon_to_remount_is_skipped() {
        let now = SystemTime::now();
        let lastmount = now - Duration::from_secs(10);
        assert!(should_skip_volume(
            "VOL1", Some(lastmount), now, Duration::from_secs(300),
            now - Duration::from_secs(700), now - Duration::from_secs(700),
            Duration::from_secs(600), Duration::from_secs(3600), false,
        ));
    }

    #[test]
    fn list_still_growing_is_skipped() {
        let now = SystemTime::now();
        assert!(should_skip_volume(
            "VOL1", None, now, Duration::from_secs(300),
            now - Duration::from_secs(100), now - Duration::from_secs(50),
            Duration::from_secs(600), Duration::from_secs(3600), false,
        ));
    }

    #[test]
    fn old_enough_list_is_not_skipped() {
        let now = SystemTime::now();
        assert!(!should_skip_volume(
            "VOL1", None, now, Duration::from_secs(300),
            now - Duration::from_secs(700), now - Duration::from_secs(700),
            Duration::from_secs(600), Duration::from_secs(3600), false,
        ));
    }

    #[test]
    fn usr1_bypasses_fill_wait_but_not_remount_delay() {
        let now = SystemTime::now();
        assert!(!should_skip_volume(
            "VOL1", None, now, Duration::from_secs(300),
            now, now, Duration::from_secs(600), Duration::from_secs(3600), true,
        ));
        let lastmount = now - Duration::from_secs(10);
        assert!(should_skip_volume(
            "VOL1", Some(lastmount), now, Duration::from_secs(300),
            now, now, Duration::from_secs(600), Duration::from_secs(3600), true,
        ));
    }

    #[test]
    fn buffer_state_normal_when_plenty_free() {
        let gib = 1024u64 * 1024 * 1024;
        assert_eq!(buffer_state(900 * gib, 2000 * gib, 1000 * gib, 10, 95), BufferState::Normal);
    }

    #[test]
    fn buffer_state_backoff_below_backlog_floor() {
        let gib = 1024u64 * 1024 * 1024;
        assert_eq!(buffer_state(50 * gib, 2000 * gib, 1000 * gib, 10, 95), BufferState::Backoff);
    }

    #[test]
    fn buffer_state_kill_below_kill_floor() {
        let gib = 1024u64 * 1024 * 1024;
        assert_eq!(buffer_state(10 * gib, 2000 * gib, 1000 * gib, 10, 95), BufferState::Kill);
    }

    #[test]
    fn buffer_state_halves_buffer_when_filesystem_smaller() {
        let gib = 1024u64 * 1024 * 1024;
        // blocks_total (100 GiB) < buffersize (1000 GiB) -> effective buffer
        // is 50 GiB; kill floor at 5% of that is 2.5 GiB.
        assert_eq!(buffer_state(2 * gib, 100 * gib, 1000 * gib, 10, 95), BufferState::Kill);
    }
}
