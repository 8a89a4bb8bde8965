//! Writers that crash (or get killed) between staging and publishing a
//! file leave it behind in the staging directory.  We delete staged
//! files once they are old enough that no live writer could still own
//! them: at start-up, and then every so often.
//!
//! "Every so often" is randomised: the trigger counts down from a
//! uniform value in `[1, period]`, so it fires at least once every
//! `period` events, about twice as often on average, and a process
//! that always exits after the same number of writes still gets its
//! sweeps.
use std::io::Result;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use rand::Rng;
use tracing::debug;
use tracing::warn;

/// Delete staged files with mtime older than this age.
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(3600);

/// Default number of cache writes between staging sweeps.
pub const DEFAULT_SWEEP_PERIOD: u64 = 64;

/// Deletes every file in `dir` with an mtime older than `max_age`, and
/// returns how many it deleted.  Files that disappear or can't be
/// inspected along the way are skipped.
pub fn sweep_stale_files(dir: &Path, max_age: Duration) -> Result<usize> {
    let threshold = match SystemTime::now().checked_sub(max_age) {
        Some(time) => time,
        None => return Ok(0),
    };

    let mut removed = 0;
    for dirent in std::fs::read_dir(dir)?.flatten() {
        let handle = || -> Result<bool> {
            let metadata = dirent.metadata()?;
            if !metadata.is_file() || metadata.modified()? >= threshold {
                return Ok(false);
            }

            crate::publish::ensure_file_removed(&dirent.path())?;
            Ok(true)
        };

        match handle() {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => debug!(path = ?dirent.path(), error = %e, "skipping staged file"),
        }
    }

    Ok(removed)
}

/// Fires roughly once every `period` events.
#[derive(Debug)]
pub struct SweepTrigger {
    period: u64,
    countdown: AtomicU64,
}

impl SweepTrigger {
    pub fn new(period: u64) -> SweepTrigger {
        // A zero period means "always".
        let period = period.max(1);

        SweepTrigger {
            period,
            countdown: AtomicU64::new(rand::thread_rng().gen_range(1..=period)),
        }
    }

    /// Observes one event, and returns whether the periodic behaviour
    /// should run now.
    pub fn event(&self) -> bool {
        let previous = self
            .countdown
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(if count <= 1 {
                    rand::thread_rng().gen_range(1..=self.period)
                } else {
                    count - 1
                })
            });

        // The closure always returns `Some`.
        matches!(previous, Ok(count) if count <= 1)
    }

    /// Sweeps `dir` if the trigger fires.  Failures are only logged:
    /// the next sweep will get another chance.
    pub fn maybe_sweep(&self, dir: &Path) {
        if !self.event() {
            return;
        }

        match sweep_stale_files(dir, STALE_STAGING_AGE) {
            Ok(removed) => debug!(?dir, removed, "swept staging directory"),
            Err(e) => warn!(?dir, error = %e, "failed to sweep staging directory"),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::sweep::*;
    use filetime::FileTime;

    #[test]
    fn test_sweep_only_stale_files() {
        use test_dir::{DirBuilder, FileType, TestDir};

        let temp = TestDir::temp()
            .create("stale", FileType::ZeroFile(10))
            .create("fresh", FileType::ZeroFile(10))
            .create("subdir", FileType::Dir);

        let old = FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(temp.path("stale"), old).expect("set mtime must succeed");
        filetime::set_file_mtime(temp.path("subdir"), old).expect("set mtime must succeed");

        let root = temp.path("stale").parent().expect("has a parent").to_owned();
        assert_eq!(
            sweep_stale_files(&root, STALE_STAGING_AGE).expect("sweep must succeed"),
            1
        );
        assert!(!temp.path("stale").exists());
        assert!(temp.path("fresh").exists());
        // Only files are swept.
        assert!(temp.path("subdir").exists());
    }

    #[test]
    fn test_sweep_missing_directory() {
        use test_dir::{DirBuilder, TestDir};

        let temp = TestDir::temp();
        assert!(sweep_stale_files(&temp.path("nope"), STALE_STAGING_AGE).is_err());
    }

    #[test]
    fn test_trigger_period() {
        let trigger = SweepTrigger::new(10);

        // Never more than `period` events between two firings.
        let mut max_delay = 0;
        for _ in 0..200 {
            let delay = (1..=10)
                .find(|_| trigger.event())
                .expect("must fire within the period");
            max_delay = max_delay.max(delay);
        }

        // A delay of 9 or 10 has probability 20%; after 200 rounds,
        // we're all but certain to see one.
        assert!(max_delay >= 9);
    }

    #[test]
    fn test_trigger_zero_and_one_period() {
        for period in [0, 1] {
            let trigger = SweepTrigger::new(period);
            for _ in 0..10 {
                assert!(trigger.event());
            }
        }
    }
}
