//! Logical capture slots and their live configuration.
//!
//! A slot is a fixed capture position (`cam1`, `cam2`). Slots exist for the
//! process lifetime; only their binding and settings change.
//!
//! `SlotSettings` is the one piece of per-slot state the outside world may
//! mutate at any time. Capture workers read it at every cycle, so frame rate
//! and persistence changes take effect without a restart.

use parking_lot::RwLock;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Number of capture slots managed by default.
pub const SLOT_COUNT: usize = 2;

/// Frame rate applied to a slot until someone changes it.
pub const DEFAULT_FPS: f64 = 24.0;

/// Index of a logical capture slot (`0..N`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(pub usize);

impl SlotIndex {
    pub fn index(self) -> usize {
        self.0
    }

    /// One-based camera number used in logs and on-disk folder names.
    pub fn camera_number(self) -> usize {
        self.0 + 1
    }

    pub fn all(count: usize) -> impl Iterator<Item = SlotIndex> {
        (0..count).map(SlotIndex)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.camera_number())
    }
}

/// Point-in-time copy of a slot's settings.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotConfig {
    pub desired_fps: f64,
    pub persist_target: Option<PathBuf>,
    pub persist_enabled: bool,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            desired_fps: DEFAULT_FPS,
            persist_target: None,
            persist_enabled: false,
        }
    }
}

impl SlotConfig {
    /// Directory frames should be written to right now, if any.
    pub fn persist_destination(&self) -> Option<PathBuf> {
        if self.persist_enabled {
            self.persist_target.clone()
        } else {
            None
        }
    }
}

/// Live, shared settings for one slot.
#[derive(Debug, Default)]
pub struct SlotSettings {
    inner: RwLock<SlotConfig>,
}

impl SlotSettings {
    pub fn new(config: SlotConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn current(&self) -> SlotConfig {
        self.inner.read().clone()
    }

    pub fn desired_fps(&self) -> f64 {
        self.inner.read().desired_fps
    }

    pub fn persist_destination(&self) -> Option<PathBuf> {
        self.inner.read().persist_destination()
    }

    /// Update the frame rate. Non-finite values are ignored.
    pub fn set_desired_fps(&self, fps: f64) {
        if !fps.is_finite() {
            log::warn!("ignoring non-finite frame rate {}", fps);
            return;
        }
        self.inner.write().desired_fps = fps;
    }

    pub fn set_persist_target(&self, target: Option<PathBuf>) {
        self.inner.write().persist_target = target;
    }

    pub fn set_persist_enabled(&self, enabled: bool) {
        self.inner.write().persist_enabled = enabled;
    }
}

/// Frame rate actually used for pacing: never below one frame per second.
pub fn effective_fps(fps: f64) -> f64 {
    if fps.is_finite() && fps > 1.0 {
        fps
    } else {
        1.0
    }
}

/// Target duration of one capture cycle, `1 / max(1, fps)`.
pub fn frame_period(fps: f64) -> Duration {
    Duration::from_secs_f64(1.0 / effective_fps(fps))
}

/// Consecutive failed reads after which a stream counts as dead.
///
/// `ceil(max(1, fps) * window_secs)`, and at least one.
pub fn failure_threshold(fps: f64, window_secs: f64) -> u32 {
    let raw = (effective_fps(fps) * window_secs).ceil();
    if raw.is_finite() && raw >= 1.0 {
        raw.min(u32::MAX as f64) as u32
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_two_seconds_of_frames() {
        assert_eq!(failure_threshold(24.0, 2.0), 48);
        assert_eq!(failure_threshold(30.0, 2.0), 60);
        assert_eq!(failure_threshold(12.5, 2.0), 25);
        assert_eq!(failure_threshold(7.3, 2.0), 15);
    }

    #[test]
    fn threshold_floors_fps_at_one() {
        assert_eq!(failure_threshold(0.0, 2.0), 2);
        assert_eq!(failure_threshold(-5.0, 2.0), 2);
        assert_eq!(failure_threshold(f64::NAN, 2.0), 2);
        assert_eq!(failure_threshold(24.0, 0.0), 1);
    }

    #[test]
    fn frame_period_never_exceeds_one_second() {
        assert_eq!(frame_period(0.5), Duration::from_secs(1));
        assert_eq!(frame_period(4.0), Duration::from_millis(250));
    }

    #[test]
    fn persist_destination_requires_flag_and_target() {
        let settings = SlotSettings::default();
        assert_eq!(settings.persist_destination(), None);

        settings.set_persist_enabled(true);
        assert_eq!(settings.persist_destination(), None);

        settings.set_persist_target(Some(PathBuf::from("/tmp/cam1")));
        assert_eq!(
            settings.persist_destination(),
            Some(PathBuf::from("/tmp/cam1"))
        );

        settings.set_persist_enabled(false);
        assert_eq!(settings.persist_destination(), None);
    }

    #[test]
    fn non_finite_fps_is_ignored() {
        let settings = SlotSettings::default();
        settings.set_desired_fps(f64::INFINITY);
        assert_eq!(settings.desired_fps(), DEFAULT_FPS);
        settings.set_desired_fps(10.0);
        assert_eq!(settings.desired_fps(), 10.0);
    }

    #[test]
    fn slot_display_is_one_based() {
        assert_eq!(SlotIndex(0).to_string(), "cam1");
        assert_eq!(SlotIndex(1).to_string(), "cam2");
    }
}
