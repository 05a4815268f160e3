//! # Flight safety limits
//!
//! The safe zone bounds the targets sent to the drone and the positions it may reach, and the
//! tracking monitor decides when too many frames have been lost to keep flying.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::pose::{Pose, TargetPose, parse_floats};

/// Axis aligned box the drone must stay in, metres
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafeZone {
    /// Lower corner (x, y, z)
    pub min: [f32; 3],
    /// Upper corner (x, y, z)
    pub max: [f32; 3],
    /// Tolerance around the box before the drone is considered out
    pub margin: f32,
}

impl SafeZone {
    /// Create a zone from its bounds
    pub fn new(min: [f32; 3], max: [f32; 3], margin: f32) -> anyhow::Result<Self> {
        if (0..3).any(|axis| min[axis] > max[axis]) {
            return Err(anyhow::anyhow!("Invalid safe zone: min {:?} above max {:?}", min, max));
        }
        if margin < 0.0 {
            return Err(anyhow::anyhow!("Invalid safe zone margin {}", margin));
        }
        Ok(SafeZone { min, max, margin })
    }

    /// Same zone with another margin
    pub fn with_margin(self, margin: f32) -> anyhow::Result<Self> {
        SafeZone::new(self.min, self.max, margin)
    }

    /// Whether a pose is inside the zone extended by the margin
    pub fn contains_with_margin(&self, pose: &Pose) -> bool {
        [pose.x, pose.y, pose.z]
            .iter()
            .enumerate()
            .all(|(axis, v)| *v >= self.min[axis] - self.margin && *v <= self.max[axis] + self.margin)
    }

    /// Clamp a target inside the zone, margin excluded
    pub fn clamp(&self, target: TargetPose) -> TargetPose {
        TargetPose {
            x: target.x.clamp(self.min[0], self.max[0]),
            y: target.y.clamp(self.min[1], self.max[1]),
            z: target.z.clamp(self.min[2], self.max[2]),
            yaw: target.yaw,
        }
    }
}

impl Default for SafeZone {
    fn default() -> Self {
        SafeZone { min: [-1.0, -2.0, 0.0], max: [1.0, 1.0, 1.5], margin: 0.2 }
    }
}

impl Display for SafeZone {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "x [{}, {}] y [{}, {}] z [{}, {}] margin {}",
            self.min[0], self.max[0], self.min[1], self.max[1], self.min[2], self.max[2], self.margin
        )
    }
}

/// Parse `xmin,xmax,ymin,ymax,zmin,zmax`, with the default margin
impl FromStr for SafeZone {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_floats(s)?.as_slice() {
            [xmin, xmax, ymin, ymax, zmin, zmax] => {
                SafeZone::new([*xmin, *ymin, *zmin], [*xmax, *ymax, *zmax], SafeZone::default().margin)
            }
            _ => Err(anyhow::anyhow!("Expected xmin,xmax,ymin,ymax,zmin,zmax, got '{}'", s)),
        }
    }
}

/// Tracking loss detection
///
/// Tracking is lost when too many consecutive frames miss the drone, or when no frame arrived
/// for as long as those frames would have taken to arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingMonitor {
    threshold: u32,
    stale_after: Duration,
}

impl TrackingMonitor {
    /// Shortest silence taken as a stalled stream
    pub const MIN_STALE: Duration = Duration::from_millis(250);

    /// Tracking is lost after more than `threshold` consecutive lost frames, or no frame for
    /// `threshold + 1` frame periods (at least [`MIN_STALE`](Self::MIN_STALE))
    pub fn new(threshold: u32, frame_period: Duration) -> Self {
        let stale_after = frame_period.saturating_mul(threshold.saturating_add(1)).max(Self::MIN_STALE);
        TrackingMonitor { threshold, stale_after }
    }

    /// Lost frame threshold
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Longest time without frames before tracking is lost
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Whether the number of consecutive lost frames means tracking is lost
    pub fn is_lost(&self, lost_frames: u32) -> bool {
        lost_frames > self.threshold
    }

    /// Whether the time since the last frame means tracking is lost
    ///
    /// `None` means no frame was ever received.
    pub fn is_stale(&self, frame_age: Option<Duration>) -> bool {
        frame_age.is_none_or(|age| age > self.stale_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_extends_the_zone() {
        let zone = SafeZone::default();
        assert!(zone.contains_with_margin(&Pose::at(0.0, 0.0, 0.5)));
        assert!(zone.contains_with_margin(&Pose::at(1.15, -2.1, 1.6)));
        assert!(!zone.contains_with_margin(&Pose::at(1.25, 0.0, 0.5)));
        assert!(!zone.contains_with_margin(&Pose::at(0.0, 0.0, -0.3)));
    }

    #[test]
    fn targets_are_clamped_without_margin() {
        let zone = SafeZone::default();
        let target = zone.clamp(TargetPose::new(3.0, -5.0, 2.0, 0.0));
        assert_eq!(target, TargetPose::new(1.0, -2.0, 1.5, 0.0));
        let inside = TargetPose::new(0.5, 0.5, 0.5, 0.0);
        assert_eq!(zone.clamp(inside), inside);
    }

    #[test]
    fn zone_parses() {
        let zone: SafeZone = "-1,1,-2,1,0,1.5".parse().unwrap();
        assert_eq!(zone, SafeZone::default());
        assert_eq!(zone.with_margin(0.5).unwrap().margin, 0.5);
        assert!("1,-1,0,1,0,1".parse::<SafeZone>().is_err());
        assert!("1,2,3".parse::<SafeZone>().is_err());
    }

    #[test]
    fn loss_is_strictly_above_threshold() {
        let monitor = TrackingMonitor::new(3, Duration::from_millis(10));
        assert!(!monitor.is_lost(3));
        assert!(monitor.is_lost(4));
    }

    #[test]
    fn silent_stream_is_a_loss() {
        let fast = TrackingMonitor::new(3, Duration::from_millis(10));
        assert_eq!(fast.stale_after(), TrackingMonitor::MIN_STALE);
        assert!(!fast.is_stale(Some(Duration::from_millis(100))));
        assert!(fast.is_stale(Some(Duration::from_millis(300))));
        assert!(fast.is_stale(None));

        let tolerant = TrackingMonitor::new(200, Duration::from_millis(10));
        assert_eq!(tolerant.stale_after(), Duration::from_millis(2010));
        assert!(!tolerant.is_stale(Some(Duration::from_secs(1))));
    }
}
