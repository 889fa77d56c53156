//! # Pose History
//!
//! Recent head poses keyed by the target timestamp of the frame they were
//! rendered for. The compositor hands back only a transform when a frame is
//! submitted, so the encode path looks the pose up either by timestamp or by
//! the closest rotation.
//!
//! Rotations are stored after the zero-pose correction (the recentering
//! transform) is applied. Replacing the correction clears the history so
//! poses from two corrections never mix.

use std::collections::VecDeque;

use glam::{Affine3A, Quat, Vec3};

/// Default number of poses kept (≈ 3× the frames in flight).
pub const DEFAULT_CAPACITY: usize = 360;

/// Tracked device state for one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceMotion {
    pub orientation: Quat,
    pub position: Vec3,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Default for DeviceMotion {
    fn default() -> Self {
        DeviceMotion {
            orientation: Quat::IDENTITY,
            position: Vec3::ZERO,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        }
    }
}

/// One remembered pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseEntry {
    pub target_timestamp_ns: u64,
    pub motion: DeviceMotion,
    /// Orientation as a 3×4 transform, correction applied.
    pub rotation_matrix: Affine3A,
}

/// Bounded FIFO of recent poses.
#[derive(Debug, Clone)]
pub struct PoseHistory {
    entries: VecDeque<PoseEntry>,
    capacity: usize,
    transform: Affine3A,
    transform_is_identity: bool,
}

impl PoseHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        PoseHistory {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
            transform: Affine3A::IDENTITY,
            transform_is_identity: true,
        }
    }

    /// Record the pose for `target_timestamp_ns`. Returns `false` when the
    /// update repeats the newest timestamp and was dropped.
    pub fn on_pose_updated(&mut self, target_timestamp_ns: u64, motion: DeviceMotion) -> bool {
        if self
            .entries
            .back()
            .is_some_and(|e| e.target_timestamp_ns == target_timestamp_ns)
        {
            return false;
        }

        let rotation = Affine3A::from_quat(motion.orientation);
        let rotation_matrix = if self.transform_is_identity {
            rotation
        } else {
            self.transform * rotation
        };

        self.entries.push_back(PoseEntry {
            target_timestamp_ns,
            motion,
            rotation_matrix,
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        true
    }

    /// Exact timestamp lookup, newest first.
    pub fn get_pose_at(&self, target_timestamp_ns: u64) -> Option<PoseEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.target_timestamp_ns == target_timestamp_ns)
            .copied()
    }

    /// Entry whose rotation is closest to `candidate`.
    ///
    /// Distance is the sum of squared differences of the 3×3 rotation block;
    /// translation is ignored.
    pub fn get_best_pose_match(&self, candidate: &Affine3A) -> Option<PoseEntry> {
        let mut best: Option<(f32, &PoseEntry)> = None;
        for entry in &self.entries {
            let d = entry.rotation_matrix.matrix3 - candidate.matrix3;
            let distance = d.x_axis.length_squared()
                + d.y_axis.length_squared()
                + d.z_axis.length_squared();
            if best.is_none_or(|(b, _)| distance < b) {
                best = Some((distance, entry));
            }
        }
        best.map(|(_, e)| *e)
    }

    /// Replace the zero-pose correction and forget every stored pose.
    pub fn set_transform(&mut self, transform: Affine3A) {
        self.transform = transform;
        self.transform_is_identity = transform == Affine3A::IDENTITY;
        self.entries.clear();
        tracing::debug!(identity = self.transform_is_identity, "pose correction replaced");
    }

    pub fn transform(&self) -> &Affine3A {
        &self.transform
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PoseHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn yaw(angle: f32) -> DeviceMotion {
        DeviceMotion {
            orientation: Quat::from_rotation_y(angle),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_timestamp_coalesced() {
        let mut h = PoseHistory::default();
        assert!(h.on_pose_updated(10, yaw(0.0)));
        assert!(!h.on_pose_updated(10, yaw(1.0)));
        assert_eq!(h.len(), 1);
        assert_eq!(h.get_pose_at(10).unwrap().motion, yaw(0.0));
    }

    #[test]
    fn fifo_eviction() {
        let mut h = PoseHistory::new(4);
        for ts in 0..10u64 {
            h.on_pose_updated(ts, yaw(ts as f32 * 0.1));
        }
        assert_eq!(h.len(), 4);
        assert!(h.get_pose_at(5).is_none());
        assert!(h.get_pose_at(6).is_some());
        assert!(h.get_pose_at(9).is_some());
    }

    #[test]
    fn best_match_picks_closest_rotation() {
        let mut h = PoseHistory::default();
        for (i, angle) in [0.0f32, 0.3, 0.6, 0.9].iter().enumerate() {
            h.on_pose_updated(i as u64 * 100, yaw(*angle));
        }
        let candidate = Affine3A::from_quat(Quat::from_rotation_y(0.58));
        assert_eq!(h.get_best_pose_match(&candidate).unwrap().target_timestamp_ns, 200);
    }

    #[test]
    fn best_match_ignores_translation() {
        let mut h = PoseHistory::default();
        h.on_pose_updated(1, yaw(0.0));
        h.on_pose_updated(2, yaw(1.0));
        let candidate = Affine3A::from_rotation_translation(
            Quat::from_rotation_y(1.0),
            Vec3::new(100.0, -5.0, 3.0),
        );
        assert_eq!(h.get_best_pose_match(&candidate).unwrap().target_timestamp_ns, 2);
    }

    #[test]
    fn empty_history_has_no_match() {
        let h = PoseHistory::default();
        assert!(h.get_best_pose_match(&Affine3A::IDENTITY).is_none());
        assert!(h.get_pose_at(0).is_none());
    }

    #[test]
    fn correction_applied_and_history_cleared() {
        let mut h = PoseHistory::default();
        h.on_pose_updated(1, yaw(0.0));

        let correction = Affine3A::from_quat(Quat::from_rotation_y(FRAC_PI_2));
        h.set_transform(correction);
        assert!(h.is_empty());

        h.on_pose_updated(2, yaw(0.0));
        let stored = h.get_pose_at(2).unwrap().rotation_matrix;
        assert!(stored.abs_diff_eq(correction, 1e-6));

        h.set_transform(Affine3A::IDENTITY);
        h.on_pose_updated(3, yaw(0.5));
        let stored = h.get_pose_at(3).unwrap().rotation_matrix;
        assert!(stored.abs_diff_eq(Affine3A::from_quat(Quat::from_rotation_y(0.5)), 1e-6));
    }
}
