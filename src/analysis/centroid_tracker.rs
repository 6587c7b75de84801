// src/analysis/centroid_tracker.rs
//
// Centroid-distance tracker for fish marks and schools.
//
// Design:
//   - Greedy nearest-neighbour matching (a handful of marks per frame)
//   - Tracks survive `max_disappeared` missed frames before removal
//   - Ids are sequential and never reused
//   - Each track keeps a bounded detection history for velocity estimates

use crate::types::{Detection, TrackingConfig};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Samples used for velocity smoothing.
const VELOCITY_WINDOW: usize = 5;

// ============================================================================
// TRACK
// ============================================================================

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    /// Consecutive frames without a match.
    pub misses: u32,
    history: VecDeque<Detection>,
}

impl Track {
    fn new(id: u64, det: Detection) -> Self {
        let mut history = VecDeque::new();
        history.push_back(det);
        Self {
            id,
            misses: 0,
            history,
        }
    }

    pub fn latest(&self) -> Option<&Detection> {
        self.history.back()
    }

    pub fn centroid(&self) -> (f64, f64) {
        self.latest().map(|d| d.centroid).unwrap_or_default()
    }

    pub fn history(&self) -> &VecDeque<Detection> {
        &self.history
    }

    /// Active tracks were matched on the most recent frame; stale ones are
    /// coasting on misses.
    pub fn is_active(&self) -> bool {
        self.misses == 0
    }

    fn push(&mut self, det: Detection, limit: usize) {
        self.history.push_back(det);
        while self.history.len() > limit.max(1) {
            self.history.pop_front();
        }
        self.misses = 0;
    }
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct CentroidTracker {
    config: TrackingConfig,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
}

impl CentroidTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Associate this frame's detections with existing tracks.
    ///
    /// Returns every live track with its most recent detection. A frame with
    /// no detections ages all tracks and returns an empty map.
    pub fn update(&mut self, detections: &[Detection]) -> BTreeMap<u64, Detection> {
        if detections.is_empty() {
            let ids: Vec<u64> = self.tracks.keys().copied().collect();
            for id in ids {
                self.mark_missed(id);
            }
            return BTreeMap::new();
        }

        if self.tracks.is_empty() {
            for det in detections {
                self.register(*det);
            }
            return self.current();
        }

        let track_ids: Vec<u64> = self.tracks.keys().copied().collect();
        let distances: Vec<Vec<f64>> = track_ids
            .iter()
            .map(|id| {
                let (tx, ty) = self.tracks[id].centroid();
                detections
                    .iter()
                    .map(|d| {
                        let dx = tx - d.centroid.0;
                        let dy = ty - d.centroid.1;
                        (dx * dx + dy * dy).sqrt()
                    })
                    .collect()
            })
            .collect();

        // Tracks with the closest candidate pick first.
        let mut order: Vec<usize> = (0..track_ids.len()).collect();
        let row_min = |row: &Vec<f64>| row.iter().copied().fold(f64::INFINITY, f64::min);
        order.sort_by(|&a, &b| {
            row_min(&distances[a])
                .partial_cmp(&row_min(&distances[b]))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut used_cols = vec![false; detections.len()];
        let mut matched_rows = vec![false; track_ids.len()];

        for row in order {
            let nearest = distances[row]
                .iter()
                .enumerate()
                .filter(|(col, _)| !used_cols[*col])
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));

            let Some((col, &distance)) = nearest else {
                continue;
            };
            if distance > self.config.max_distance {
                continue;
            }

            let id = track_ids[row];
            if let Some(track) = self.tracks.get_mut(&id) {
                track.push(detections[col], self.config.history_len);
            }
            used_cols[col] = true;
            matched_rows[row] = true;
        }

        for (row, matched) in matched_rows.iter().enumerate() {
            if !matched {
                self.mark_missed(track_ids[row]);
            }
        }

        for (col, used) in used_cols.iter().enumerate() {
            if !used {
                self.register(detections[col]);
            }
        }

        self.current()
    }

    /// Mean `(dx, dy)` per frame over the last few detections of a track.
    pub fn get_velocity(&self, id: u64) -> Option<(f64, f64)> {
        let history = &self.tracks.get(&id)?.history;
        if history.len() < 2 {
            return None;
        }

        let window = history.len().min(VELOCITY_WINDOW);
        let first = history[history.len() - window].centroid;
        let last = history[history.len() - 1].centroid;
        let frames = (window - 1) as f64;

        Some(((last.0 - first.0) / frames, (last.1 - first.1) / frames))
    }

    pub fn get_track(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Track whose latest detection is exactly `det`, if one is live.
    pub fn track_for(&self, det: &Detection) -> Option<u64> {
        self.tracks
            .values()
            .find(|t| t.is_active() && t.latest() == Some(det))
            .map(|t| t.id)
    }

    fn register(&mut self, det: Detection) {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(id, Track::new(id, det));
        debug!(
            "Track {} registered at ({:.0}, {:.0})",
            id, det.centroid.0, det.centroid.1
        );
    }

    fn mark_missed(&mut self, id: u64) {
        let Some(track) = self.tracks.get_mut(&id) else {
            return;
        };
        track.misses += 1;
        if track.misses > self.config.max_disappeared {
            self.tracks.remove(&id);
            debug!("Track {} removed", id);
        }
    }

    fn current(&self) -> BTreeMap<u64, Detection> {
        self.tracks
            .iter()
            .filter_map(|(id, t)| t.latest().map(|d| (*id, *d)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn det(cx: f64, cy: f64) -> Detection {
        Detection {
            bbox: BoundingBox::new((cx - 10.0) as u32, (cy - 10.0) as u32, 20, 20),
            area: 400.0,
            density: 150.0,
            tightness: 0.8,
            centroid: (cx, cy),
        }
    }

    fn tracker() -> CentroidTracker {
        CentroidTracker::new(TrackingConfig::default())
    }

    #[test]
    fn test_registers_sequential_ids() {
        let mut t = tracker();
        let out = t.update(&[det(100.0, 100.0), det(300.0, 300.0)]);
        assert_eq!(out.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_id_stable_across_small_motion() {
        let mut t = tracker();
        t.update(&[det(100.0, 100.0)]);
        for i in 1..=5 {
            let out = t.update(&[det(100.0 + 4.0 * i as f64, 100.0 + 3.0 * i as f64)]);
            assert_eq!(out.len(), 1);
            assert!(out.contains_key(&0));
        }
    }

    #[test]
    fn test_far_detection_spawns_new_track() {
        let mut t = tracker();
        t.update(&[det(100.0, 100.0)]);
        let out = t.update(&[det(400.0, 400.0)]);
        // Old track coasts, new one registered
        assert_eq!(out.len(), 2);
        assert!(out.contains_key(&1));
        assert_eq!(t.get_track(0).unwrap().misses, 1);
    }

    #[test]
    fn test_track_removed_after_max_disappeared() {
        let mut t = tracker();
        t.update(&[det(100.0, 100.0)]);

        for _ in 0..5 {
            assert!(t.update(&[]).is_empty());
            assert!(t.get_track(0).is_some());
        }
        t.update(&[]);
        assert!(t.get_track(0).is_none());
    }

    #[test]
    fn test_ids_never_reused() {
        let mut t = tracker();
        t.update(&[det(100.0, 100.0)]);
        for _ in 0..6 {
            t.update(&[]);
        }
        let out = t.update(&[det(100.0, 100.0)]);
        assert_eq!(out.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_greedy_closest_track_picks_first() {
        let mut t = tracker();
        t.update(&[det(100.0, 100.0), det(130.0, 100.0)]);

        // One detection close to track 1, within range of both.
        let out = t.update(&[det(128.0, 100.0)]);
        assert_eq!(out[&1].centroid, (128.0, 100.0));
        assert_eq!(t.get_track(0).unwrap().misses, 1);
    }

    #[test]
    fn test_second_choice_when_nearest_taken() {
        let mut t = tracker();
        t.update(&[det(100.0, 100.0), det(110.0, 100.0)]);

        // Both tracks are nearest to the same detection; the loser falls back
        // to its nearest remaining one.
        let out = t.update(&[det(112.0, 100.0), det(85.0, 100.0)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[&1].centroid, (112.0, 100.0));
        assert_eq!(out[&0].centroid, (85.0, 100.0));
    }

    #[test]
    fn test_velocity() {
        let mut t = tracker();
        t.update(&[det(100.0, 100.0)]);
        assert!(t.get_velocity(0).is_none());

        for i in 1..=8 {
            t.update(&[det(100.0 + 2.0 * i as f64, 100.0 + 5.0 * i as f64)]);
        }
        let (vx, vy) = t.get_velocity(0).unwrap();
        assert!((vx - 2.0).abs() < 1e-9);
        assert!((vy - 5.0).abs() < 1e-9);
        assert!(t.get_velocity(42).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut t = CentroidTracker::new(TrackingConfig {
            history_len: 3,
            ..TrackingConfig::default()
        });
        for i in 0..10 {
            t.update(&[det(100.0 + i as f64, 100.0)]);
        }
        let track = t.get_track(0).unwrap();
        assert_eq!(track.history().len(), 3);
        assert_eq!(track.latest().unwrap().centroid, (109.0, 100.0));
    }

    #[test]
    fn test_track_for_detection() {
        let mut t = tracker();
        let d = det(50.0, 60.0);
        t.update(&[d]);
        assert_eq!(t.track_for(&d), Some(0));
        assert_eq!(t.track_for(&det(1.0, 1.0)), None);
    }
}
