// src/detection/clustering.rs
//
// Agglomerative merge of nearby detections into school-level detections.
// Cluster centroids are re-measured after every merge, so chains of close
// marks collapse even when their end points are far apart.

use crate::types::Detection;
use tracing::debug;

/// Merge detections whose cluster centroids are closer than `merge_distance`.
///
/// Each pass merges the first eligible pair in input order, then starts over;
/// the result is deterministic for a given input ordering. Single-member
/// clusters come back unchanged.
pub fn cluster_detections(detections: &[Detection], merge_distance: f64) -> Vec<Detection> {
    if detections.len() <= 1 {
        return detections.to_vec();
    }

    let mut clusters: Vec<Vec<Detection>> = detections.iter().map(|d| vec![*d]).collect();

    while let Some((i, j)) = first_mergeable_pair(&clusters, merge_distance) {
        let absorbed = clusters.remove(j);
        clusters[i].extend(absorbed);
    }

    let merged: Vec<Detection> = clusters.iter().map(|c| merge_cluster(c)).collect();
    if merged.len() != detections.len() {
        debug!(
            "Clustering: {} detections -> {} clusters",
            detections.len(),
            merged.len()
        );
    }
    merged
}

fn first_mergeable_pair(clusters: &[Vec<Detection>], merge_distance: f64) -> Option<(usize, usize)> {
    let centroids: Vec<(f64, f64)> = clusters.iter().map(|c| mean_centroid(c)).collect();

    for i in 0..centroids.len() {
        for j in (i + 1)..centroids.len() {
            let dx = centroids[i].0 - centroids[j].0;
            let dy = centroids[i].1 - centroids[j].1;
            if (dx * dx + dy * dy).sqrt() < merge_distance {
                return Some((i, j));
            }
        }
    }
    None
}

fn mean_centroid(cluster: &[Detection]) -> (f64, f64) {
    let n = cluster.len() as f64;
    let (sx, sy) = cluster
        .iter()
        .fold((0.0, 0.0), |(sx, sy), d| (sx + d.centroid.0, sy + d.centroid.1));
    (sx / n, sy / n)
}

/// Union bbox, summed area, unweighted mean of density/tightness/centroid.
fn merge_cluster(cluster: &[Detection]) -> Detection {
    if let [single] = cluster {
        return *single;
    }

    let n = cluster.len() as f64;
    let first = cluster[0];
    let bbox = cluster[1..]
        .iter()
        .fold(first.bbox, |acc, d| acc.union(&d.bbox));

    Detection {
        bbox,
        area: cluster.iter().map(|d| d.area).sum(),
        density: cluster.iter().map(|d| d.density).sum::<f64>() / n,
        tightness: cluster.iter().map(|d| d.tightness).sum::<f64>() / n,
        centroid: mean_centroid(cluster),
    }
}
