use serde::{Deserialize, Serialize};

/// Zoom steps as `(max zoom inclusive, threshold in degrees)`.
const ZOOM_THRESHOLDS: &[(f64, f64)] = &[
    (6.0, 1.0),
    (8.0, 0.3),
    (10.0, 0.08),
    (12.0, 0.02),
    (14.0, 0.005),
    (16.0, 0.001),
    (18.0, 0.0002),
];
const MAX_ZOOM_THRESHOLD: f64 = 0.00001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

/// Render group produced for one zoom level. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterGroup {
    pub lat: f64,
    pub lon: f64,
    pub member_ids: Vec<i64>,
}

impl ClusterGroup {
    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }

    /// More than one member renders as a count marker, a single member as a pin.
    pub fn is_aggregate(&self) -> bool {
        self.member_ids.len() > 1
    }
}

/// Greedy single-pass clustering.
///
/// The first unclustered point seeds a group and absorbs every remaining point
/// inside the per-axis box `|dlat| < threshold && |dlon| < threshold` around the
/// seed. The result depends on input order: a point near two seeds joins
/// whichever seed comes first, which keeps click-to-expand groups stable for a
/// given ordering.
pub fn cluster(points: &[MapPoint], threshold_degrees: f64) -> Vec<ClusterGroup> {
    let mut remaining: Vec<MapPoint> = points.to_vec();
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let seed = remaining.remove(0);
        let mut members = vec![seed];
        let mut rest = Vec::with_capacity(remaining.len());
        for point in remaining {
            if within_box(&seed, &point, threshold_degrees) {
                members.push(point);
            } else {
                rest.push(point);
            }
        }
        remaining = rest;
        groups.push(into_group(&members));
    }

    groups
}

/// Step function from map zoom to clustering threshold: coarse at low zoom,
/// close to one marker per point when zoomed in.
pub fn threshold_for_zoom(zoom: f64) -> f64 {
    ZOOM_THRESHOLDS
        .iter()
        .find(|(max_zoom, _)| zoom <= *max_zoom)
        .map(|(_, threshold)| *threshold)
        .unwrap_or(MAX_ZOOM_THRESHOLD)
}

fn within_box(seed: &MapPoint, point: &MapPoint, threshold: f64) -> bool {
    (point.lat - seed.lat).abs() < threshold && (point.lon - seed.lon).abs() < threshold
}

fn into_group(members: &[MapPoint]) -> ClusterGroup {
    let count = members.len() as f64;
    let lat = members.iter().map(|p| p.lat).sum::<f64>() / count;
    let lon = members.iter().map(|p| p.lon).sum::<f64>() / count;
    ClusterGroup {
        lat,
        lon,
        member_ids: members.iter().map(|p| p.id).collect(),
    }
}
