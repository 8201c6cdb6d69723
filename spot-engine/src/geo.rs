//! Spatial index over spot locations
//!
//! # Layout
//!
//! Locations are quantized onto a fixed latitude/longitude grid. Each occupied
//! cell owns its own `RwLock`, so index mutation only blocks readers of the
//! cell being written:
//!
//! ```text
//!   cells:     CellKey ──► Arc<RwLock<HashMap<SpotId, GeoPoint>>>
//!   positions: SpotId  ──► (GeoPoint, CellKey)     (last writer wins)
//! ```
//!
//! A query walks only the cells covering its bounding box, so cost scales
//! with the covered area and result size rather than total spot count. When
//! the covering range is larger than the number of occupied cells the query
//! walks the occupied cells instead.
//!
//! Longitudes do not wrap at the antimeridian.

use crate::types::{BoundingBox, GeoPoint, SpotId};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Mean earth radius
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Length of one degree of latitude on the same sphere `haversine_distance` uses
pub const METERS_PER_DEGREE_LAT: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

/// Great-circle distance between two points (meters)
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Grid cell coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct CellKey {
    row: i64,
    col: i64,
}

type Cell = Arc<RwLock<HashMap<SpotId, GeoPoint>>>;

/// Result of a radius query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nearby {
    /// Spot
    pub spot_id: SpotId,
    /// Distance from the query center (meters)
    pub distance_m: f64,
}

/// Map clustering bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Mean position of the bucket's spots
    pub centroid: GeoPoint,
    /// Number of spots in the bucket
    pub count: usize,
    /// Spots in the bucket, sorted
    pub spot_ids: Vec<SpotId>,
}

/// Grid-partitioned spatial index
pub struct GeoIndex {
    cell_size: f64,
    cells: DashMap<CellKey, Cell>,
    positions: DashMap<SpotId, (GeoPoint, CellKey)>,
}

impl GeoIndex {
    /// Create an empty index with the given cell edge length (degrees)
    pub fn new(cell_size_deg: f64) -> Self {
        Self {
            cell_size: cell_size_deg,
            cells: DashMap::new(),
            positions: DashMap::new(),
        }
    }

    /// Number of indexed spots
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True when nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Indexed location of a spot
    pub fn get(&self, spot_id: &SpotId) -> Option<GeoPoint> {
        self.positions.get(spot_id).map(|entry| entry.value().0)
    }

    /// Insert or move a spot (idempotent on spot id)
    pub fn insert(&self, spot_id: SpotId, location: GeoPoint) -> Result<()> {
        location.validate()?;
        let key = self.cell_of(&location);

        // The positions entry serializes writers of the same spot id.
        match self.positions.entry(spot_id.clone()) {
            Entry::Occupied(mut entry) => {
                let (_, old_key) = *entry.get();
                if old_key != key {
                    self.remove_from_cell(old_key, &spot_id);
                }
                self.insert_into_cell(key, spot_id, location);
                entry.insert((location, key));
            }
            Entry::Vacant(entry) => {
                self.insert_into_cell(key, spot_id, location);
                entry.insert((location, key));
            }
        }

        Ok(())
    }

    /// Alias of [`GeoIndex::insert`]
    pub fn update(&self, spot_id: SpotId, location: GeoPoint) -> Result<()> {
        self.insert(spot_id, location)
    }

    /// Remove a spot; returns whether it was indexed
    pub fn remove(&self, spot_id: &SpotId) -> bool {
        match self.positions.entry(spot_id.clone()) {
            Entry::Occupied(entry) => {
                let (_, key) = *entry.get();
                self.remove_from_cell(key, spot_id);
                entry.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Spots within `radius_m` of `center`, nearest first
    pub fn query(
        &self,
        center: &GeoPoint,
        radius_m: f64,
        limit: Option<usize>,
    ) -> Result<Vec<Nearby>> {
        center.validate()?;
        if !radius_m.is_finite() || radius_m < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "radius must be a non-negative number of meters, got {}",
                radius_m
            )));
        }

        let bounds = BoundingBox::around(center, radius_m);
        let mut hits = Vec::new();
        self.scan(&bounds, |spot_id, location| {
            let distance_m = haversine_distance(center, location);
            if distance_m <= radius_m {
                hits.push(Nearby {
                    spot_id: spot_id.clone(),
                    distance_m,
                });
            }
        });

        hits.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.spot_id.cmp(&b.spot_id))
        });
        if let Some(limit) = limit {
            hits.truncate(limit);
        }

        Ok(hits)
    }

    /// Spots inside `bounds` (edges inclusive)
    pub fn query_bounding_box(&self, bounds: &BoundingBox) -> Result<BTreeSet<SpotId>> {
        bounds.validate()?;

        let mut hits = BTreeSet::new();
        self.scan(bounds, |spot_id, location| {
            if bounds.contains(location) {
                hits.insert(spot_id.clone());
            }
        });

        Ok(hits)
    }

    /// Bucket the spots inside `bounds` into `precision_deg` cells
    pub fn clusters(&self, bounds: &BoundingBox, precision_deg: f64) -> Result<Vec<Cluster>> {
        bounds.validate()?;
        if !precision_deg.is_finite() || precision_deg <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "cluster precision must be positive, got {}",
                precision_deg
            )));
        }

        // bucket -> (sum lat, sum lon, ids)
        let mut buckets: BTreeMap<(i64, i64), (f64, f64, Vec<SpotId>)> = BTreeMap::new();
        self.scan(bounds, |spot_id, location| {
            if !bounds.contains(location) {
                return;
            }
            let bucket = (
                ((location.latitude + 90.0) / precision_deg).floor() as i64,
                ((location.longitude + 180.0) / precision_deg).floor() as i64,
            );
            let entry = buckets.entry(bucket).or_insert((0.0, 0.0, Vec::new()));
            entry.0 += location.latitude;
            entry.1 += location.longitude;
            entry.2.push(spot_id.clone());
        });

        Ok(buckets
            .into_values()
            .map(|(sum_lat, sum_lon, mut spot_ids)| {
                spot_ids.sort();
                let count = spot_ids.len();
                Cluster {
                    centroid: GeoPoint::new(sum_lat / count as f64, sum_lon / count as f64),
                    count,
                    spot_ids,
                }
            })
            .collect())
    }

    // Cell helpers

    fn cell_of(&self, location: &GeoPoint) -> CellKey {
        CellKey {
            row: ((location.latitude + 90.0) / self.cell_size).floor() as i64,
            col: ((location.longitude + 180.0) / self.cell_size).floor() as i64,
        }
    }

    fn insert_into_cell(&self, key: CellKey, spot_id: SpotId, location: GeoPoint) {
        // Held across the write so an emptied cell cannot be dropped underneath us.
        let cell = self.cells.entry(key).or_default();
        cell.write().insert(spot_id, location);
    }

    fn remove_from_cell(&self, key: CellKey, spot_id: &SpotId) {
        if let Some(cell) = self.cells.get(&key) {
            cell.write().remove(spot_id);
        }
        self.cells.remove_if(&key, |_, cell| cell.read().is_empty());
    }

    /// Visit every indexed point in the cells covering `bounds`
    fn scan(&self, bounds: &BoundingBox, mut visit: impl FnMut(&SpotId, &GeoPoint)) {
        let low = self.cell_of(&GeoPoint::new(bounds.min_lat, bounds.min_lon));
        let high = self.cell_of(&GeoPoint::new(bounds.max_lat, bounds.max_lon));

        let rows = (high.row - low.row + 1) as u128;
        let cols = (high.col - low.col + 1) as u128;
        let in_range = |key: &CellKey| {
            key.row >= low.row && key.row <= high.row && key.col >= low.col && key.col <= high.col
        };

        let covering: Vec<Cell> = if rows * cols > self.cells.len() as u128 {
            self.cells
                .iter()
                .filter(|entry| in_range(entry.key()))
                .map(|entry| entry.value().clone())
                .collect()
        } else {
            let mut cells = Vec::new();
            for row in low.row..=high.row {
                for col in low.col..=high.col {
                    if let Some(cell) = self.cells.get(&CellKey { row, col }) {
                        cells.push(cell.value().clone());
                    }
                }
            }
            cells
        };

        for cell in covering {
            let points = cell.read();
            for (spot_id, location) in points.iter() {
                visit(spot_id, location);
            }
        }
    }
}

impl std::fmt::Debug for GeoIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIndex")
            .field("cell_size", &self.cell_size)
            .field("cells", &self.cells.len())
            .field("spots", &self.positions.len())
            .finish()
    }
}
