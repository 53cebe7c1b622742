//! Grid specification and geodesy: resolution-tag axes, great-circle
//! distance, and the localization index-set cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Component, Error, Result};

/// Mean radius of the Earth in kilometers, matching the value used by the
/// original tool's `calcDist_km`.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A great-circle (lat, lon) to (lat, lon) distance in kilometers, using the
/// spherical law of cosines via `atan2`.
pub fn great_circle_distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Immutable lat/lon/level axes for one of the resolution tags this tool
/// understands. Construction is the only place an unsupported tag can be
/// rejected.
#[derive(Debug, Clone)]
pub struct GridSpec {
    tag: String,
    lat: Vec<f64>,
    lon: Vec<f64>,
    levels: usize,
    cache: Arc<Mutex<HashMap<(usize, usize), Arc<(Vec<usize>, Vec<usize>)>>>>,
}

fn axes_for_tag(tag: &str) -> Option<(Vec<f64>, Vec<f64>, usize)> {
    // Longitude/latitude center tables transcribed from the original
    // `initialize_scaling_factors.py` grid-tag table. Level counts follow
    // GEOS-Chem's standard 47-level vertical grid for all tags; this tool
    // does not need to distinguish vertical resolutions.
    const LEVELS: usize = 47;

    let axes = match tag {
        "4.0x5.0" => {
            let lon = arange(-180.0, 176.0, 5.0);
            let mut lat = vec![-89.0];
            lat.extend(arange(-86.0, 87.0, 4.0));
            lat.push(89.0);
            (lat, lon)
        }
        "2.0x2.5" => {
            let lon = arange(-180.0, 178.0, 2.5);
            let mut lat = vec![-89.5];
            lat.extend(arange(-88.0, 89.0, 2.0));
            lat.push(89.5);
            (lat, lon)
        }
        "1x1" => {
            let lon = arange(-179.5, 180.0, 1.0);
            let lat = arange(-89.5, 90.0, 1.0);
            (lat, lon)
        }
        "0.5x0.625" | "MERRA2" => {
            let lon = linspace_step(-180.0, 0.625, 576);
            let lat = linspace_step(-90.0, 0.5, 361);
            (lat, lon)
        }
        "AS_MERRA2" => {
            let lon = arange(60.0, 150.01, 0.625);
            let lat = arange(-11.0, 55.01, 0.5);
            (lat, lon)
        }
        "EU_MERRA2" => {
            let lon = arange(-30.0, 50.01, 0.625);
            let lat = arange(30.0, 70.01, 0.5);
            (lat, lon)
        }
        "NA_MERRA2" => {
            let lon = arange(-140.0, -39.99, 0.625);
            let lat = arange(10.0, 70.01, 0.5);
            (lat, lon)
        }
        "0.25x0.3125" | "GEOSFP" => {
            let lon = linspace_step(-180.0, 0.3125, 1152);
            let lat = linspace_step(-90.0, 0.25, 721);
            (lat, lon)
        }
        "CH_GEOSFP" => {
            let lon = arange(70.0, 140.01, 0.3125);
            let lat = arange(15.0, 55.01, 0.25);
            (lat, lon)
        }
        "EU_GEOSFP" => {
            let lon = arange(-15.0, 40.01, 0.3125);
            let lat = arange(32.75, 61.26, 0.25);
            (lat, lon)
        }
        "NA_GEOSFP" => {
            let lon = arange(-130.0, -59.99, 0.3125);
            let lat = arange(9.75, 60.01, 0.25);
            (lat, lon)
        }
        _ => return None,
    };

    Some((axes.0, axes.1, LEVELS))
}

/// Half-open `[start, stop)` range stepped by `step`, mirroring
/// `numpy.arange`.
fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let mut out = Vec::new();
    let mut v = start;
    let mut i = 0;
    while v < stop {
        out.push(v);
        i += 1;
        v = start + (i as f64) * step;
    }
    out
}

fn linspace_step(start: f64, step: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| start + step * i as f64).collect()
}

impl GridSpec {
    /// Build the axes for a known resolution tag, or `{region}_{met}`
    /// regional cutout tag.
    pub fn new(tag: &str) -> Result<Self> {
        let (lat, lon, levels) = axes_for_tag(tag).ok_or_else(|| {
            Error::config(
                Component::Grid,
                format!("unsupported grid resolution tag '{tag}'"),
            )
        })?;

        if !is_strictly_ascending(&lat) || !is_strictly_ascending(&lon) {
            return Err(Error::config(
                Component::Grid,
                format!("grid tag '{tag}' produced non-monotonic axes"),
            ));
        }
        if lat.iter().any(|l| l.abs() > 90.0) {
            return Err(Error::config(
                Component::Grid,
                format!("grid tag '{tag}' produced |lat| > 90"),
            ));
        }

        Ok(GridSpec {
            tag: tag.to_string(),
            lat,
            lon,
            levels,
            cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn lat(&self) -> &[f64] {
        &self.lat
    }

    pub fn lon(&self) -> &[f64] {
        &self.lon
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn nlat(&self) -> usize {
        self.lat.len()
    }

    pub fn nlon(&self) -> usize {
        self.lon.len()
    }

    /// All `(lat, lon)` index pairs (parallel arrays, not a cross product)
    /// whose cell center lies within `radius_km` of `(lat_idx, lon_idx)`,
    /// inclusive. Memoized per grid since the driver revisits the same
    /// columns repeatedly across members.
    pub fn indices_within(
        &self,
        lat_idx: usize,
        lon_idx: usize,
        radius_km: f64,
    ) -> Arc<(Vec<usize>, Vec<usize>)> {
        let key = (lat_idx, lon_idx);
        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return Arc::clone(hit);
        }

        let lat_val = self.lat[lat_idx];
        let lon_val = self.lon[lon_idx];
        let mut lat_inds = Vec::new();
        let mut lon_inds = Vec::new();
        for (i, &la) in self.lat.iter().enumerate() {
            for (j, &lo) in self.lon.iter().enumerate() {
                if great_circle_distance_km(lat_val, lon_val, la, lo) <= radius_km {
                    lat_inds.push(i);
                    lon_inds.push(j);
                }
            }
        }

        let result = Arc::new((lat_inds, lon_inds));
        self.cache.lock().unwrap().insert(key, Arc::clone(&result));
        result
    }
}

fn is_strictly_ascending(xs: &[f64]) -> bool {
    xs.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn antipodal_distance_is_half_circumference() {
        let d = great_circle_distance_km(0.0, 0.0, 0.0, 180.0);
        assert!((d - 20015.09).abs() < 1.0, "d = {d}");
        let d = great_circle_distance_km(90.0, 0.0, -90.0, 0.0);
        assert!((d - 20015.09).abs() < 1.0, "d = {d}");
    }

    #[test]
    fn zero_distance_for_identical_points() {
        assert_eq!(great_circle_distance_km(12.3, -45.6, 12.3, -45.6), 0.0);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(GridSpec::new("bogus").is_err());
    }

    #[test]
    fn four_by_five_axes_are_monotonic_and_bounded() {
        let grid = GridSpec::new("4.0x5.0").unwrap();
        assert_eq!(grid.nlat(), 46);
        assert_eq!(grid.nlon(), 72);
        assert!(grid.lat().windows(2).all(|w| w[0] < w[1]));
        assert!(grid.lat().iter().all(|l| l.abs() <= 90.0));
    }

    #[test]
    fn indices_within_includes_center_cell() {
        let grid = GridSpec::new("4.0x5.0").unwrap();
        let (lat_inds, lon_inds) = &*grid.indices_within(10, 20, 500.0);
        assert!(lat_inds
            .iter()
            .zip(lon_inds.iter())
            .any(|(&la, &lo)| la == 10 && lo == 20));
    }

    #[test]
    fn indices_within_is_memoized() {
        let grid = GridSpec::new("4.0x5.0").unwrap();
        let first = grid.indices_within(5, 5, 300.0);
        let second = grid.indices_within(5, 5, 300.0);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
