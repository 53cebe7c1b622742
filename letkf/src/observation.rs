//! Simulated or real observation records, keyed by species, with
//! localization by radius around a grid column.

use std::collections::BTreeMap;

use ndarray::Array1;

use crate::error::{Component, Error, ErrorContext, Result};
use crate::grid::{great_circle_distance_km, GridSpec};

/// One species' observations: values, positions, and covariance.
///
/// Invariant: `y.len() == lat.len() == lon.len() == utctime.len()`, and `r`
/// is either a diagonal (stored as a vector) or, in the future, dense
/// covariance of matching size. Only diagonal covariance is implemented.
#[derive(Debug, Clone)]
pub struct ObservationInfo {
    pub y: Array1<f64>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub utctime: Vec<String>,
    pub r_diag: Array1<f64>,
}

impl ObservationInfo {
    /// Build from simulated-observation values produced by an H-operator
    /// plus a relative error fraction: `R = diag(|y| * sigma_rel)`.
    pub fn from_simulated(
        y: Array1<f64>,
        lat: Vec<f64>,
        lon: Vec<f64>,
        utctime: Vec<String>,
        sigma_rel: f64,
    ) -> Result<Self> {
        if y.len() != lat.len() || y.len() != lon.len() || y.len() != utctime.len() {
            return Err(Error::input_shape(
                Component::Observation,
                format!(
                    "mismatched lengths: y={}, lat={}, lon={}, utctime={}",
                    y.len(),
                    lat.len(),
                    lon.len(),
                    utctime.len()
                ),
                ErrorContext::new(),
            ));
        }
        let r_diag = y.mapv(|v| (v.abs() * sigma_rel).max(f64::MIN_POSITIVE));
        Ok(ObservationInfo {
            y,
            lat,
            lon,
            utctime,
            r_diag,
        })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Indices of observations whose `(lat, lon)` lies within `radius_km` of
    /// the cell center `(lat_idx, lon_idx)` on `grid`. May be empty; an
    /// empty result is a valid outcome, not an error (see kernel's
    /// no-observation edge case).
    pub fn localize(&self, grid: &GridSpec, lat_idx: usize, lon_idx: usize, radius_km: f64) -> Vec<usize> {
        let center_lat = grid.lat()[lat_idx];
        let center_lon = grid.lon()[lon_idx];
        self.lat
            .iter()
            .zip(self.lon.iter())
            .enumerate()
            .filter(|(_, (&la, &lo))| {
                great_circle_distance_km(center_lat, center_lon, la, lo) <= radius_km
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Restrict to the given global indices, in order.
    pub fn subset(&self, indices: &[usize]) -> ObservationInfo {
        ObservationInfo {
            y: Array1::from_iter(indices.iter().map(|&i| self.y[i])),
            lat: indices.iter().map(|&i| self.lat[i]).collect(),
            lon: indices.iter().map(|&i| self.lon[i]).collect(),
            utctime: indices.iter().map(|&i| self.utctime[i].clone()).collect(),
            r_diag: Array1::from_iter(indices.iter().map(|&i| self.r_diag[i])),
        }
    }
}

/// All observed species for one assimilation time, keyed by the observed
/// species tag (the `OBSERVED_SPECIES` config key, not the state species
/// name it maps to).
#[derive(Debug, Clone, Default)]
pub struct ObservationSet {
    pub species: BTreeMap<String, ObservationInfo>,
}

impl ObservationSet {
    pub fn new() -> Self {
        ObservationSet {
            species: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, tag: impl Into<String>, info: ObservationInfo) {
        self.species.insert(tag.into(), info);
    }

    pub fn get(&self, tag: &str) -> Option<&ObservationInfo> {
        self.species.get(tag)
    }

    /// Localize every species independently around `(lat_idx, lon_idx)` and
    /// return the per-species subsets that fall inside the radius. Species
    /// with zero observations in range are omitted, not errored.
    pub fn localize_all(
        &self,
        grid: &GridSpec,
        lat_idx: usize,
        lon_idx: usize,
        radius_km: f64,
    ) -> BTreeMap<String, ObservationInfo> {
        self.species
            .iter()
            .filter_map(|(tag, info)| {
                let idx = info.localize(grid, lat_idx, lon_idx, radius_km);
                if idx.is_empty() {
                    None
                } else {
                    Some((tag.clone(), info.subset(&idx)))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_simulated_rejects_length_mismatch() {
        let res = ObservationInfo::from_simulated(
            Array1::from_vec(vec![1.0, 2.0]),
            vec![0.0],
            vec![0.0, 1.0],
            vec!["t".into(), "t".into()],
            0.1,
        );
        assert!(res.is_err());
    }

    #[test]
    fn localize_picks_only_nearby_observations() {
        let grid = GridSpec::new("4.0x5.0").unwrap();
        let info = ObservationInfo::from_simulated(
            Array1::from_vec(vec![1.0, 2.0, 3.0]),
            vec![grid.lat()[10], grid.lat()[10], grid.lat()[40]],
            vec![grid.lon()[20], grid.lon()[21], grid.lon()[60]],
            vec!["t".into(); 3],
            0.1,
        )
        .unwrap();
        let idx = info.localize(&grid, 10, 20, 500.0);
        assert_eq!(idx, vec![0, 1]);
    }

    #[test]
    fn localize_all_omits_empty_species() {
        let grid = GridSpec::new("4.0x5.0").unwrap();
        let mut set = ObservationSet::new();
        set.insert(
            "NO2_obs",
            ObservationInfo::from_simulated(
                Array1::from_vec(vec![1.0]),
                vec![grid.lat()[45]],
                vec![grid.lon()[71]],
                vec!["t".into()],
                0.1,
            )
            .unwrap(),
        );
        let localized = set.localize_all(&grid, 0, 0, 100.0);
        assert!(localized.is_empty());
    }
}
