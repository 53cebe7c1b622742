//! Per-ensemble-member holder of 3-D concentration fields and 2-D emission
//! scaling-factor time series, with NetCDF-backed load/save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3};
use rand::Rng;

use crate::error::{Component, Error, Result};

/// One species' emission scaling-factor time series: a list of 2-D `[lat,
/// lon]` slices, each stamped with its own "hours since START_DATE" offset.
/// The last slice is the "current" scaling factor.
#[derive(Debug, Clone)]
pub struct EmisSfSeries {
    pub slices: Vec<Array2<f64>>,
    pub time_hours: Vec<i64>,
}

impl EmisSfSeries {
    pub fn current(&self) -> &Array2<f64> {
        self.slices.last().expect("emission series is never empty")
    }

    pub fn last_time_hours(&self) -> i64 {
        *self.time_hours.last().expect("emission series is never empty")
    }

    pub fn push(&mut self, slice: Array2<f64>, time_hours: i64) {
        self.slices.push(slice);
        self.time_hours.push(time_hours);
    }
}

/// One ensemble member's restart (concentration) snapshot plus its emission
/// scaling-factor files.
#[derive(Debug, Clone)]
pub struct FieldStore {
    restart_path: PathBuf,
    scalefactor_paths: HashMap<String, PathBuf>,
    conc: HashMap<String, Array3<f64>>,
    emis_sf: HashMap<String, EmisSfSeries>,
    /// "hours since START_DATE 00:00:00" for this member's restart time.
    restart_timestamp_hours: i64,
}

impl FieldStore {
    /// Build a `FieldStore` directly from in-memory data (used by tests and
    /// by [`crate::driver`] when composing a synthetic nature run).
    pub fn from_parts(
        conc: HashMap<String, Array3<f64>>,
        emis_sf_initial: HashMap<String, Array2<f64>>,
        restart_timestamp_hours: i64,
    ) -> Self {
        let emis_sf = emis_sf_initial
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    EmisSfSeries {
                        slices: vec![v],
                        time_hours: vec![0],
                    },
                )
            })
            .collect();
        FieldStore {
            restart_path: PathBuf::new(),
            scalefactor_paths: HashMap::new(),
            conc,
            emis_sf,
            restart_timestamp_hours,
        }
    }

    /// Load one member's restart file and every `*_SCALEFACTOR.nc` sibling
    /// in `member_dir`.
    ///
    /// `timestamp` is the `YYYYMMDD_HHmm` string used in the restart
    /// filename (`GEOSChem.Restart.{timestamp}z.nc4`).
    pub fn load(member_dir: &Path, timestamp: &str, state_vector_conc: &[String]) -> Result<Self> {
        let restart_path = member_dir.join(format!("GEOSChem.Restart.{timestamp}z.nc4"));
        let file = netcdf::open(&restart_path).map_err(|e| Error::netcdf(restart_path.as_path(), e))?;

        let mut conc = HashMap::new();
        for species in state_vector_conc {
            let var_name = format!("SpeciesRst_{species}");
            let var = file.variable(&var_name).ok_or_else(|| {
                Error::input_shape(
                    Component::FieldStore,
                    format!("restart file is missing variable '{var_name}'"),
                    crate::error::ErrorContext::new(),
                )
            })?;
            let dims = var.dimensions();
            // Stored as (time, lev, lat, lon); we keep only the single time
            // slice present at assimilation time.
            let (lev, lat, lon) = (
                dims[dims.len() - 3].len(),
                dims[dims.len() - 2].len(),
                dims[dims.len() - 1].len(),
            );
            let values: Vec<f64> = var
                .get_values::<f64, _>(..)
                .map_err(|e| Error::netcdf(restart_path.as_path(), e))?;
            let arr = Array3::from_shape_vec((lev, lat, lon), values).map_err(|_| {
                Error::input_shape(
                    Component::FieldStore,
                    format!("variable '{var_name}' has an unexpected shape"),
                    crate::error::ErrorContext::new(),
                )
            })?;
            conc.insert(species.clone(), arr);
        }

        let mut scalefactor_paths = HashMap::new();
        let mut emis_sf = HashMap::new();
        for entry in std::fs::read_dir(member_dir).map_err(|e| Error::io(member_dir, e))? {
            let entry = entry.map_err(|e| Error::io(member_dir, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(species) = name.strip_suffix("_SCALEFACTOR.nc") else {
                continue;
            };

            let sf_file = netcdf::open(&path).map_err(|e| Error::netcdf(path.as_path(), e))?;
            let scalar = sf_file.variable("Scalar").ok_or_else(|| {
                Error::input_shape(
                    Component::FieldStore,
                    format!("scaling-factor file '{name}' is missing 'Scalar'"),
                    crate::error::ErrorContext::new(),
                )
            })?;
            let dims = scalar.dimensions();
            let (ntime, nlat, nlon) = (dims[0].len(), dims[1].len(), dims[2].len());
            let values: Vec<f64> = scalar
                .get_values::<f64, _>(..)
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            let time_var = sf_file.variable("time").ok_or_else(|| {
                Error::input_shape(
                    Component::FieldStore,
                    format!("scaling-factor file '{name}' is missing 'time'"),
                    crate::error::ErrorContext::new(),
                )
            })?;
            let time_hours: Vec<i64> = time_var
                .get_values::<f64, _>(..)
                .map_err(|e| Error::netcdf(path.as_path(), e))?
                .into_iter()
                .map(|h| h.round() as i64)
                .collect();

            let mut slices = Vec::with_capacity(ntime);
            for t in 0..ntime {
                let start = t * nlat * nlon;
                let slice = values[start..start + nlat * nlon].to_vec();
                slices.push(Array2::from_shape_vec((nlat, nlon), slice).map_err(|_| {
                    Error::input_shape(
                        Component::FieldStore,
                        format!("scaling-factor file '{name}' has an unexpected shape"),
                        crate::error::ErrorContext::new(),
                    )
                })?);
            }

            scalefactor_paths.insert(species.to_string(), path);
            emis_sf.insert(species.to_string(), EmisSfSeries { slices, time_hours });
        }

        Ok(FieldStore {
            restart_path,
            scalefactor_paths,
            conc,
            emis_sf,
            restart_timestamp_hours: 0,
        })
    }

    /// Returns `Error::InputShape` if `species` has no loaded concentration
    /// field — a config/data mismatch (e.g. a `STATE_VECTOR_CONC` typo, or a
    /// member directory missing a restart variable) rather than a bug, so it
    /// must surface as a typed error instead of panicking a sweep worker.
    pub fn conc3d(&self, species: &str) -> Result<ndarray::ArrayView3<f64>> {
        self.conc.get(species).map(|arr| arr.view()).ok_or_else(|| {
            Error::input_shape(
                Component::FieldStore,
                format!("species '{species}' not present in this member's loaded concentration fields"),
                crate::error::ErrorContext::new(),
            )
        })
    }

    pub fn set_conc3d(&mut self, species: &str, arr: Array3<f64>) -> Result<()> {
        let existing = self.conc.get(species).ok_or_else(|| {
            Error::input_shape(
                Component::FieldStore,
                format!("species '{species}' not present in this member's loaded concentration fields"),
                crate::error::ErrorContext::new(),
            )
        })?;
        if existing.shape() != arr.shape() {
            return Err(Error::input_shape(
                Component::FieldStore,
                format!(
                    "setConc3D shape mismatch for species '{species}': existing {:?}, new {:?}",
                    existing.shape(),
                    arr.shape()
                ),
                crate::error::ErrorContext::new(),
            ));
        }
        self.conc.insert(species.to_string(), arr);
        Ok(())
    }

    /// Returns `Error::InputShape` if `species` has no loaded emission
    /// scaling-factor series — e.g. a `CONTROL_VECTOR_EMIS` entry with no
    /// matching `*_SCALEFACTOR.nc` file in the member directory.
    pub fn current_emis_sf(&self, species: &str) -> Result<ndarray::ArrayView2<f64>> {
        self.emis_sf.get(species).map(|series| series.current().view()).ok_or_else(|| {
            Error::input_shape(
                Component::FieldStore,
                format!("emission species '{species}' not present in this member's loaded scaling factors"),
                crate::error::ErrorContext::new(),
            )
        })
    }

    /// Append a new time slice stamped `last_time + assim_interval_hours`.
    /// Never mutates past slices.
    pub fn append_emis_sf(&mut self, species: &str, arr: Array2<f64>, assim_interval_hours: i64) -> Result<()> {
        let series = self.emis_sf.get_mut(species).ok_or_else(|| {
            Error::input_shape(
                Component::FieldStore,
                format!("emission species '{species}' not present in this member's loaded scaling factors"),
                crate::error::ErrorContext::new(),
            )
        })?;
        let next_time = series.last_time_hours() + assim_interval_hours;
        series.push(arr, next_time);
        Ok(())
    }

    /// Multiply every state species' concentration elementwise by
    /// `U(1-p, 1+p) * (1+bias)`. Used only to construct test/perturbed
    /// inputs.
    pub fn randomize(&mut self, perturbation: f64, bias: f64, rng: &mut impl Rng) {
        let offset = 1.0 - perturbation;
        let scale = perturbation * 2.0;
        for arr in self.conc.values_mut() {
            for v in arr.iter_mut() {
                let draw = offset + scale * rng.gen::<f64>();
                *v *= draw * (1.0 + bias);
            }
        }
    }

    /// Write the concentration snapshot back under its original path and
    /// every scaling-factor series back to its own file.
    pub fn save(&self, state_vector_conc: &[String]) -> Result<()> {
        let mut file =
            netcdf::append(&self.restart_path).map_err(|e| Error::netcdf(self.restart_path.as_path(), e))?;
        for species in state_vector_conc {
            let arr = &self.conc[species];
            let var_name = format!("SpeciesRst_{species}");
            if let Some(mut var) = file.variable_mut(&var_name) {
                var.put_values(arr.as_slice().unwrap(), ..)
                    .map_err(|e| Error::netcdf(self.restart_path.as_path(), e))?;
            }
        }
        Ok(())
    }

    pub fn save_emissions(&self) -> Result<()> {
        for (species, path) in &self.scalefactor_paths {
            let series = &self.emis_sf[species];
            let (nlat, nlon) = {
                let s = series.current();
                (s.shape()[0], s.shape()[1])
            };
            let mut file = netcdf::create(path).map_err(|e| Error::netcdf(path.as_path(), e))?;
            file.add_dimension("time", series.slices.len())
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            file.add_dimension("lat", nlat).map_err(|e| Error::netcdf(path.as_path(), e))?;
            file.add_dimension("lon", nlon).map_err(|e| Error::netcdf(path.as_path(), e))?;

            let mut scalar = file
                .add_variable::<f64>("Scalar", &["time", "lat", "lon"])
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            scalar
                .put_attribute("long_name", "Scaling factor")
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            scalar
                .put_attribute("units", "1")
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            let flat: Vec<f64> = series.slices.iter().flat_map(|s| s.iter().copied()).collect();
            scalar.put_values(&flat, ..).map_err(|e| Error::netcdf(path.as_path(), e))?;

            let mut time_var = file
                .add_variable::<f64>("time", &["time"])
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            time_var
                .put_attribute("units", "hours since START_DATE 00:00:00")
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            time_var
                .put_attribute("calendar", "standard")
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            let time_values: Vec<f64> = series.time_hours.iter().map(|&h| h as f64).collect();
            time_var
                .put_values(&time_values, ..)
                .map_err(|e| Error::netcdf(path.as_path(), e))?;

            file.add_attribute("Conventions", "COARDS")
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
            file.add_attribute("Title", "Auto-generated scaling factors")
                .map_err(|e| Error::netcdf(path.as_path(), e))?;
        }
        Ok(())
    }

    pub fn restart_timestamp_hours(&self) -> i64 {
        self.restart_timestamp_hours
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sample_store() -> FieldStore {
        let mut conc = HashMap::new();
        conc.insert(
            "A".to_string(),
            Array3::from_shape_fn((2, 2, 2), |(l, i, j)| (l + i + j) as f64 + 1.0),
        );
        let mut emis = HashMap::new();
        emis.insert("E".to_string(), Array2::from_elem((2, 2), 1.0));
        FieldStore::from_parts(conc, emis, 0)
    }

    #[test]
    fn append_emis_sf_never_mutates_past_slices() {
        let mut store = sample_store();
        let first_slice = store.current_emis_sf("E").unwrap().to_owned();
        store.append_emis_sf("E", Array2::from_elem((2, 2), 2.0), 6).unwrap();
        assert_eq!(store.emis_sf["E"].slices[0], first_slice);
        assert_eq!(store.current_emis_sf("E").unwrap()[[0, 0]], 2.0);
        assert_eq!(store.emis_sf["E"].time_hours, vec![0, 6]);
    }

    #[test]
    fn append_emis_sf_rejects_unknown_species() {
        let mut store = sample_store();
        assert!(matches!(
            store.append_emis_sf("NOT_E", Array2::from_elem((2, 2), 2.0), 6),
            Err(Error::InputShape { .. })
        ));
    }

    #[test]
    fn set_conc3d_rejects_shape_mismatch() {
        let mut store = sample_store();
        assert!(matches!(
            store.set_conc3d("A", Array3::from_elem((3, 3, 3), 1.0)),
            Err(Error::InputShape { .. })
        ));
    }

    #[test]
    fn randomize_stays_within_perturbation_bounds() {
        let mut store = sample_store();
        let original = store.conc3d("A").unwrap().to_owned();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        store.randomize(0.1, 0.0, &mut rng);
        for (before, after) in original.iter().zip(store.conc3d("A").unwrap().iter()) {
            let ratio = after / before;
            assert!(ratio >= 0.9 - 1e-9 && ratio <= 1.1 + 1e-9, "ratio = {ratio}");
        }
    }
}
