//! Orchestrates one assimilation timestep: setup (load members, synthesize
//! observations), sweep (parallel per-column LETKF updates, shard writes),
//! and gather (stitch shards back into member restart files).

use std::path::PathBuf;
use std::sync::Arc;

use itertools::Itertools;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use tracing::{info, instrument, warn};

use crate::config::RunConfig;
use crate::ensemble::EnsembleAssembler;
use crate::error::{Component, Error, ErrorContext, Result};
use crate::field_store::FieldStore;
use crate::grid::GridSpec;
use crate::kernel::{letkf_update, CovRepr};
use crate::observation::{ObservationInfo, ObservationSet};
use crate::operator::{column_sum, surface_obs, OperatorKind};
use crate::shard::{read_shard, shard_path, write_shard};
use crate::state_vector::{column_indices_from_localized_state_vector, localized_state_vector_indices, reconstruct, StateVector};

/// Deterministic static partition: which `corenum` in `[0, n_cores)` owns
/// column `(lat_idx, lon_idx)`.
fn owning_core(lat_idx: usize, lon_idx: usize, nlon: usize, n_cores: u32) -> u32 {
    ((lat_idx * nlon + lon_idx) % n_cores.max(1) as usize) as u32
}

/// Ties together a [`RunConfig`], its [`GridSpec`], and the on-disk
/// ensemble directory for one run.
pub struct AssimilationDriver {
    config: Arc<RunConfig>,
    grid: GridSpec,
}

impl AssimilationDriver {
    pub fn new(config: Arc<RunConfig>) -> Result<Self> {
        let grid = GridSpec::new(&config.grid_tag)?;
        Ok(AssimilationDriver { config, grid })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Member directories under `ensemble_runs/`, sorted by member number.
    /// `000` is the nature run; `logs/` is skipped.
    fn member_dirs(&self) -> Result<Vec<(u32, PathBuf)>> {
        let dir = self.config.ensemble_dir();
        let mut members = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| Error::io(dir.as_path(), e))? {
            let entry = entry.map_err(|e| Error::io(dir.as_path(), e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == "logs" {
                continue;
            }
            let Some(suffix) = name.strip_prefix(&format!("{}_", self.config.run_name)) else {
                continue;
            };
            let Ok(member_num) = suffix.parse::<u32>() else {
                continue;
            };
            members.push((member_num, path));
        }
        members.sort_by_key(|(n, _)| *n);
        Ok(members)
    }

    /// Load the nature run (member 0) and every assimilated member (1..).
    pub fn load_members(&self, timestamp: &str) -> Result<(FieldStore, Vec<FieldStore>)> {
        let dirs = self.member_dirs()?;
        let mut nature = None;
        let mut ensemble = Vec::new();
        for (num, path) in dirs {
            let store = FieldStore::load(&path, timestamp, &self.config.state_vector_conc)?;
            if num == 0 {
                nature = Some(store);
            } else {
                ensemble.push(store);
            }
        }
        let nature = nature.ok_or_else(|| {
            Error::input_shape(
                Component::Driver,
                "no member 000 (nature run) directory found",
                ErrorContext::new().with_timestamp(timestamp),
            )
        })?;
        Ok((nature, ensemble))
    }

    /// Apply the configured H operators to the nature run's full grid,
    /// producing one whole-grid [`ObservationSet`] entry per observed
    /// species (simulated-nature mode only; see config validation).
    pub fn synthesize_observations(&self, nature: &FieldStore) -> Result<ObservationSet> {
        let mut set = ObservationSet::new();
        for (i, (tag, model_species)) in self.config.observed_species.iter().enumerate() {
            let conc = nature.conc3d(model_species)?;
            let result = match &self.config.nature_h_operators[i] {
                OperatorKind::Surface => surface_obs(&conc, self.grid.lat(), self.grid.lon(), None),
                OperatorKind::Sum => column_sum(&conc, self.grid.lat(), self.grid.lon(), None),
                OperatorKind::SatelliteColumn(_) => {
                    return Err(Error::config(
                        Component::Observation,
                        format!("species '{tag}' uses SatelliteColumn, which requires per-footprint retrieval data not available from simulate-nature synthesis"),
                    ))
                }
            };
            let n = result.values.len();
            let info = ObservationInfo::from_simulated(
                result.values,
                result.lats.to_vec(),
                result.lons.to_vec(),
                vec![self.config.start_date.format("%Y%m%d").to_string(); n],
                self.config.obs_error_relative[i],
            )?;
            set.insert(tag.clone(), info);
        }
        Ok(set)
    }

    /// Run the sweep phase for the columns assigned to `corenum` out of
    /// `n_cores`, writing one scratch shard per column.
    #[instrument(skip(self, members, observations), fields(ensnum, corenum, timestamp))]
    pub fn sweep(
        &self,
        ensnum: u32,
        corenum: u32,
        n_cores: u32,
        timestamp: &str,
        members: &[FieldStore],
        observations: &ObservationSet,
    ) -> Result<usize> {
        let scratch_dir = self.config.scratch_dir();
        std::fs::create_dir_all(&scratch_dir).map_err(|e| Error::io(scratch_dir.as_path(), e))?;

        let columns: Vec<(usize, usize)> = (0..self.grid.nlat())
            .cartesian_product(0..self.grid.nlon())
            .filter(|&(i, j)| owning_core(i, j, self.grid.nlon(), n_cores) == corenum)
            .collect();

        info!(n_columns = columns.len(), "starting sweep partition");

        let assembler = EnsembleAssembler::new(&self.grid, &self.config, members);
        let pseudoinverse_count = std::sync::atomic::AtomicUsize::new(0);

        columns
            .par_iter()
            .try_for_each(|&(lat_idx, lon_idx)| -> Result<()> {
                let (x, _global_indices, _segments) = assembler.combine(lat_idx, lon_idx)?;
                let (x_bar, x_pert) = EnsembleAssembler::mean_and_pert(&x);
                let obs_space = assembler.observation_space(observations, lat_idx, lon_idx)?;

                let output = letkf_update(
                    &x_bar,
                    &x_pert,
                    &obs_space.y_pert,
                    &obs_space.d,
                    &CovRepr::Diagonal(obs_space.r_diag),
                    self.config.inflation_factor,
                )?;
                if output.used_pseudoinverse {
                    pseudoinverse_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!(lat_idx, lon_idx, "P~ was singular; fell back to pseudoinverse");
                }

                let center_local = column_indices_from_localized_state_vector(
                    &self.grid,
                    lat_idx,
                    lon_idx,
                    self.config.localization_radius_km,
                    self.grid.levels(),
                    self.config.state_vector_conc.len(),
                    self.config.control_vector_emis.len(),
                );

                let submatrix = Array2::from_shape_fn((center_local.len(), output.analysis.shape()[1]), |(row, col)| {
                    output.analysis[[center_local[row], col]]
                });

                let path = shard_path(&scratch_dir, ensnum, corenum, timestamp, lat_idx, lon_idx);
                write_shard(&path, &submatrix)
            })?;

        let fallbacks = pseudoinverse_count.load(std::sync::atomic::Ordering::Relaxed);
        if fallbacks > 0 {
            warn!(fallbacks, "sweep completed with numeric fallbacks");
        }
        Ok(columns.len())
    }

    /// Run the gather phase: stitch every column's shard back into a full
    /// analysis vector per member and write it back to disk. Requires every
    /// column's shard (across all `corenum` partitions for this `ensnum`) to
    /// be present.
    #[instrument(skip(self, members), fields(ensnum, timestamp))]
    pub fn gather(&self, ensnum: u32, n_cores: u32, timestamp: &str, members: &mut [FieldStore]) -> Result<()> {
        let scratch_dir = self.config.scratch_dir();
        let template = StateVector::build(&members[0], &self.config.state_vector_conc, &self.config.control_vector_emis)?;
        let total_len = template.len();
        let segment_lengths = template.segment_lengths.clone();
        let k = members.len();

        let mut analysis_vectors: Vec<Array1<f64>> = (0..k).map(|_| Array1::zeros(total_len)).collect();

        for lat_idx in 0..self.grid.nlat() {
            for lon_idx in 0..self.grid.nlon() {
                let corenum = owning_core(lat_idx, lon_idx, self.grid.nlon(), n_cores);
                let path = shard_path(&scratch_dir, ensnum, corenum, timestamp, lat_idx, lon_idx);
                let shard = read_shard(&path)?.ok_or_else(|| Error::MissingShard {
                    member: 0,
                    lat_idx,
                    lon_idx,
                    timestamp: timestamp.to_string(),
                })?;

                let global_indices = localized_state_vector_indices(
                    &self.grid,
                    lat_idx,
                    lon_idx,
                    self.config.localization_radius_km,
                    self.grid.levels(),
                    self.config.state_vector_conc.len(),
                    self.config.control_vector_emis.len(),
                );
                let center_local = column_indices_from_localized_state_vector(
                    &self.grid,
                    lat_idx,
                    lon_idx,
                    self.config.localization_radius_km,
                    self.grid.levels(),
                    self.config.state_vector_conc.len(),
                    self.config.control_vector_emis.len(),
                );

                for (row, &local_pos) in center_local.iter().enumerate() {
                    let global_pos = global_indices[local_pos];
                    for m in 0..k {
                        analysis_vectors[m][global_pos] = shard[[row, m]];
                    }
                }
            }
        }

        for (m, store) in members.iter_mut().enumerate() {
            reconstruct(
                store,
                &analysis_vectors[m],
                &segment_lengths,
                &self.config.state_vector_conc,
                &self.config.control_vector_conc,
                &self.config.control_vector_emis,
                self.config.assim_time_hours,
                self.grid.levels(),
                self.grid.nlat(),
                self.grid.nlon(),
            )?;
            store.save(&self.config.state_vector_conc)?;
            store.save_emissions()?;
        }

        info!(n_members = k, "gather complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NatureOperator, OperatorTag, RawRunConfig};
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn owning_core_covers_every_core_evenly_for_square_grids() {
        let nlon = 8;
        let n_cores = 4;
        let mut counts = vec![0usize; n_cores as usize];
        for i in 0..8 {
            for j in 0..nlon {
                counts[owning_core(i, j, nlon, n_cores) as usize] += 1;
            }
        }
        assert!(counts.iter().all(|&c| c > 0));
    }

    #[test]
    fn gather_errors_on_missing_shard() {
        let cfg = RunConfig::validate(RawRunConfig {
            my_path: std::env::temp_dir().join("letkf_gather_missing_test"),
            run_name: "t".into(),
            res: "4.0x5.0".into(),
            region: String::new(),
            met_name: String::new(),
            state_vector_conc: vec!["A".into()],
            control_vector_conc: vec!["A".into()],
            control_vector_emis: BTreeMap::from([("E".into(), "tag".into())]),
            observed_species: indexmap::IndexMap::from([("A_obs".into(), "A".into())]),
            obs_operators: vec![OperatorTag::Surface],
            nature_operator: NatureOperator::SimulatedNature,
            nature_h_functions: vec!["surface_obs".into()],
            obs_error_matrices: vec!["0.1".into()],
            localization_radius_km: 500.0,
            inflation_factor: 0.0,
            p_pert: 0.1,
            assim_time_hours: 6,
            start_date: "20190101".into(),
            n_ensemble: 1,
            do_control_run: false,
        })
        .unwrap();

        let driver = AssimilationDriver::new(Arc::new(cfg)).unwrap();
        let grid = driver.grid();

        let mut conc = HashMap::new();
        conc.insert(
            "A".to_string(),
            ndarray::Array3::from_elem((grid.levels(), grid.nlat(), grid.nlon()), 1.0),
        );
        let mut emis = HashMap::new();
        emis.insert("E".to_string(), Array2::from_elem((grid.nlat(), grid.nlon()), 1.0));
        let mut members = vec![FieldStore::from_parts(conc, emis, 0)];

        let result = driver.gather(0, 1, "20190101_0000", &mut members);
        assert!(matches!(result, Err(Error::MissingShard { .. })));
    }
}
