//! Per-column ensemble assembly: stacks member state vectors into a patch
//! matrix and composes observation-space quantities across species.

use itertools::izip;
use ndarray::{Array1, Array2, Array4, Axis};

use crate::config::RunConfig;
use crate::error::{Component, Error, ErrorContext, Result};
use crate::field_store::FieldStore;
use crate::grid::GridSpec;
use crate::observation::ObservationSet;
use crate::operator::{ensemble_obs_mean_and_pert, obs_diff};
use crate::state_vector::{localized_state_vector_indices, StateVector};

/// Assembles localized state- and observation-space matrices for one column
/// from an ensemble of member [`FieldStore`]s.
///
/// Holds no state of its own beyond borrowed references; one instance is
/// built per sweep and reused across every column it is assigned.
pub struct EnsembleAssembler<'a> {
    grid: &'a GridSpec,
    config: &'a RunConfig,
    members: &'a [FieldStore],
}

/// Observation-space quantities for one column, already concatenated across
/// every observed species in config order.
pub struct ObsSpace {
    pub ybar: Array1<f64>,
    pub y_pert: Array2<f64>,
    pub d: Array1<f64>,
    pub r_diag: Array1<f64>,
}

impl<'a> EnsembleAssembler<'a> {
    pub fn new(grid: &'a GridSpec, config: &'a RunConfig, members: &'a [FieldStore]) -> Self {
        EnsembleAssembler { grid, config, members }
    }

    pub fn ensemble_size(&self) -> usize {
        self.members.len()
    }

    /// Stack each member's localized state vector as a column of `X`.
    /// Returns `(X, global_indices, segment_lengths)`; `global_indices` are
    /// the full-state-vector positions each row of `X` corresponds to.
    pub fn combine(&self, lat_idx: usize, lon_idx: usize) -> Result<(Array2<f64>, Vec<usize>, Vec<usize>)> {
        let global_indices = localized_state_vector_indices(
            self.grid,
            lat_idx,
            lon_idx,
            self.config.localization_radius_km,
            self.grid.levels(),
            self.config.state_vector_conc.len(),
            self.config.control_vector_emis.len(),
        );

        let k = self.members.len();
        let mut x = Array2::<f64>::zeros((global_indices.len(), k));
        let mut segment_lengths = Vec::new();
        for (m, store) in self.members.iter().enumerate() {
            let sv = StateVector::build(store, &self.config.state_vector_conc, &self.config.control_vector_emis)?;
            if sv.len() < global_indices.iter().copied().max().map(|v| v + 1).unwrap_or(0) {
                return Err(Error::input_shape(
                    Component::Ensemble,
                    format!("member {m} state vector is shorter than the localized index set requires"),
                    ErrorContext::new().with_column(lat_idx, lon_idx).with_member(m as u32),
                ));
            }
            if m == 0 {
                segment_lengths = sv.segment_lengths.clone();
            }
            for (row, &gi) in global_indices.iter().enumerate() {
                x[[row, m]] = sv.values[gi];
            }
        }

        Ok((x, global_indices, segment_lengths))
    }

    /// Column mean and mean-subtracted perturbations of `x`.
    pub fn mean_and_pert(x: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
        let mean = x.mean_axis(Axis(1)).expect("x has at least one column");
        let mut pert = x.clone();
        for mut col in pert.columns_mut() {
            col -= &mean;
        }
        (mean, pert)
    }

    /// Compose background mean/perturbations/innovation/covariance across
    /// every observed species for this column, concatenated in config
    /// order. Species with no observations within the localization radius
    /// contribute zero rows, so the kernel still receives a well-formed
    /// (possibly `p=0`) problem.
    ///
    /// Assumes, as the simulated-nature pipeline guarantees, that each
    /// species' [`crate::observation::ObservationInfo`] holds exactly one
    /// entry per grid cell in the same row-major order as
    /// [`GridSpec::indices_within`] enumerates matches, so that the model
    /// patch (evaluated via the grid indices) and the localized observation
    /// subset (evaluated via lat/lon distance) line up row for row.
    pub fn observation_space(&self, observations: &ObservationSet, lat_idx: usize, lon_idx: usize) -> Result<ObsSpace> {
        let radius = self.config.localization_radius_km;
        let (lat_inds, lon_inds) = &*self.grid.indices_within(lat_idx, lon_idx, radius);
        let k = self.members.len();

        let mut ybar_parts = Vec::new();
        let mut pert_parts: Vec<Array2<f64>> = Vec::new();
        let mut d_parts = Vec::new();
        let mut r_parts = Vec::new();

        for (op_idx, (tag, model_species)) in self.config.observed_species.iter().enumerate() {
            let operator = &self.config.obs_operators[op_idx];

            let obs_info = match observations.get(tag) {
                Some(info) => info,
                None => continue,
            };
            let local_idx = obs_info.localize(self.grid, lat_idx, lon_idx, radius);
            if local_idx.is_empty() {
                continue;
            }
            let local_obs = obs_info.subset(&local_idx);

            let conc4d = self.stack_species_conc4d(model_species)?;
            let (ybar, _y, pert) = ensemble_obs_mean_and_pert(
                operator,
                &conc4d,
                self.grid.lat(),
                self.grid.lon(),
                Some((lat_inds, lon_inds)),
            )?;

            if ybar.len() != local_obs.len() {
                return Err(Error::input_shape(
                    Component::Ensemble,
                    format!(
                        "species '{tag}': model patch has {} cells but {} localized observations",
                        ybar.len(),
                        local_obs.len()
                    ),
                    ErrorContext::new().with_column(lat_idx, lon_idx),
                ));
            }

            let d = obs_diff(&local_obs.y.view(), &ybar.view());

            ybar_parts.push(ybar);
            pert_parts.push(pert);
            d_parts.push(d);
            r_parts.push(local_obs.r_diag.clone());
        }

        let p_total: usize = ybar_parts.iter().map(|v| v.len()).sum();
        let mut ybar = Array1::<f64>::zeros(p_total);
        let mut y_pert = Array2::<f64>::zeros((p_total, k));
        let mut d = Array1::<f64>::zeros(p_total);
        let mut r_diag = Array1::<f64>::zeros(p_total);

        let mut offset = 0usize;
        for (yb, pert, dd, r) in izip!(ybar_parts, pert_parts, d_parts, r_parts) {
            let n = yb.len();
            ybar.slice_mut(ndarray::s![offset..offset + n]).assign(&yb);
            y_pert.slice_mut(ndarray::s![offset..offset + n, ..]).assign(&pert);
            d.slice_mut(ndarray::s![offset..offset + n]).assign(&dd);
            r_diag.slice_mut(ndarray::s![offset..offset + n]).assign(&r);
            offset += n;
        }

        Ok(ObsSpace { ybar, y_pert, d, r_diag })
    }

    fn stack_species_conc4d(&self, species: &str) -> Result<Array4<f64>> {
        let first = self.members[0].conc3d(species)?;
        let shape = (first.shape()[0], first.shape()[1], first.shape()[2], self.members.len());
        let mut out = Array4::<f64>::zeros(shape);
        for (m, store) in self.members.iter().enumerate() {
            let conc = store.conc3d(species)?;
            if conc.shape() != first.shape() {
                return Err(Error::input_shape(
                    Component::Ensemble,
                    format!("member {m} has a different shape for species '{species}'"),
                    ErrorContext::new().with_member(m as u32),
                ));
            }
            out.index_axis_mut(Axis(3), m).assign(&conc);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NatureOperator, OperatorTag, RawRunConfig, RunConfig};
    use crate::observation::ObservationInfo;
    use float_cmp::approx_eq;
    use ndarray::Array3;
    use std::collections::{BTreeMap, HashMap};

    fn member(nlev: usize, nlat: usize, nlon: usize, base: f64) -> FieldStore {
        let mut conc = HashMap::new();
        conc.insert(
            "A".to_string(),
            Array3::from_shape_fn((nlev, nlat, nlon), |_| base),
        );
        let mut emis = HashMap::new();
        emis.insert("E".to_string(), ndarray::Array2::from_elem((nlat, nlon), 1.0));
        FieldStore::from_parts(conc, emis, 0)
    }

    fn config() -> RunConfig {
        RunConfig::validate(RawRunConfig {
            my_path: "/tmp/letkf".into(),
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
            n_ensemble: 2,
            do_control_run: false,
        })
        .unwrap()
    }

    #[test]
    fn combine_stacks_members_as_columns() {
        let grid = GridSpec::new("4.0x5.0").unwrap();
        let cfg = config();
        let members = vec![
            member(grid.levels(), grid.nlat(), grid.nlon(), 1.0),
            member(grid.levels(), grid.nlat(), grid.nlon(), 3.0),
        ];
        let assembler = EnsembleAssembler::new(&grid, &cfg, &members);
        let (x, _indices, _lengths) = assembler.combine(10, 20).unwrap();
        assert_eq!(x.shape()[1], 2);
        let (mean, pert) = EnsembleAssembler::mean_and_pert(&x);
        assert!(approx_eq!(f64, mean[0], 2.0, epsilon = 1e-9));
        assert!(pert.sum_axis(Axis(1)).iter().all(|&v| approx_eq!(f64, v, 0.0, epsilon = 1e-9)));
    }

    #[test]
    fn observation_space_omits_species_with_no_local_observations() {
        let grid = GridSpec::new("4.0x5.0").unwrap();
        let cfg = config();
        let members = vec![
            member(grid.levels(), grid.nlat(), grid.nlon(), 1.0),
            member(grid.levels(), grid.nlat(), grid.nlon(), 1.0),
        ];
        let assembler = EnsembleAssembler::new(&grid, &cfg, &members);

        let mut obs = ObservationSet::new();
        // A single far-away observation, outside the localization radius.
        obs.insert(
            "A_obs",
            ObservationInfo::from_simulated(
                Array1::from_vec(vec![1.0]),
                vec![grid.lat()[grid.nlat() - 1]],
                vec![grid.lon()[grid.nlon() - 1]],
                vec!["t".into()],
                0.1,
            )
            .unwrap(),
        );

        let space = assembler.observation_space(&obs, 0, 0).unwrap();
        assert_eq!(space.ybar.len(), 0);
    }
}
