//! Run configuration: the raw, `serde`-deserializable document and the
//! validated, immutable [`RunConfig`] built from it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{Component, Error, Result};
use crate::operator::OperatorKind;

/// Tag naming which observation operator a species uses, as written in the
/// config document (`OBS_OPERATORS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum OperatorTag {
    Surface,
    Sum,
    SatelliteColumn,
}

/// `NATURE_OPERATOR`: which helper synthesizes truth observations from the
/// nature run. `Na` means real (non-simulated) observations, which this
/// tool does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum NatureOperator {
    SimulatedNature,
    Na,
}

/// Raw, directly-deserialized shape of the configuration document (YAML or
/// JSON). Field names mirror the original tool's `ens_config.json` keys so
/// that existing configuration files do not need to be rewritten.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRunConfig {
    #[serde(rename = "MY_PATH")]
    pub my_path: PathBuf,
    #[serde(rename = "RUN_NAME")]
    pub run_name: String,
    #[serde(rename = "RES")]
    pub res: String,
    #[serde(rename = "REGION", default)]
    pub region: String,
    #[serde(rename = "met_name", default)]
    pub met_name: String,
    #[serde(rename = "STATE_VECTOR_CONC")]
    pub state_vector_conc: Vec<String>,
    #[serde(rename = "CONTROL_VECTOR_CONC")]
    pub control_vector_conc: Vec<String>,
    #[serde(rename = "CONTROL_VECTOR_EMIS")]
    pub control_vector_emis: BTreeMap<String, String>,
    /// Declaration order matters: it is what `OBS_OPERATORS`/`OBS_ERROR_MATRICES`/
    /// `NATURE_H_FUNCTIONS` are zipped against positionally, so this must be
    /// an order-preserving map rather than `BTreeMap` (which would silently
    /// re-sort the tags alphabetically).
    #[serde(rename = "OBSERVED_SPECIES")]
    pub observed_species: IndexMap<String, String>,
    #[serde(rename = "OBS_OPERATORS")]
    pub obs_operators: Vec<OperatorTag>,
    #[serde(rename = "NATURE_OPERATOR")]
    pub nature_operator: NatureOperator,
    #[serde(rename = "NATURE_H_FUNCTIONS")]
    pub nature_h_functions: Vec<String>,
    #[serde(rename = "OBS_ERROR_MATRICES")]
    pub obs_error_matrices: Vec<String>,
    #[serde(rename = "LOCALIZATION_RADIUS_km")]
    pub localization_radius_km: f64,
    #[serde(rename = "INFLATION_FACTOR")]
    pub inflation_factor: f64,
    #[serde(rename = "pPERT")]
    pub p_pert: f64,
    #[serde(rename = "ASSIM_TIME")]
    pub assim_time_hours: i64,
    #[serde(rename = "START_DATE")]
    pub start_date: String,
    #[serde(rename = "nEnsemble")]
    pub n_ensemble: u32,
    #[serde(rename = "DO_CONTROL_RUN", default)]
    pub do_control_run: bool,
}

/// Validated, immutable configuration. Construction is the only place a
/// [`Error::Config`] can be raised for a malformed document.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub my_path: PathBuf,
    pub run_name: String,
    pub grid_tag: String,
    pub state_vector_conc: Vec<String>,
    pub control_vector_conc: Vec<String>,
    pub control_vector_emis: Vec<String>,
    pub observed_species: Vec<(String, String)>,
    pub obs_operators: Vec<OperatorKind>,
    /// `NATURE_H_FUNCTIONS` resolved into the same tagged union used for
    /// assimilation-time operators, parallel to `observed_species`. Drives
    /// [`crate::driver::AssimilationDriver::synthesize_observations`].
    pub nature_h_operators: Vec<OperatorKind>,
    pub obs_error_relative: Vec<f64>,
    pub localization_radius_km: f64,
    pub inflation_factor: f64,
    pub p_pert: f64,
    pub assim_time_hours: i64,
    pub start_date: chrono::NaiveDate,
    pub n_ensemble: u32,
    pub do_control_run: bool,
}

impl RunConfig {
    /// Load a YAML or JSON document (detected by file extension) and
    /// validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let raw: RawRunConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => serde_yaml::from_str(&text)?,
        };
        Self::validate(raw)
    }

    /// Validate a raw document into an immutable, ready-to-run config.
    pub fn validate(raw: RawRunConfig) -> Result<Self> {
        if raw.nature_operator == NatureOperator::Na {
            return Err(Error::Unimplemented);
        }

        if !(raw.p_pert > 0.0 && raw.p_pert < 1.0) {
            return Err(Error::config(
                Component::Config,
                format!("pPERT must be in (0, 1), got {}", raw.p_pert),
            ));
        }

        if raw.observed_species.len() != raw.obs_operators.len() {
            return Err(Error::config(
                Component::Config,
                format!(
                    "OBSERVED_SPECIES has {} entries but OBS_OPERATORS has {}",
                    raw.observed_species.len(),
                    raw.obs_operators.len()
                ),
            ));
        }
        if raw.observed_species.len() != raw.nature_h_functions.len() {
            return Err(Error::config(
                Component::Config,
                format!(
                    "OBSERVED_SPECIES has {} entries but NATURE_H_FUNCTIONS has {}",
                    raw.observed_species.len(),
                    raw.nature_h_functions.len()
                ),
            ));
        }
        if raw.observed_species.len() != raw.obs_error_matrices.len() {
            return Err(Error::config(
                Component::Config,
                format!(
                    "OBSERVED_SPECIES has {} entries but OBS_ERROR_MATRICES has {}",
                    raw.observed_species.len(),
                    raw.obs_error_matrices.len()
                ),
            ));
        }

        for control_spec in &raw.control_vector_conc {
            if !raw.state_vector_conc.contains(control_spec) {
                return Err(Error::config(
                    Component::Config,
                    format!(
                        "CONTROL_VECTOR_CONC species '{control_spec}' is not in STATE_VECTOR_CONC"
                    ),
                ));
            }
        }

        let obs_error_relative = raw
            .obs_error_matrices
            .iter()
            .map(|e| {
                e.parse::<f64>().map_err(|_| {
                    Error::config(
                        Component::Config,
                        format!(
                            "OBS_ERROR_MATRICES entry '{e}' is not a relative-error scalar; \
                             dense covariance files are not yet supported by this build"
                        ),
                    )
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        let obs_operators = raw
            .obs_operators
            .iter()
            .map(|tag| OperatorKind::from_tag(*tag))
            .collect();

        let nature_h_operators = raw
            .nature_h_functions
            .iter()
            .map(|name| OperatorKind::from_nature_h_function(name))
            .collect::<Result<Vec<OperatorKind>>>()?;

        let grid_tag = if raw.region.is_empty() {
            raw.res.clone()
        } else {
            format!("{}_{}", raw.region, raw.met_name)
        };

        let start_date = chrono::NaiveDate::parse_from_str(&raw.start_date, "%Y%m%d").map_err(|_| {
            Error::config(
                Component::Config,
                format!("START_DATE '{}' is not a valid YYYYMMDD date", raw.start_date),
            )
        })?;

        Ok(RunConfig {
            my_path: raw.my_path,
            run_name: raw.run_name,
            grid_tag,
            state_vector_conc: raw.state_vector_conc,
            control_vector_conc: raw.control_vector_conc,
            control_vector_emis: raw.control_vector_emis.into_keys().collect(),
            observed_species: raw.observed_species.into_iter().collect(),
            obs_operators,
            nature_h_operators,
            obs_error_relative,
            localization_radius_km: raw.localization_radius_km,
            inflation_factor: raw.inflation_factor,
            p_pert: raw.p_pert,
            assim_time_hours: raw.assim_time_hours,
            start_date,
            n_ensemble: raw.n_ensemble,
            do_control_run: raw.do_control_run,
        })
    }

    /// Root directory holding `ensemble_runs/` and `scratch/` for this run.
    pub fn run_dir(&self) -> PathBuf {
        self.my_path.join(&self.run_name)
    }

    pub fn ensemble_dir(&self) -> PathBuf {
        self.run_dir().join("ensemble_runs")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.run_dir().join("scratch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw() -> RawRunConfig {
        RawRunConfig {
            my_path: PathBuf::from("/tmp/letkf"),
            run_name: "test_run".into(),
            res: "4.0x5.0".into(),
            region: String::new(),
            met_name: String::new(),
            state_vector_conc: vec!["A".into(), "B".into()],
            control_vector_conc: vec!["A".into()],
            control_vector_emis: BTreeMap::from([("E".into(), "tag".into())]),
            observed_species: IndexMap::from([("A_obs".into(), "A".into())]),
            obs_operators: vec![OperatorTag::Surface],
            nature_operator: NatureOperator::SimulatedNature,
            nature_h_functions: vec!["surface_obs".into()],
            obs_error_matrices: vec!["0.1".into()],
            localization_radius_km: 500.0,
            inflation_factor: 0.0,
            p_pert: 0.1,
            assim_time_hours: 6,
            start_date: "20190101".into(),
            n_ensemble: 4,
            do_control_run: false,
        }
    }

    #[test]
    fn valid_config_round_trips() {
        let cfg = RunConfig::validate(minimal_raw()).unwrap();
        assert_eq!(cfg.grid_tag, "4.0x5.0");
        assert_eq!(cfg.control_vector_emis, vec!["E".to_string()]);
    }

    #[test]
    fn rejects_out_of_range_ppert() {
        let mut raw = minimal_raw();
        raw.p_pert = 1.5;
        assert!(matches!(
            RunConfig::validate(raw),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn rejects_mismatched_operator_lengths() {
        let mut raw = minimal_raw();
        raw.obs_operators.push(OperatorTag::Sum);
        assert!(matches!(
            RunConfig::validate(raw),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn rejects_real_observations() {
        let mut raw = minimal_raw();
        raw.nature_operator = NatureOperator::Na;
        assert!(matches!(RunConfig::validate(raw), Err(Error::Unimplemented)));
    }

    #[test]
    fn rejects_control_species_not_in_state_vector() {
        let mut raw = minimal_raw();
        raw.control_vector_conc.push("Z".into());
        assert!(matches!(
            RunConfig::validate(raw),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn rejects_malformed_start_date() {
        let mut raw = minimal_raw();
        raw.start_date = "not-a-date".into();
        assert!(matches!(
            RunConfig::validate(raw),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn preserves_observed_species_declaration_order() {
        let mut raw = minimal_raw();
        // Declared "Z_obs" before "A_obs", i.e. not alphabetical by tag. A
        // BTreeMap would silently re-sort this to [A_obs, Z_obs] and
        // misalign it against OBS_OPERATORS/OBS_ERROR_MATRICES below.
        raw.observed_species = IndexMap::from([("Z_obs".into(), "B".into()), ("A_obs".into(), "A".into())]);
        raw.obs_operators = vec![OperatorTag::Sum, OperatorTag::Surface];
        raw.nature_h_functions = vec!["column_sum".into(), "surface_obs".into()];
        raw.obs_error_matrices = vec!["0.2".into(), "0.1".into()];

        let cfg = RunConfig::validate(raw).unwrap();
        assert_eq!(
            cfg.observed_species,
            vec![("Z_obs".to_string(), "B".to_string()), ("A_obs".to_string(), "A".to_string())]
        );
        assert!(matches!(cfg.obs_operators[0], OperatorKind::Sum));
        assert!(matches!(cfg.obs_operators[1], OperatorKind::Surface));
        assert_eq!(cfg.obs_error_relative, vec![0.2, 0.1]);
    }

    #[test]
    fn rejects_unknown_nature_h_function() {
        let mut raw = minimal_raw();
        raw.nature_h_functions = vec!["not_a_function".into()];
        assert!(matches!(
            RunConfig::validate(raw),
            Err(Error::Config { .. })
        ));
    }
}
