//! Observation operators: map a model 3-D concentration field to observation
//! space.
//!
//! Three concrete kinds are supported, resolved once at config load into the
//! [`OperatorKind`] tagged union rather than dispatched by string/class name.

use ndarray::{Array1, Array3, ArrayView1, ArrayView3};

use crate::config::OperatorTag;

/// Avogadro's number, molec/mol.
const AVOGADRO: f64 = 6.0221408e23;
/// Universal gas constant, J/(mol K).
const GAS_CONSTANT: f64 = 8.31446261815324;

/// Scattering-weight / pressure pairs and the ancillary fields a satellite
/// column retrieval needs per footprint.
#[derive(Debug, Clone)]
pub struct SatelliteFootprint {
    /// Model mid-level pressure, Pa, bottom-to-top.
    pub pressure_mid_pa: Vec<f64>,
    /// Model mid-level temperature, K, bottom-to-top.
    pub temperature_k: Vec<f64>,
    /// Model box height at each level, m, bottom-to-top.
    pub box_height_m: Vec<f64>,
    /// Model level index of the tropopause (exclusive upper bound).
    pub tropopause_level: usize,
    /// Retrieval scattering weights, unitless, at `sw_pressure_pa`.
    pub sw_values: Vec<f64>,
    /// Pressure grid, Pa, that `sw_values` is defined on (descending or
    /// ascending; interpolation does not assume an order beyond what
    /// [`interp_linear_extrap_zero`] requires).
    pub sw_pressure_pa: Vec<f64>,
    /// Retrieval's reported tropospheric air-mass factor.
    pub obs_amf: f64,
    /// Retrieval's reported vertical column density.
    pub obs_vcd: f64,
}

/// Parameters for a [`OperatorKind::SatelliteColumn`] operator: currently
/// just documents which species it is attached to, since the per-footprint
/// ancillary data is supplied at evaluation time by the driver (it comes
/// from the forward model's meteorology fields, not from the grid alone).
#[derive(Debug, Clone, Default)]
pub struct SatelliteParams;

/// Tagged union of the observation operator kinds this tool supports,
/// resolved once at config load time from the textual [`OperatorTag`].
#[derive(Debug, Clone)]
pub enum OperatorKind {
    Surface,
    Sum,
    SatelliteColumn(SatelliteParams),
}

impl OperatorKind {
    pub fn from_tag(tag: OperatorTag) -> Self {
        match tag {
            OperatorTag::Surface => OperatorKind::Surface,
            OperatorTag::Sum => OperatorKind::Sum,
            OperatorTag::SatelliteColumn => OperatorKind::SatelliteColumn(SatelliteParams),
        }
    }

    /// Resolve one `NATURE_H_FUNCTIONS` entry, named after the original
    /// tool's ready-made `H` functions (`surface_obs`, `column_sum`). There
    /// is no ready-made nature function for satellite retrievals, matching
    /// the original `NatureHelper`, which only ever zips `nature_h_functions`
    /// against those two free functions.
    pub fn from_nature_h_function(name: &str) -> crate::error::Result<Self> {
        match name {
            "surface_obs" => Ok(OperatorKind::Surface),
            "column_sum" => Ok(OperatorKind::Sum),
            other => Err(crate::error::Error::config(
                crate::error::Component::Operator,
                format!("unknown NATURE_H_FUNCTIONS entry '{other}'; expected 'surface_obs' or 'column_sum'"),
            )),
        }
    }
}

/// Output of an observation operator: the simulated observation values and
/// the lat/lon each value corresponds to.
pub struct ObsResult {
    pub values: Array1<f64>,
    pub lats: Array1<f64>,
    pub lons: Array1<f64>,
}

/// `H`: maps a full 3-D concentration field (optionally restricted to a
/// patch via `lat_inds`/`lon_inds`) to observation space.
///
/// `lat_grid`/`lon_grid` are the full grid's lat/lon center values; when
/// `indices` is `None` the whole bottom level (surface) or whole column
/// (sum) is flattened in row-major order.
pub fn surface_obs(
    conc3d: &ArrayView3<f64>,
    lat_grid: &[f64],
    lon_grid: &[f64],
    indices: Option<(&[usize], &[usize])>,
) -> ObsResult {
    match indices {
        Some((lat_inds, lon_inds)) => {
            let values = Array1::from_iter(
                lat_inds
                    .iter()
                    .zip(lon_inds.iter())
                    .map(|(&i, &j)| conc3d[[0, i, j]]),
            );
            let lats = Array1::from_iter(lat_inds.iter().map(|&i| lat_grid[i]));
            let lons = Array1::from_iter(lon_inds.iter().map(|&j| lon_grid[j]));
            ObsResult { values, lats, lons }
        }
        None => {
            let surface = conc3d.index_axis(ndarray::Axis(0), 0);
            let (nlat, nlon) = (surface.shape()[0], surface.shape()[1]);
            let values = Array1::from_iter(surface.iter().copied());
            let lats = Array1::from_iter((0..nlat).flat_map(|i| std::iter::repeat(lat_grid[i]).take(nlon)));
            let lons = Array1::from_iter((0..nlat).flat_map(|_| lon_grid.iter().copied()));
            ObsResult { values, lats, lons }
        }
    }
}

/// Column sum operator: sums concentration over all levels at each
/// requested horizontal cell.
pub fn column_sum(
    conc3d: &ArrayView3<f64>,
    lat_grid: &[f64],
    lon_grid: &[f64],
    indices: Option<(&[usize], &[usize])>,
) -> ObsResult {
    match indices {
        Some((lat_inds, lon_inds)) => {
            let values = Array1::from_iter(lat_inds.iter().zip(lon_inds.iter()).map(|(&i, &j)| {
                conc3d.index_axis(ndarray::Axis(1), i).index_axis(ndarray::Axis(1), j).sum()
            }));
            let lats = Array1::from_iter(lat_inds.iter().map(|&i| lat_grid[i]));
            let lons = Array1::from_iter(lon_inds.iter().map(|&j| lon_grid[j]));
            ObsResult { values, lats, lons }
        }
        None => {
            let (nlat, nlon) = (conc3d.shape()[1], conc3d.shape()[2]);
            let summed = conc3d.sum_axis(ndarray::Axis(0));
            let values = Array1::from_iter(summed.iter().copied());
            let lats = Array1::from_iter((0..nlat).flat_map(|i| std::iter::repeat(lat_grid[i]).take(nlon)));
            let lons = Array1::from_iter((0..nlat).flat_map(|_| lon_grid.iter().copied()));
            ObsResult { values, lats, lons }
        }
    }
}

/// Linear interpolation of `(xs, ys)` onto `targets`, with extrapolation
/// beyond the domain clamped to zero (matching `scipy.interpolate.interp1d`
/// with `bounds_error=False, fill_value=0`).
pub fn interp_linear_extrap_zero(xs: &[f64], ys: &[f64], targets: &[f64]) -> Vec<f64> {
    assert_eq!(xs.len(), ys.len());
    // Work on a copy sorted by x so interpolation is well defined regardless
    // of the input ordering (OMI scattering-weight pressure grids are
    // typically descending).
    let mut order: Vec<usize> = (0..xs.len()).collect();
    order.sort_by(|&a, &b| xs[a].partial_cmp(&xs[b]).unwrap());
    let sorted_x: Vec<f64> = order.iter().map(|&i| xs[i]).collect();
    let sorted_y: Vec<f64> = order.iter().map(|&i| ys[i]).collect();

    targets
        .iter()
        .map(|&t| {
            if sorted_x.is_empty() || t < sorted_x[0] || t > *sorted_x.last().unwrap() {
                return 0.0;
            }
            let idx = match sorted_x.binary_search_by(|x| x.partial_cmp(&t).unwrap()) {
                Ok(i) => return sorted_y[i],
                Err(i) => i,
            };
            let (x0, x1) = (sorted_x[idx - 1], sorted_x[idx]);
            let (y0, y1) = (sorted_y[idx - 1], sorted_y[idx]);
            let frac = (t - x0) / (x1 - x0);
            y0 + frac * (y1 - y0)
        })
        .collect()
}

/// Result of the satellite column operator for one footprint: the
/// model-equivalent vertical/slant columns and air-mass factor, plus the
/// reconstructed observed slant column that the assimilation compares
/// against.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRetrieval {
    pub model_vcd: f64,
    pub model_scd: f64,
    pub model_amf: f64,
    pub obs_scd: f64,
}

/// Satellite column retrieval with an averaging kernel (scattering
/// weights), as used for NO2-style operators.
///
/// `dry_mixing_ratio` is the mid-level dry mixing ratio (mol/mol) for the
/// levels below the tropopause; levels at or above `tropopause_level` are
/// excluded from the partial-column sum, mirroring "mask to NaN then
/// nansum" in the original Python.
pub fn satellite_column(
    dry_mixing_ratio: &[f64],
    footprint: &SatelliteFootprint,
) -> ColumnRetrieval {
    let n_below_trop = footprint.tropopause_level.min(dry_mixing_ratio.len());

    let sw_on_model = interp_linear_extrap_zero(
        &footprint.sw_pressure_pa,
        &footprint.sw_values,
        &footprint.pressure_mid_pa[..n_below_trop],
    );

    let mut model_vcd = 0.0;
    let mut model_scd = 0.0;
    for lev in 0..n_below_trop {
        let number_density = (dry_mixing_ratio[lev] * AVOGADRO)
            / (footprint.temperature_k[lev] * GAS_CONSTANT)
            * (footprint.pressure_mid_pa[lev])
            * 1e-6;
        let partial_column = number_density * (footprint.box_height_m[lev] * 1e2);
        model_vcd += partial_column;
        model_scd += partial_column * sw_on_model[lev];
    }

    let model_amf = model_scd / model_vcd;
    let obs_scd = footprint.obs_amf * footprint.obs_vcd;

    ColumnRetrieval {
        model_vcd,
        model_scd,
        model_amf,
        obs_scd,
    }
}

/// Evaluate `H` for an entire ensemble (`conc4d[lev, lat, lon, member]`)
/// restricted to a patch, returning the observation ensemble matrix `Y`
/// (`p x k`), its column mean, and the mean-subtracted perturbations.
///
/// Only [`OperatorKind::Surface`] and [`OperatorKind::Sum`] are evaluated
/// this way: they read purely from the concentration field. A satellite
/// column retrieval needs per-footprint meteorology (temperature, pressure,
/// box height, tropopause level) that does not live in `conc4d`, so it is
/// driven directly through [`satellite_column`] by the caller that has that
/// ancillary data to hand, matching the original tool keeping its AMF/SCD
/// column-comparison path (`gcCompare`) separate from the simulated-nature
/// `ObsOperator` subclasses.
pub fn ensemble_obs_mean_and_pert(
    operator: &OperatorKind,
    conc4d: &ndarray::Array4<f64>,
    lat_grid: &[f64],
    lon_grid: &[f64],
    indices: Option<(&[usize], &[usize])>,
) -> crate::error::Result<(Array1<f64>, ndarray::Array2<f64>, ndarray::Array2<f64>)> {
    let k = conc4d.shape()[3];
    let mut columns: Vec<Array1<f64>> = Vec::with_capacity(k);
    for m in 0..k {
        let member = conc4d.index_axis(ndarray::Axis(3), m);
        let result = match operator {
            OperatorKind::Surface => surface_obs(&member, lat_grid, lon_grid, indices),
            OperatorKind::Sum => column_sum(&member, lat_grid, lon_grid, indices),
            OperatorKind::SatelliteColumn(_) => {
                return Err(crate::error::Error::config(
                    crate::error::Component::Operator,
                    "SatelliteColumn operator must be driven through satellite_column() with \
                     per-footprint meteorology, not ensemble_obs_mean_and_pert()",
                ))
            }
        };
        columns.push(result.values);
    }

    let p = columns[0].len();
    let mut y = ndarray::Array2::<f64>::zeros((p, k));
    for (m, col) in columns.iter().enumerate() {
        y.column_mut(m).assign(col);
    }
    let mean = y.mean_axis(ndarray::Axis(1)).unwrap();
    let mut pert = y.clone();
    for mut col in pert.columns_mut() {
        col -= &mean;
    }
    Ok((mean, y, pert))
}

/// `d = y_obs - ybar_bg` for a patch's observations.
pub fn obs_diff(y_obs: &ArrayView1<f64>, ybar_bg: &ArrayView1<f64>) -> Array1<f64> {
    y_obs.to_owned() - ybar_bg
}
