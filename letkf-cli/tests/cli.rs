use std::fs;

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

fn write_config(dir: &TempDir, res: &str) -> std::path::PathBuf {
    let config_path = dir.child("ens_config.json");
    let config = format!(
        r#"{{
            "MY_PATH": "{my_path}",
            "RUN_NAME": "cli_test",
            "RES": "{res}",
            "REGION": "",
            "met_name": "",
            "STATE_VECTOR_CONC": ["A"],
            "CONTROL_VECTOR_CONC": ["A"],
            "CONTROL_VECTOR_EMIS": {{"E": "tag"}},
            "OBSERVED_SPECIES": {{"A_obs": "A"}},
            "OBS_OPERATORS": ["Surface"],
            "NATURE_OPERATOR": "SimulatedNature",
            "NATURE_H_FUNCTIONS": ["surface_obs"],
            "OBS_ERROR_MATRICES": ["0.1"],
            "LOCALIZATION_RADIUS_km": 500.0,
            "INFLATION_FACTOR": 0.0,
            "pPERT": 0.1,
            "ASSIM_TIME": 6,
            "START_DATE": "20190101",
            "nEnsemble": 2,
            "DO_CONTROL_RUN": false
        }}"#,
        my_path = dir.path().to_str().unwrap().replace('\\', "\\\\"),
    );
    config_path.write_str(&config).unwrap();
    config_path.path().to_path_buf()
}

#[test]
fn unsupported_grid_tag_exits_with_config_error_code() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(&dir, "bogus_tag");

    Command::cargo_bin("letkf")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "initialize-scaling-factors", "20190101"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("grid"));
}

#[test]
fn initialize_scaling_factors_writes_identical_draws_to_every_member() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(&dir, "4.0x5.0");

    let ensemble_dir = dir.path().join("cli_test").join("ensemble_runs");
    fs::create_dir_all(ensemble_dir.join("cli_test_000")).unwrap();
    fs::create_dir_all(ensemble_dir.join("cli_test_001")).unwrap();
    fs::create_dir_all(ensemble_dir.join("cli_test_002")).unwrap();

    Command::cargo_bin("letkf")
        .unwrap()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "initialize-scaling-factors",
            "20190101",
            "--seed",
            "7",
        ])
        .assert()
        .success();

    // Nature (member 000) is never touched.
    assert!(!ensemble_dir.join("cli_test_000").join("E_SCALEFACTOR.nc").exists());

    let member_1 = fs::read(ensemble_dir.join("cli_test_001").join("E_SCALEFACTOR.nc")).unwrap();
    let member_2 = fs::read(ensemble_dir.join("cli_test_002").join("E_SCALEFACTOR.nc")).unwrap();
    assert_eq!(member_1, member_2, "every member must receive the same perturbation draw");
}
