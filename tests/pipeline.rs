use cadweight::config::RunConfig;
use cadweight::data::{LoadOptions, load_observations};
use cadweight::estimate::{ModeOptions, find_mode, least_squares_start};
use cadweight::importance::do_importance;
use cadweight::output::{PosteriorSummary, write_weighted_samples};
use cadweight::types::{Hyperparameter4, Observations, Parameter4};
use ndarray::{Array1, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fs;
use std::io::Write;
use tempfile::tempdir;

fn toy_observations() -> Observations {
    Observations::new(
        array![1.0, 2.0, 3.0, 4.0, 5.0],
        array![1.1, 2.0, 2.9, 4.2, 4.8],
    )
    .unwrap()
}

fn unit_gamma() -> Hyperparameter4 {
    Hyperparameter4::new([1.0, 1.0, 1.0, 1.0]).unwrap()
}

#[test]
fn toy_data_mode_and_interval_for_slope() {
    let obs = toy_observations();
    let gamma = unit_gamma();
    let laplace = find_mode(&Parameter4::zeros(), &obs, &gamma, &ModeOptions::default()).unwrap();

    let mode = laplace.mode();
    assert!(mode[0].abs() < 0.5, "intercept mode {}", mode[0]);
    assert!((mode[1] - 1.0).abs() < 0.5, "slope mode {}", mode[1]);

    let mut rng = StdRng::seed_from_u64(20240601);
    let sample = do_importance(1000, &laplace, &obs, &gamma, &mut rng).unwrap();
    assert_eq!(sample.len(), 1000);
    let total: f64 = sample.samples().iter().map(|s| s.log_weight.exp()).sum();
    assert!((total - 1.0).abs() < 1e-8);

    let intervals = sample.credible_intervals(0.9).unwrap();
    assert!(intervals[1].contains(1.0), "slope interval {:?}", intervals[1]);
    assert!(intervals[2].lower > 0.0 && intervals[3].lower > 0.0);
}

#[test]
fn single_draw_carries_all_the_weight() {
    let obs = toy_observations();
    let gamma = unit_gamma();
    let laplace = find_mode(&Parameter4::zeros(), &obs, &gamma, &ModeOptions::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let sample = do_importance(1, &laplace, &obs, &gamma, &mut rng).unwrap();
    assert_eq!(sample.samples()[0].log_weight, 0.0);
    assert_eq!(sample.effective_sample_size(), 1.0);
}

#[test]
fn recovers_slope_from_simulated_parts() {
    let (beta1, beta2, beta3, beta4) = (0.5, 1.05, 0.1, 4e-4);
    let mut rng = StdRng::seed_from_u64(77);
    let x: Array1<f64> = (0..200).map(|i| 10.0 + 0.45 * i as f64).collect();
    let y: Array1<f64> = x
        .iter()
        .map(|&xi| {
            let z: f64 = rng.sample(StandardNormal);
            beta1 + beta2 * xi + (beta3 + beta4 * xi * xi).sqrt() * z
        })
        .collect();
    let obs = Observations::new(x, y).unwrap();
    let gamma = unit_gamma();

    let start = least_squares_start(&obs).unwrap();
    let laplace = find_mode(&start, &obs, &gamma, &ModeOptions::default()).unwrap();
    let sample = do_importance(2000, &laplace, &obs, &gamma, &mut rng).unwrap();

    let means = sample.weighted_means();
    assert!((means[1] - beta2).abs() < 0.02, "slope mean {}", means[1]);
    assert!(sample.effective_sample_size() > 100.0);
}

#[test]
fn file_to_summary_round_trip() {
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("weights.tsv");
    let mut file = fs::File::create(&data_path).unwrap();
    writeln!(file, "Index\tDate\tMaterial\tCAD_Weight\tActual_Weight").unwrap();
    for (i, (x, y)) in [(1.0, 1.1), (2.0, 2.0), (3.0, 2.9), (4.0, 4.2), (5.0, 4.8)]
        .iter()
        .enumerate()
    {
        writeln!(file, "{}\t2021-06-0{}\tSteel\t{}\t{}", i + 1, i + 1, x, y).unwrap();
    }
    writeln!(file, "6\t2021-06-07\tBrass\t40\t3").unwrap();
    drop(file);

    let config = RunConfig::parse("[sampling]\ndraws = 300\nseed = 5\ncoverage = 0.8").unwrap();
    let options = LoadOptions {
        material: Some("Steel".to_string()),
    };
    let obs = load_observations(&data_path, &options).unwrap();
    assert_eq!(obs.len(), 5);

    let gamma = config.hyperparameters().unwrap();
    let start = config.optimizer.starting_point(&obs).unwrap();
    let laplace = find_mode(&start, &obs, &gamma, &config.optimizer.mode).unwrap();
    let mut rng = StdRng::seed_from_u64(config.sampling.seed);
    let sample = do_importance(config.sampling.draws, &laplace, &obs, &gamma, &mut rng).unwrap();

    let samples_path = dir.path().join("samples.tsv");
    write_weighted_samples(&samples_path, &sample).unwrap();
    assert_eq!(fs::read_to_string(&samples_path).unwrap().lines().count(), 301);

    let summary = PosteriorSummary::new(&laplace, &sample, 5, 0.8).unwrap();
    let summary_path = dir.path().join("summary.toml");
    summary.save(&summary_path).unwrap();
    let loaded = PosteriorSummary::load(&summary_path).unwrap();
    assert_eq!(loaded.draws, 300);
    assert_eq!(loaded.beta2.interval.coverage, 0.8);
}
