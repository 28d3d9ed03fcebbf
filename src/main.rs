// ========================================================================================
//
//                      THE ORCHESTRATOR: CADWEIGHT
//
// ========================================================================================
//
// Command-line entry point. Parses arguments, merges them over the run
// configuration, and drives the three stages of the analysis:
//
// 1.  **Mode search:** locate the posterior mode and build the Laplace approximation.
// 2.  **Importance sampling:** reweight draws from that approximation toward the
//     true posterior.
// 3.  **Summary:** weighted means and equal-tailed credible intervals for β1..β4.
//
// `fit` stops after stage 1; `sample` runs all three.

use cadweight::config::RunConfig;
use cadweight::data::{LoadOptions, load_observations};
use cadweight::estimate::{LaplaceApproximation, find_mode};
use cadweight::importance::do_importance;
use cadweight::output::{LaplaceReport, PosteriorSummary, write_weighted_samples};
use cadweight::types::{Hyperparameter4, Observations};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "cadweight",
    about = "Bayesian regression of actual part weight on CAD weight",
    long_about = "Fits y ~ N(β1 + β2·x, β3 + β4·x²) for actual weight y and CAD weight x. \
                 The posterior is approximated around its mode (Laplace) and refined by \
                 self-normalized importance sampling."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Arguments shared by both subcommands.
#[derive(clap::Args)]
struct InputArgs {
    /// Path to a CSV or TSV file with CAD_Weight and Actual_Weight columns
    data: PathBuf,

    /// Run configuration file (.toml); defaults are used for anything omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Keep only rows whose Material column equals this value
    #[arg(long)]
    material: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the posterior mode and its Laplace approximation
    #[command(about = "Fit the Laplace approximation (outputs: laplace.toml)")]
    Fit {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, default_value = "laplace.toml")]
        output: PathBuf,
    },

    /// Importance-sample the posterior and summarize it
    #[command(about = "Importance-sample the posterior (outputs: samples.tsv, summary.toml)")]
    Sample {
        #[command(flatten)]
        input: InputArgs,

        /// Number of importance draws (overrides the config file)
        #[arg(long, value_name = "N")]
        draws: Option<usize>,

        /// Random seed (overrides the config file)
        #[arg(long)]
        seed: Option<u64>,

        /// Credible interval coverage in (0, 1) (overrides the config file)
        #[arg(long)]
        coverage: Option<f64>,

        #[arg(long, default_value = "samples.tsv")]
        samples_out: PathBuf,

        #[arg(long, default_value = "summary.toml")]
        summary_out: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit { input, output } => fit_command(&input, &output),
        Commands::Sample {
            input,
            draws,
            seed,
            coverage,
            samples_out,
            summary_out,
        } => {
            let overrides = SamplingOverrides {
                draws,
                seed,
                coverage,
            };
            sample_command(&input, &overrides, &samples_out, &summary_out)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct SamplingOverrides {
    draws: Option<usize>,
    seed: Option<u64>,
    coverage: Option<f64>,
}

fn load_config(path: Option<&Path>) -> Result<RunConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    })
}

fn fit_stage(
    input: &InputArgs,
    config: &RunConfig,
) -> Result<(Observations, Hyperparameter4, LaplaceApproximation), Box<dyn Error>> {
    let options = LoadOptions {
        material: input.material.clone(),
    };
    let observations = load_observations(&input.data, &options)?;
    let gamma = config.hyperparameters()?;
    let start = config.optimizer.starting_point(&observations)?;
    log::info!("Starting mode search from θ = {:?}", start.0);
    let laplace = find_mode(&start, &observations, &gamma, &config.optimizer.mode)?;
    Ok((observations, gamma, laplace))
}

fn fit_command(input: &InputArgs, output: &Path) -> Result<(), Box<dyn Error>> {
    let config = load_config(input.config.as_deref())?;
    let (_, _, laplace) = fit_stage(input, &config)?;

    let report = LaplaceReport::from_approximation(&laplace);
    println!("Posterior mode (β): {:?}", report.beta_mode);
    println!("Log posterior at mode: {:.6}", report.log_posterior_at_mode);
    report.save(output)?;
    println!("Laplace approximation saved to: {}", output.display());
    Ok(())
}

fn sample_command(
    input: &InputArgs,
    overrides: &SamplingOverrides,
    samples_out: &Path,
    summary_out: &Path,
) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(input.config.as_deref())?;
    if let Some(draws) = overrides.draws {
        config.sampling.draws = draws;
    }
    if let Some(seed) = overrides.seed {
        config.sampling.seed = seed;
    }
    if let Some(coverage) = overrides.coverage {
        config.sampling.coverage = coverage;
    }
    config.validate()?;

    let (observations, gamma, laplace) = fit_stage(input, &config)?;
    let mut rng = StdRng::seed_from_u64(config.sampling.seed);
    let sample = do_importance(
        config.sampling.draws,
        &laplace,
        &observations,
        &gamma,
        &mut rng,
    )?;
    write_weighted_samples(samples_out, &sample)?;

    let summary = PosteriorSummary::new(
        &laplace,
        &sample,
        config.sampling.seed,
        config.sampling.coverage,
    )?;
    println!(
        "Effective sample size: {:.1} of {}",
        summary.effective_sample_size, summary.draws
    );
    for (i, coefficient) in summary.coefficients().iter().enumerate() {
        println!(
            "beta{}: mean {:.6}, {:.0}% interval [{:.6}, {:.6}]",
            i + 1,
            coefficient.mean,
            coefficient.interval.coverage * 100.0,
            coefficient.interval.lower,
            coefficient.interval.upper
        );
    }
    summary.save(summary_out)?;
    println!("Posterior summary saved to: {}", summary_out.display());
    Ok(())
}
