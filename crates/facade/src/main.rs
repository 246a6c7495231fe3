//! `dpresnet` command-line tool.
//!
//! ```bash
//! # Train with the published defaults on CIFAR-10 in ../cifar10
//! dpresnet train --epsilon 10 --output eps10.json
//!
//! # Smoke run on synthetic data with a narrow network
//! dpresnet train --config smoke.toml --synthetic 2000
//!
//! # Noise multiplier for a budget
//! dpresnet calibrate --epsilon 5
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dpresnet::accounting::{get_noise_multiplier, steps_for_epochs, AccountantKind};
use dpresnet::core::PoissonSampling;
use dpresnet::data::{load_split, CifarDataset, Normalize, Split, SyntheticDataset};
use dpresnet::nn::{ModuleValidator, ResNetConfig};
use dpresnet::{fit, markdown_table, published_results, TrainConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "dpresnet")]
#[command(version)]
#[command(about = "Differentially private ResNet-18 training on CIFAR-10")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train privately and report test metrics
    Train {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Target epsilon
        #[arg(short, long)]
        epsilon: Option<f64>,

        /// Number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Directory containing cifar-10-batches-bin
        #[arg(long, env = "DPRESNET_DATA_ROOT")]
        data_root: Option<PathBuf>,

        /// Train on N synthetic images instead of CIFAR-10
        #[arg(long)]
        synthetic: Option<usize>,

        /// Output file for the experiment record (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Hide the progress bar
        #[arg(long, default_value = "false")]
        quiet: bool,
    },

    /// Check a ResNet-18 for layers incompatible with DP-SGD
    ValidateModel {
        /// Width of the first stage
        #[arg(short, long, default_value = "64")]
        width: usize,
    },

    /// Calibrate the noise multiplier for a privacy budget
    Calibrate {
        /// Target epsilon
        #[arg(short, long)]
        epsilon: f64,

        /// Target delta
        #[arg(short, long, default_value = "1e-5")]
        delta: f64,

        /// Number of epochs
        #[arg(long, default_value = "20")]
        epochs: usize,

        /// Expected logical batch size
        #[arg(short, long, default_value = "200")]
        batch_size: usize,

        /// Training set size
        #[arg(short, long, default_value = "50000")]
        num_samples: usize,

        /// Clipping threshold
        #[arg(long, default_value = "1.2")]
        max_grad_norm: f64,

        /// Accountant (rdp or gdp)
        #[arg(long, default_value = "rdp")]
        accountant: AccountantKind,
    },

    /// Print the published results table
    Baseline,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            epsilon,
            epochs,
            data_root,
            synthetic,
            output,
            quiet,
        } => {
            let mut config = match config {
                Some(path) => TrainConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => TrainConfig::default(),
            };
            if let Some(epsilon) = epsilon {
                config.epsilon = epsilon;
            }
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            if let Some(root) = data_root {
                config.data_root = root;
            }
            config.validate()?;
            run_train(&config, synthetic, output, !quiet)?;
        }
        Commands::ValidateModel { width } => {
            run_validate_model(width)?;
        }
        Commands::Calibrate {
            epsilon,
            delta,
            epochs,
            batch_size,
            num_samples,
            max_grad_norm,
            accountant,
        } => {
            let sampler = PoissonSampling::from_batch_size(num_samples, batch_size)?;
            let steps = steps_for_epochs(epochs, sampler.sample_rate);
            let sigma = get_noise_multiplier(
                epsilon,
                delta,
                sampler.sample_rate,
                steps,
                accountant,
                dpresnet::accounting::DEFAULT_EPSILON_TOLERANCE,
            )?;
            println!("Using sigma={} and C={}", sigma, max_grad_norm);
        }
        Commands::Baseline => {
            print!("{}", markdown_table(&published_results()));
        }
    }

    Ok(())
}

fn run_train(
    config: &TrainConfig,
    synthetic: Option<usize>,
    output: Option<PathBuf>,
    show_progress: bool,
) -> Result<()> {
    let run = match synthetic {
        Some(n) => {
            info!(images = n, "training on synthetic data");
            let train = SyntheticDataset::cifar_like(n, config.seed)?;
            // Same class templates and seed: the test set shares the first
            // images of the training set.
            let test_len = config.test_limit.unwrap_or(n / 5).max(1);
            let test = SyntheticDataset::cifar_like(test_len, config.seed)?;
            fit(config, &train, &test, show_progress)?
        }
        None => {
            let mut train = load_split(&config.data_root, Split::Train)
                .context("CIFAR-10 training data not found; set --data-root")?;
            let mut test = load_split(&config.data_root, Split::Test)?;
            if let Some(n) = config.train_limit {
                train.truncate(n);
            }
            if let Some(n) = config.test_limit {
                test.truncate(n);
            }
            let train = CifarDataset::new(train, Normalize::cifar10());
            let test = CifarDataset::new(test, Normalize::cifar10());
            fit(config, &train, &test, show_progress)?
        }
    };

    let record = &run.record;
    println!(
        "ε = {} δ = {}: test loss {:.6}, test accuracy {:.2}%",
        record.epsilon, record.delta, record.test_loss, record.test_accuracy
    );
    if let Some(path) = output {
        record
            .write_json(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "experiment record written");
    }
    Ok(())
}

fn run_validate_model(width: usize) -> Result<()> {
    let config = ResNetConfig::resnet18().with_base_width(width);
    config.check()?;

    let issues = ModuleValidator::validate(&config);
    println!("{} incompatible module(s):", issues.len());
    for issue in &issues {
        println!("  {issue}");
    }

    let fixed = ModuleValidator::fix(&config);
    let remaining = ModuleValidator::validate(&fixed);
    println!("After fix: {} incompatible module(s)", remaining.len());
    for (name, groups) in ModuleValidator::group_plan(&fixed) {
        println!("  {name}: GroupNorm({groups})");
    }
    println!("Parameters: {}", fixed.num_parameters());
    Ok(())
}
