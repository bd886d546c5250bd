//! Command-line entry point for `dtd`.
//!
//! `simulate` generates a labeled synthetic expression matrix, learns a feature weighting
//! vector on mixtures of it and reports how much the weighting improves deconvolution of
//! held-out test mixtures. `default-config` prints every tunable with its default value.

use clap::{CommandFactory, Parser, Subcommand};
use dtd::config::PipelineConfig;
use dtd::pipeline::{self, PipelineOutcome};
use dtd::progress::{CrossValidationProgress, TrainingStage};
use dtd::synthetic::SyntheticDataBuilder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

#[derive(Parser)]
#[command(
    name = "dtd",
    about = "Loss-function learning for digital tissue deconvolution",
    long_about = "Learns a sparse per-feature weighting vector that makes weighted least-squares \
                 deconvolution of bulk mixtures reproduce their known cell-type compositions."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train and evaluate on seeded synthetic expression data
    #[command(about = "Train on synthetic mixtures and report test-set correlations")]
    Simulate(SimulateArgs),

    /// Print the default pipeline configuration as TOML
    #[command(about = "Print the default configuration (outputs: TOML on stdout)")]
    DefaultConfig,
}

#[derive(clap::Args)]
struct SimulateArgs {
    /// TOML configuration file; missing keys keep their defaults
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seed for the synthetic expression profiles
    #[arg(long, default_value_t = 1)]
    data_seed: u64,

    /// Number of features (genes)
    #[arg(long, default_value_t = 50)]
    features: usize,

    /// Number of cell-type categories
    #[arg(long, default_value_t = 3)]
    categories: usize,

    /// Labeled samples generated per category
    #[arg(long, default_value_t = 60)]
    samples_per_category: usize,

    /// Marker features per category
    #[arg(long, default_value_t = 3)]
    markers: usize,
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Mirrors cross-validation progress onto one terminal progress bar per stage.
struct BarProgress {
    bar: Mutex<ProgressBar>,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(ProgressBar::hidden()),
        }
    }
}

impl CrossValidationProgress for BarProgress {
    fn on_stage_start(&self, stage: TrainingStage, total_fits: usize) {
        if let Ok(mut bar) = self.bar.lock() {
            *bar = create_progress_bar(total_fits as u64, stage.describe());
        }
    }

    fn on_fit_complete(&self, fold: usize, lambda: f64, held_out_loss: f64) {
        if let Ok(bar) = self.bar.lock() {
            bar.inc(1);
        }
        log::debug!("Fold {fold} at lambda {lambda:.3e}: held-out loss {held_out_loss:.4}");
    }

    fn on_stage_finish(&self, stage: TrainingStage) {
        if let Ok(bar) = self.bar.lock() {
            bar.finish_with_message(format!("{stage} done"));
        }
    }
}

fn simulate(args: SimulateArgs) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let data = SyntheticDataBuilder::new(args.data_seed)
        .features(args.features)
        .categories(args.categories)
        .samples_per_category(args.samples_per_category)
        .markers_per_category(args.markers)
        .build()?;
    log::info!(
        "Simulated {} samples over {} features in {} categories",
        data.matrix.n_samples(),
        data.matrix.n_features(),
        data.categories.len()
    );

    let progress = BarProgress::new();
    let outcome = pipeline::run(&data.matrix, &data.labels, &data.categories, &config, &progress)?;
    print_summary(&outcome);
    Ok(())
}

fn print_summary(outcome: &PipelineOutcome) {
    let model = &outcome.model;
    println!("Selected lambda:      {:.4e}", outcome.report.selected_lambda);
    println!(
        "Nonzero features:     {} of {}",
        model.nonzero_count(),
        model.weights.len()
    );
    println!(
        "Test correlation:     {:.4} (pearson) {:.4} (spearman)",
        outcome.trained.mean_pearson, outcome.trained.mean_spearman
    );
    println!(
        "Untrained baseline:   {:.4} (pearson) {:.4} (spearman)",
        outcome.baseline.mean_pearson, outcome.baseline.mean_spearman
    );
    println!("Improvement:          {:+.4}", outcome.improvement());
    println!(
        "Final fit:            {:?} after {} iterations",
        model.status, model.iterations
    );
    let features = model.selected_features();
    if !features.is_empty() {
        println!("Selected features:    {}", features.join(", "));
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result: Result<(), Box<dyn Error>> = match command {
        Some(Commands::Simulate(args)) => simulate(args),
        Some(Commands::DefaultConfig) => PipelineConfig::default()
            .to_toml_string()
            .map(|text| print!("{text}"))
            .map_err(Into::into),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
