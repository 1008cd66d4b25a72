//! activeseg CLI
//!
//! `train` runs the active-learning cycles, `test` writes predictions for one phase
//! and optionally scores them against ground truth.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use activeseg::active::{DiscriminativePolicy, StrategyKind};
use activeseg::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use activeseg::model::Architecture;
use activeseg::training::{
    run_active_learning, run_test, LrMode, RunConfig, RunReport, TestConfig, ValCrop,
};
use activeseg::utils::events::TracingSink;
use activeseg::utils::format_duration;
use activeseg::utils::logging::{init_logging, LogConfig};

/// Active-learning semantic segmentation with Burn
#[derive(Parser, Debug)]
#[command(name = "activeseg")]
#[command(version)]
#[command(about = "Active-learning semantic segmentation with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train over active-learning cycles
    Train(TrainArgs),

    /// Predict a phase and save class maps
    Test(TestArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Dataset root holding info.json and the images
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Directory of the {phase}_images.txt lists (defaults to data-dir)
    #[arg(long)]
    list_dir: Option<PathBuf>,

    /// Number of segmentation classes
    #[arg(short, long)]
    classes: usize,

    /// Square training crop size
    #[arg(short = 's', long, default_value = "896")]
    crop_size: u32,

    /// Network architecture (drn_d_tiny, drn_d_22, drn_d_38)
    #[arg(long, default_value = "drn_d_22", value_parser = parse_arch)]
    arch: Architecture,

    #[arg(short, long, default_value = "64")]
    batch_size: usize,

    /// Epochs per cycle
    #[arg(short, long, default_value = "10")]
    epochs: usize,

    #[arg(long, default_value = "0.01")]
    lr: f64,

    /// Learning-rate policy (step or poly)
    #[arg(long, default_value = "step")]
    lr_mode: LrMode,

    /// Epochs between step decays
    #[arg(long, default_value = "200")]
    step: usize,

    #[arg(long, default_value = "0.9")]
    momentum: f64,

    #[arg(long, default_value = "1e-4")]
    weight_decay: f64,

    /// Validate once and exit
    #[arg(long, default_value = "false")]
    evaluate: bool,

    /// Checkpoint metadata file to resume from
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Model record to start every cycle from
    #[arg(long)]
    pretrained: Option<PathBuf>,

    #[arg(long, default_value = "output/runs")]
    save_path: PathBuf,

    /// Archive a checkpoint every N epochs
    #[arg(long, default_value = "1")]
    save_iter: usize,

    #[arg(long, default_value = "10")]
    print_freq: usize,

    #[arg(long, default_value = "10")]
    cycles: usize,

    #[arg(long, default_value = "150")]
    images_per_cycle: usize,

    #[arg(long, value_enum, default_value = "random")]
    strategy: StrategyKind,

    /// Weight of the ranking loss
    #[arg(long, default_value = "1.0")]
    lamda: f64,

    #[arg(long, default_value = "1")]
    lp_warmup_epochs: usize,

    #[arg(long, default_value = "150")]
    lp_detach_epoch: usize,

    #[arg(long, value_enum, default_value = "most-unlabeled")]
    dal_policy: DiscriminativePolicy,

    #[arg(long, default_value = "10")]
    dal_epochs: usize,

    #[arg(long, value_enum, default_value = "random-crop")]
    val_crop: ValCrop,

    #[arg(long, default_value = "0")]
    random_scale: f32,

    #[arg(long, default_value = "0")]
    random_rotate: f32,

    #[arg(long, default_value = "1311")]
    seed: u64,

    /// Write each cycle's selection to <stem>_cycle_NN.csv
    #[arg(long)]
    selection_csv: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TestArgs {
    #[arg(short, long)]
    data_dir: PathBuf,

    #[arg(long)]
    list_dir: Option<PathBuf>,

    #[arg(short, long)]
    classes: usize,

    #[arg(long, default_value = "drn_d_22", value_parser = parse_arch)]
    arch: Architecture,

    /// The checkpoint was trained with the loss-prediction head
    #[arg(long, default_value = "false")]
    loss_head: bool,

    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long)]
    pretrained: Option<PathBuf>,

    #[arg(long, default_value = "val")]
    phase: String,

    /// Aggregate predictions over several input scales
    #[arg(long, default_value = "false")]
    ms: bool,

    /// Score the test phase against its label list
    #[arg(long, default_value = "false")]
    with_gt: bool,

    #[arg(long, default_value = "")]
    test_suffix: String,

    #[arg(long, default_value = "output/test")]
    save_path: PathBuf,
}

fn parse_arch(name: &str) -> std::result::Result<Architecture, String> {
    Architecture::parse(name).map_err(|e| e.to_string())
}

impl From<TrainArgs> for RunConfig {
    fn from(args: TrainArgs) -> Self {
        RunConfig {
            data_dir: args.data_dir,
            list_dir: args.list_dir,
            classes: args.classes,
            crop_size: args.crop_size,
            arch: args.arch,
            batch_size: args.batch_size,
            epochs: args.epochs,
            lr: args.lr,
            lr_mode: args.lr_mode,
            step: args.step,
            momentum: args.momentum,
            weight_decay: args.weight_decay,
            evaluate: args.evaluate,
            resume: args.resume,
            pretrained: args.pretrained,
            save_path: args.save_path,
            save_iter: args.save_iter,
            print_freq: args.print_freq,
            cycles: args.cycles,
            images_per_cycle: args.images_per_cycle,
            strategy: args.strategy,
            lamda: args.lamda,
            lp_warmup_epochs: args.lp_warmup_epochs,
            lp_detach_epoch: args.lp_detach_epoch,
            dal_policy: args.dal_policy,
            dal_epochs: args.dal_epochs,
            val_crop: args.val_crop,
            random_scale: args.random_scale,
            random_rotate: args.random_rotate,
            seed: args.seed,
            selection_csv: args.selection_csv,
        }
    }
}

impl From<TestArgs> for TestConfig {
    fn from(args: TestArgs) -> Self {
        TestConfig {
            data_dir: args.data_dir,
            list_dir: args.list_dir,
            classes: args.classes,
            arch: args.arch,
            loss_head: args.loss_head,
            resume: args.resume,
            pretrained: args.pretrained,
            phase: args.phase,
            multi_scale: args.ms,
            with_gt: args.with_gt,
            test_suffix: args.test_suffix,
            save_path: args.save_path,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Train(args) => cmd_train(args.into()),
        Commands::Test(args) => cmd_test(args.into()),
    }
}

fn print_banner() {
    println!(
        "{} {}  {}",
        "activeseg".green().bold(),
        activeseg::VERSION,
        format!("backend: {}", backend_name()).dimmed()
    );
}

fn cmd_train(config: RunConfig) -> Result<()> {
    println!("{}", "Run configuration:".cyan().bold());
    println!("  Data:      {:?}", config.data_dir);
    println!("  Arch:      {}", config.arch);
    println!("  Classes:   {}", config.classes);
    println!("  Strategy:  {}", config.strategy);
    println!(
        "  Cycles:    {} x {} images",
        config.cycles, config.images_per_cycle
    );
    println!("  Epochs:    {} (lr {} {})", config.epochs, config.lr, config.lr_mode);
    println!();

    let start = Instant::now();
    let report =
        run_active_learning::<TrainingBackend>(&config, &default_device(), &TracingSink)
            .context("active-learning run failed")?;

    print_summary(&report);
    println!(
        "{} {}",
        "Finished in".green(),
        format_duration(start.elapsed().as_secs_f64())
    );
    println!(
        "{} {:?}",
        "Report written to".green(),
        config.save_path.join("run_report.json")
    );
    Ok(())
}

fn print_summary(report: &RunReport) {
    if let Some(eval) = report.evaluation {
        println!(
            "{} prec1 {:.3}  mIoU {:.3}",
            "Evaluation:".cyan().bold(),
            eval.prec1,
            eval.mean_iou
        );
        return;
    }

    println!();
    println!("{}", "Per-cycle results:".cyan().bold());
    for cycle in &report.cycles {
        println!(
            "  cycle {:>2}  labeled {:>5}  best prec1 {:>7.3}  best mIoU {:>7.3}",
            cycle.cycle, cycle.labeled, cycle.best_prec1, cycle.best_map
        );
    }
    if let Some(accuracy) = report.ranking_accuracy {
        println!("  ranking accuracy {:.4}", accuracy);
    }
}

fn cmd_test(config: TestConfig) -> Result<()> {
    let report = run_test::<DefaultBackend>(&config, &default_device(), &TracingSink)
        .context("test run failed")?;

    println!(
        "{} {} images -> {:?}",
        "Predicted".green().bold(),
        report.images,
        report.output_dir
    );
    if let Some(miou) = report.mean_iou {
        println!("{} {:.2}", "mIoU:".cyan().bold(), miou);
    }
    Ok(())
}
