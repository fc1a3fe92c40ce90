use clap::{Args, Parser, Subcommand, ValueHint};
use st_act::{
    act_metric_map, export_evaluation, flops_metric_map, heatmap_summaries, num_batches,
    ActResult, AdaptationMode, EndPoints, FinetuneSettings, HeatmapOptions, MetricMap,
    StreamingMetrics, TOTAL_FLOPS_NAME,
};
use st_nn::Module;
use st_tensor::Tensor;
use st_vision::{ResNetAct, ResNetActConfig};
use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "FLOP reports and evaluation runs for ResNet-ACT models"
)]
struct Cli {
    /// JSON model configuration; command-line flags override its fields
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the per-image FLOPs of a static forward pass
    Flops(ModelArgs),

    /// Run the model on random images and report halting metrics
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
struct ModelArgs {
    /// Adaptation mode: static, act, act_early_stopping or sact
    #[arg(long)]
    mode: Option<AdaptationMode>,

    /// Network depth (50, 101, 152, 200) or unit counts such as 3_4_6_3
    #[arg(long)]
    num_layers: Option<String>,

    #[arg(long)]
    num_classes: Option<usize>,

    /// Square input resolution in pixels
    #[arg(long)]
    image_size: Option<usize>,

    #[arg(long)]
    base_width: Option<usize>,

    /// Halting threshold slack
    #[arg(long)]
    epsilon: Option<f32>,

    /// Seed for parameter initialisation and the random inputs
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct EvaluateArgs {
    #[command(flatten)]
    model: ModelArgs,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    #[arg(long, default_value_t = 2)]
    num_samples: usize,

    /// Full checkpoint to load before evaluating (JSON or bincode)
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    /// Backbone checkpoint; halting parameters keep their initialisation
    #[arg(long, value_hint = ValueHint::FilePath, conflicts_with = "checkpoint")]
    finetune: Option<PathBuf>,

    /// Learning-rate multiplier reported for halting parameters
    #[arg(long, default_value_t = 1.0)]
    lr_coeff: f32,

    /// Write the evaluation record (bincode) to this path
    #[arg(long, value_hint = ValueHint::FilePath)]
    export: Option<PathBuf>,

    /// Write ponder-cost and unit-count heatmaps of the first batch as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    heatmap_out: Option<PathBuf>,

    /// Save the model parameters after evaluation
    #[arg(long, value_hint = ValueHint::FilePath)]
    save_checkpoint: Option<PathBuf>,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = spiral_config::tracing::init_tracing() {
        eprintln!("warning: {err}");
    }
    let result = match &cli.command {
        Command::Flops(args) => run_flops(&model_config(cli.config.as_deref(), args)?),
        Command::Evaluate(args) => {
            run_evaluate(model_config(cli.config.as_deref(), &args.model)?, args)
        }
    };
    spiral_config::tracing::flush_chrome_trace();
    result
}

fn model_config(path: Option<&Path>, args: &ModelArgs) -> Result<ResNetActConfig> {
    let mut config = match path {
        Some(path) => ResNetActConfig::from_json_path(path)?,
        None => ResNetActConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.act.mode = mode;
    }
    if let Some(layers) = &args.num_layers {
        config.num_layers = ResNetActConfig::parse_num_layers(layers)?;
    }
    if let Some(classes) = args.num_classes {
        config.num_classes = classes;
    }
    if let Some(size) = args.image_size {
        config.input_hw = (size, size);
    }
    if let Some(width) = args.base_width {
        config.base_width = width;
    }
    if let Some(epsilon) = args.epsilon {
        config.act.epsilon = epsilon;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate()?;
    Ok(config)
}

fn run_flops(config: &ResNetActConfig) -> Result<()> {
    let flops = config.static_flops()?;
    println!(
        "num_layers={:?} input={}x{} classes={}",
        config.num_layers, config.input_hw.0, config.input_hw.1, config.num_classes
    );
    println!("{TOTAL_FLOPS_NAME}: {flops:.0}");
    Ok(())
}

fn random_batch(config: &ResNetActConfig, batch_size: usize, index: usize) -> ActResult<Tensor> {
    let (h, w) = config.input_hw;
    let seed = config.seed.map(|seed| seed.wrapping_add(index as u64));
    Ok(Tensor::random_uniform(
        [batch_size, h, w, config.input_channels],
        0.0,
        1.0,
        seed,
    )?)
}

fn run_evaluate(config: ResNetActConfig, args: &EvaluateArgs) -> Result<()> {
    let num_batches = num_batches(args.num_samples, args.batch_size)?;
    let sact = config.act.mode == AdaptationMode::Sact;
    let mut model = ResNetAct::new(config.clone())?;
    let parameters = model.parameter_count()?;
    info!(
        parameters,
        mode = %config.act.mode,
        "model ready"
    );

    if let Some(path) = &args.checkpoint {
        model.load_checkpoint(path)?;
    }
    if let Some(settings) =
        FinetuneSettings::for_module(args.finetune.as_deref(), &model, args.lr_coeff)?
    {
        settings.restore(&mut model)?;
    }

    let mut streaming = StreamingMetrics::new();
    let mut first: Option<EndPoints> = None;
    let mut evaluate = |index: usize| -> ActResult<EndPoints> {
        let images = random_batch(&config, args.batch_size, index)?;
        let output = model.forward_with_end_points(&images)?;
        let mut metrics = act_metric_map(&output.end_points);
        metrics.extend(flops_metric_map(&output.end_points, TOTAL_FLOPS_NAME));
        metrics.insert(
            "ponder_cost".to_string(),
            model.ponder_loss(&output.end_points),
        );
        streaming.update(&metrics);
        if first.is_none() {
            first = Some(output.end_points.clone());
        }
        Ok(output.end_points)
    };

    match &args.export {
        Some(path) => {
            export_evaluation(path, args.num_samples, args.batch_size, sact, &mut evaluate)?;
        }
        None => {
            for index in 0..num_batches {
                info!("Evaluating batch {}/{}", index + 1, num_batches);
                evaluate(index)?;
            }
        }
    }

    print_metrics(&streaming.mean());

    if let (Some(path), Some(end_points)) = (&args.heatmap_out, &first) {
        let summaries = heatmap_summaries(end_points, &HeatmapOptions::default())?;
        write_json(path, &serde_json::to_string(&summaries)?)?;
        info!(path = %path.display(), "heatmaps written");
    }
    if let Some(path) = &args.save_checkpoint {
        model.save_checkpoint(path)?;
    }
    Ok(())
}

fn print_metrics(metrics: &MetricMap) {
    for (name, value) in metrics {
        println!("{name}: {value:.6}");
    }
}

fn write_json(path: &Path, payload: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, payload)
}
