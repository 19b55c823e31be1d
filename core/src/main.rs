//! CLI entry point for infero-rs.

use anyhow::{bail, Context, Result};
use ndarray::ArrayD;
use std::path::Path;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use infero_rs::cli::{Cli, Commands, ModelArgs};
use infero_rs::config::Config;
use infero_rs::inference::{Infero, NativeRuntime};
use infero_rs::tensor::{self, parse_shape, split_named};

/// Repetitions used by `check` when neither the flag nor the config sets them.
const DEFAULT_CHECK_REPS: usize = 10;

/// Resolve the model, load the library and create a handle.
fn open_model(config: &Config, library: &Path, args: &ModelArgs) -> Result<Infero> {
    let mut spec = config
        .model
        .to_spec(args.model.as_deref(), args.model_type.as_deref())?;
    for param in &args.params {
        let (key, value) = split_named(param)?;
        spec = spec.with_param(key, value);
    }

    info!("Loading model: {} ({})", spec.path().display(), spec.model_type());
    let runtime = NativeRuntime::load(library)?;
    let infero = Infero::new(runtime, spec)?.with_layout(config.inference.layout);
    Ok(infero)
}

fn load_input(path: &Path, shape: Option<&str>) -> Result<ArrayD<f32>> {
    let shape = shape.map(parse_shape).transpose()?;
    info!("Loading input: {}", path.display());
    let input = tensor::load_tensor(path, shape.as_deref())
        .with_context(|| format!("Failed to read input: {}", path.display()))?;
    Ok(input)
}

fn print_json(value: &serde_json::Value, format: &str) -> Result<()> {
    if format == "pretty" {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    let config = if let Some(config_path) = &cli.config {
        Config::from_yaml_file(config_path)
            .with_context(|| format!("Failed to load config: {}", config_path.display()))?
    } else {
        Config::default()
    };
    let library = config.library.resolve(cli.lib.as_deref());

    match cli.command {
        Commands::Infer {
            model,
            input,
            input_shape,
            output_shape,
            output,
        } => {
            let input_tensor = load_input(&input, input_shape.as_deref())?;
            let output_shape = parse_shape(&output_shape)?;

            let mut infero = open_model(&config, &library, &model)?;
            infero.initialise()?;

            info!("Running inference...");
            let result = infero.infer(&input_tensor, &output_shape)?;
            info!("Inference complete: output {:?}", result.shape());
            infero.finalise()?;

            tensor::save_npy(&output, &result)
                .with_context(|| format!("Failed to write output: {}", output.display()))?;
            info!("Output written to {}", output.display());

            println!("all done.");
        }

        Commands::Mimo {
            model,
            inputs,
            outputs,
            output_dir,
        } => {
            let mut named_inputs = Vec::with_capacity(inputs.len());
            for arg in &inputs {
                let (name, path) = split_named(arg)?;
                named_inputs.push((name, load_input(Path::new(path), None)?));
            }
            let mut named_shapes = Vec::with_capacity(outputs.len());
            for arg in &outputs {
                let (name, shape) = split_named(arg)?;
                named_shapes.push((name, parse_shape(shape)?));
            }

            let mut infero = open_model(&config, &library, &model)?;
            infero.initialise()?;

            let input_views: Vec<_> = named_inputs
                .iter()
                .map(|(name, array)| (*name, array.view()))
                .collect();
            let output_shapes: Vec<_> = named_shapes
                .iter()
                .map(|(name, shape)| (*name, shape.as_slice()))
                .collect();

            info!("Running MIMO inference...");
            let results = infero.infer_mimo(&input_views, &output_shapes)?;
            infero.finalise()?;

            std::fs::create_dir_all(&output_dir)?;
            for (name, array) in &results {
                let path = output_dir.join(format!("{}.npy", name));
                tensor::save_npy(&path, array)
                    .with_context(|| format!("Failed to write output: {}", path.display()))?;
                info!("Output '{}' {:?} written to {}", name, array.shape(), path.display());
            }

            println!("all done.");
        }

        Commands::Check {
            model,
            input,
            input_shape,
            reference,
            output_shape,
            batch,
            reps,
            tolerance,
            format,
        } => {
            let reps = reps.unwrap_or(if cli.config.is_some() {
                config.inference.repetitions
            } else {
                DEFAULT_CHECK_REPS
            });
            if reps == 0 {
                bail!("--reps must be at least 1");
            }

            let sample_shape = parse_shape(&output_shape)?;
            let sample = load_input(&input, input_shape.as_deref())?;
            let expected = tensor::load_tensor(&reference, Some(&sample_shape))
                .with_context(|| format!("Failed to read reference: {}", reference.display()))?;

            let (batch_input, batch_expected, batch_shape) = if batch == 1 {
                (sample, expected, sample_shape)
            } else {
                let mut batch_shape = sample_shape;
                batch_shape[0] = batch;
                (
                    tensor::replicate_batch(&sample, batch)?,
                    tensor::replicate_batch(&expected, batch)?,
                    batch_shape,
                )
            };

            let mut infero = open_model(&config, &library, &model)?;
            infero.initialise()?;
            infero.print_config()?;

            let mut result = None;
            for rep in 0..reps {
                info!("Inference repetition {}/{}", rep + 1, reps);
                result = Some(infero.infer(&batch_input, &batch_shape)?);
            }
            let stats = infero.statistics().clone();
            infero.finalise()?;

            let result = result.context("no inference was run")?;
            let diff = tensor::compare(&result, &batch_expected, tolerance)?;

            let summary = serde_json::json!({
                "batch": batch,
                "repetitions": reps,
                "output_shape": result.shape(),
                "mse": diff.mse,
                "max_abs_error": diff.max_abs,
                "mean_latency_ms": stats.mean().map(|d| d.as_secs_f64() * 1e3),
                "passed": diff.within_tolerance(),
            });
            print_json(&summary, &format)?;

            if let Some((index, actual, wanted)) = diff.first_exceeding {
                bail!(
                    "output element {} ({}) is different from expected value {}",
                    index,
                    actual,
                    wanted
                );
            }
        }

        Commands::Info { model } => {
            println!("infero-rs v{}", env!("CARGO_PKG_VERSION"));
            println!("library: {}", library.display());

            let infero = open_model(&config, &library, &model)?;
            let spec = infero.spec();
            println!();
            println!("Model: {}", spec.path().display());
            println!("Type: {}", spec.model_type());
            for (key, value) in spec.params() {
                println!("  {}: {}", key, value);
            }
            infero.print_config()?;
            println!("Status: OK (model loaded successfully)");
        }
    }

    Ok(())
}
