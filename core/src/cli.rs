//! Command-line interface for infero-rs.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

/// Run models through the Infero inference library.
#[derive(Parser, Debug)]
#[command(name = "infero-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to libinferoapi (overrides INFERO_LIB and the config file).
    #[arg(long, global = true)]
    pub lib: Option<PathBuf>,

    /// Path to optional YAML config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: Level,

    #[command(subcommand)]
    pub command: Commands,
}

/// Model selection shared by all commands.
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Path to the model artifact (falls back to `model.path` in the config).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Model type: tflite, onnx, tf_c, trt (guessed from the extension if omitted).
    #[arg(short = 't', long = "type")]
    pub model_type: Option<String>,

    /// Extra backend parameter as KEY=VALUE (repeatable).
    #[arg(short, long = "param")]
    pub params: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single inference and save the output tensor.
    Infer {
        #[command(flatten)]
        model: ModelArgs,

        /// Input tensor (.npy, or CSV with --input-shape).
        #[arg(short, long)]
        input: PathBuf,

        /// Shape of a CSV input, e.g. 1,200,200,17.
        #[arg(long)]
        input_shape: Option<String>,

        /// Declared output shape, e.g. 1,200,200,1.
        #[arg(short = 's', long)]
        output_shape: String,

        /// Where to write the output tensor.
        #[arg(short, long, default_value = "output.npy")]
        output: PathBuf,
    },

    /// Run multi-input multi-output inference with named tensors.
    Mimo {
        #[command(flatten)]
        model: ModelArgs,

        /// Named input as NAME=PATH.npy (repeatable).
        #[arg(short, long = "input", required = true)]
        inputs: Vec<String>,

        /// Named output shape as NAME=SHAPE, e.g. dense_6=1,1 (repeatable).
        #[arg(short, long = "output", required = true)]
        outputs: Vec<String>,

        /// Directory for the NAME.npy output files.
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Run repeated inference on a batch and compare against a reference.
    Check {
        #[command(flatten)]
        model: ModelArgs,

        /// Single-sample input tensor (.npy, or CSV with --input-shape).
        #[arg(short, long)]
        input: PathBuf,

        /// Shape of a CSV input sample, e.g. 1,200,200,17.
        #[arg(long)]
        input_shape: Option<String>,

        /// Single-sample reference output (.npy or CSV).
        #[arg(short, long)]
        reference: PathBuf,

        /// Output shape of one sample, e.g. 1,200,200,1.
        #[arg(short = 's', long)]
        output_shape: String,

        /// Number of copies of the sample in the batch.
        #[arg(short, long, default_value_t = 1)]
        batch: usize,

        /// Inference repetitions (defaults to the config, else 10).
        #[arg(long)]
        reps: Option<usize>,

        /// Absolute tolerance per element.
        #[arg(long, default_value_t = 1e-3)]
        tolerance: f32,

        /// Output format (json, pretty).
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Load a model and print library and model configuration.
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_infer() {
        let cli = Cli::try_parse_from([
            "infero-rs",
            "infer",
            "-m",
            "cyclone_model_200x200.tflite",
            "-t",
            "tflite",
            "-i",
            "cyclone_input_200x200.npy",
            "-s",
            "1,200,200,1",
        ])
        .unwrap();

        assert_eq!(cli.log_level, Level::INFO);
        match cli.command {
            Commands::Infer {
                model,
                output_shape,
                output,
                ..
            } => {
                assert_eq!(model.model_type.as_deref(), Some("tflite"));
                assert_eq!(output_shape, "1,200,200,1");
                assert_eq!(output, PathBuf::from("output.npy"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_mimo_repeated() {
        let cli = Cli::try_parse_from([
            "infero-rs",
            "--lib",
            "/opt/lib/libinferoapi.so",
            "mimo",
            "-m",
            "mimo_model.tflite",
            "-i",
            "input_1=a.npy",
            "-i",
            "input_2=b.npy",
            "-o",
            "dense_6=1,1",
        ])
        .unwrap();

        assert_eq!(cli.lib, Some(PathBuf::from("/opt/lib/libinferoapi.so")));
        match cli.command {
            Commands::Mimo {
                inputs, outputs, ..
            } => {
                assert_eq!(inputs, vec!["input_1=a.npy", "input_2=b.npy"]);
                assert_eq!(outputs, vec!["dense_6=1,1"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
