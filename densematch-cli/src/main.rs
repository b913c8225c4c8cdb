use clap::Parser;
use densematch::io::load_gray_image;
use densematch::{
    DenseMatcher, ImageBatch, Match, MatchOptions, MatcherConfig, OwnedImage, PatchBackbone,
    StateDict,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const EXAMPLE_JSON: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.json"));

#[derive(Parser, Debug)]
#[command(author, version, about = "DenseMatch CLI (JSON config driven)")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,
    /// Print an example config and exit.
    #[arg(long)]
    print_example: bool,
    /// Enable tracing output for the pipeline stages.
    #[arg(long)]
    trace: bool,
}

fn default_gain() -> f32 {
    8.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    image0_path: String,
    image1_path: String,
    #[serde(default)]
    output_path: Option<String>,
    /// JSON state dictionary; random weights are used when absent.
    #[serde(default)]
    weights_path: Option<String>,
    #[serde(default)]
    seed: u64,
    #[serde(default = "default_gain")]
    gain: f32,
    matcher: MatcherConfig,
}

#[derive(Debug, Serialize)]
struct Output {
    image0: [usize; 2],
    image1: [usize; 2],
    count: usize,
    matches: Vec<Match>,
}

/// Pads `image` to the next multiple of `multiple` in both directions.
fn to_batch(image: &OwnedImage, multiple: usize) -> densematch::DenseMatchResult<ImageBatch> {
    let height = image.height().div_ceil(multiple) * multiple;
    let width = image.width().div_ceil(multiple) * multiple;
    ImageBatch::padded(&[image.view()], height, width)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive("densematch=info".parse()?),
            )
            .with_target(false)
            .init();
    }

    if cli.print_example {
        println!("{EXAMPLE_JSON}");
        return Ok(());
    }

    let config_text = fs::read_to_string(&cli.config)?;
    let config: Config = serde_json::from_str(&config_text)?;
    if config.image0_path.is_empty() || config.image1_path.is_empty() {
        return Err("image0_path and image1_path must be set in the config".into());
    }
    config.matcher.validate()?;

    let matcher = match &config.weights_path {
        Some(path) => {
            let dict: StateDict = serde_json::from_str(&fs::read_to_string(path)?)?;
            DenseMatcher::from_state_dict(config.matcher.clone(), dict)?
        }
        None => DenseMatcher::with_random_weights(config.matcher.clone(), config.seed)?,
    };
    let backbone = PatchBackbone::new(config.matcher.resolution, config.gain)?;

    let image0 = load_gray_image(&config.image0_path)?;
    let image1 = load_gray_image(&config.image1_path)?;
    let coarse_res = config.matcher.resolution.0;
    let batch0 = to_batch(&image0, coarse_res)?;
    let batch1 = to_batch(&image1, coarse_res)?;

    let output = matcher.match_images(&backbone, &batch0, &batch1, &MatchOptions::default())?;
    let matches: Vec<Match> = output.matches.iter().collect();
    let output = Output {
        image0: [image0.width(), image0.height()],
        image1: [image1.width(), image1.height()],
        count: matches.len(),
        matches,
    };
    let json = serde_json::to_string_pretty(&output)?;

    match config.output_path {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }

    Ok(())
}
