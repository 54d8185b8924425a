use argh::FromArgs;
use std::path::PathBuf;

use detektea::{DetectorConfig, PostProcessor};
use kornia_image::ImageSize;

#[derive(FromArgs)]
/// Replays a saved raw model output and prints the detections
struct Args {
    /// path to a JSON file holding the raw (1, D1, D2) output as nested arrays
    #[argh(option)]
    output_path: PathBuf,

    /// width of the original image
    #[argh(option)]
    width: usize,

    /// height of the original image
    #[argh(option)]
    height: usize,

    /// optional JSON detector configuration, overrides the threshold flags
    #[argh(option)]
    config_path: Option<PathBuf>,

    /// side length of the square model input
    #[argh(option, default = "640")]
    input_resolution: usize,

    /// the confidence threshold for the model
    #[argh(option, default = "0.1")]
    confidence_threshold: f32,

    /// the nms threshold for the model
    #[argh(option, default = "0.5")]
    nms_threshold: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Args = argh::from_env();

    let config: DetectorConfig = match &args.config_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => DetectorConfig {
            input_resolution: args.input_resolution,
            confidence_threshold: args.confidence_threshold,
            iou_threshold: args.nms_threshold,
            ..Default::default()
        },
    };
    let processor = PostProcessor::new(config)?;

    // read the raw output, batch dimension first
    let raw: Vec<Vec<Vec<f32>>> =
        serde_json::from_str(&std::fs::read_to_string(&args.output_path)?)?;
    let [rows] = raw.as_slice() else {
        return Err(format!("expected batch size 1, got {}", raw.len()).into());
    };

    let (detections, stats) = processor.process_rows(
        rows.as_slice(),
        ImageSize {
            width: args.width,
            height: args.height,
        },
    )?;

    eprintln!("{}", serde_json::to_string(&stats)?);
    println!("{}", serde_json::to_string_pretty(&detections)?);

    Ok(())
}
