use std::path::PathBuf;

use clap::Parser;
use receipt_craft::{
    adjust_result_coordinates, mock_det_boxes, settings::load_settings, util::resize_params,
    Backend, CraftBuilder, DetectionResult, Error,
};
use serde::Serialize;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Debug, Parser)]
#[command(about = "Detect text regions in a receipt image")]
struct Cli {
    /// Receipt image to scan.
    image: PathBuf,
    /// TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Detector weights (`.pth`, `.mpk` or `.onnx`).
    #[arg(long)]
    weights: Option<PathBuf>,
    #[arg(long)]
    backend: Option<Backend>,
    /// Emit placeholder boxes when no detector is available.
    #[arg(long)]
    mock: bool,
}

#[derive(Serialize)]
struct Response {
    method: &'static str,
    detected_regions: usize,
    #[serde(flatten)]
    result: DetectionResult,
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(weights) = cli.weights {
        settings.weights = Some(weights);
    }
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }

    let image = image::open(&cli.image)?;
    let craft = CraftBuilder::from_settings(&settings).build_degraded()?;

    let response = match craft.detect(&image, None) {
        Ok(result) => Response {
            method: "craft_detection",
            detected_regions: result.len(),
            result,
        },
        Err(err) if err.is_model_unavailable() && cli.mock => {
            let params = resize_params(
                image.width(),
                image.height(),
                settings.detection.canvas_size,
                settings.detection.mag_ratio,
            )?;
            let boxes = adjust_result_coordinates(&mock_det_boxes(), params.ratio, params.ratio)?;
            Response {
                method: "mock_fallback",
                detected_regions: boxes.len(),
                result: DetectionResult {
                    polys: boxes.clone(),
                    boxes,
                },
            }
        }
        Err(err) if err.is_model_unavailable() => {
            log::warn!("{err}");
            Response {
                method: "unavailable",
                detected_regions: 0,
                result: DetectionResult::default(),
            }
        }
        Err(err) => return Err(err),
    };

    let json = serde_json::to_string_pretty(&response).map_err(std::io::Error::from)?;
    println!("{json}");
    Ok(())
}
