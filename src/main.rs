//! facepipe
//!
//! Offline decoder for raw face detector outputs. Reads a JSON dump of
//! `scores`, `boxes` and optional letterbox `padding`, runs the configured
//! detector preset's anchors, decoding and suppression, and prints the
//! resulting detections as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use facepipe::config::Config;
use facepipe::geometry::transform::remove_letterbox;
use facepipe::geometry::{decode_detections, generate_anchors, non_max_suppression, DecoderOptions, Padding};

/// Raw detector outputs as dumped by a capture tool
#[derive(Debug, Deserialize)]
struct RawDump {
    scores: Vec<f32>,
    boxes: Vec<f32>,
    #[serde(default)]
    padding: Option<Padding>,
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(dump_path) = args.next().map(PathBuf::from) else {
        bail!("usage: facepipe <raw.json> [config.toml]");
    };
    let config_path = args.next().unwrap_or_else(|| Config::default_path().to_string());

    let (config, config_note) = match Config::load(&config_path) {
        Ok(config) => (config, format!("Loaded config from {}", config_path)),
        Err(e) => (Config::default(), format!("Using default config ({:#})", e)),
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("facepipe v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", config_note);

    let raw = std::fs::read_to_string(&dump_path)
        .with_context(|| format!("failed to read {}", dump_path.display()))?;
    let dump: RawDump =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", dump_path.display()))?;

    let model = config.detection.model;
    let side = model.input_size();
    let anchors = generate_anchors(&model.anchor_options()).context("failed to generate anchors")?;
    info!("  Model: {} ({}x{}, {} anchors)", model.as_str(), side, side, anchors.len() / 2);

    let decoded = decode_detections(
        &dump.scores,
        &dump.boxes,
        &anchors,
        &DecoderOptions::for_input(side, side),
    )
    .context("failed to decode detector outputs")?;

    let nms = config.nms_options();
    let kept = non_max_suppression(decoded, &nms);
    let padding = dump.padding.unwrap_or_default();
    let detections = remove_letterbox(&kept, &padding, true);
    info!("  Detections: {}", detections.len());

    println!("{}", serde_json::to_string_pretty(&detections)?);
    Ok(())
}
