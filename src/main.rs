//! Vision Pipeline CLI
//!
//! Runs one image through object detection, segmentation, face analysis or
//! scene classification and prints the result as JSON.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vision_pipeline::config::Config;
use vision_pipeline::engine::registry;
use vision_pipeline::service::{MatchContext, VisionService};
use vision_pipeline::storage::JsonFileStore;
use vision_pipeline::utils::image::{decode_image, encode_mask_png};

#[derive(Parser)]
#[command(name = "vision-pipeline", version, about)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect objects
    Detect {
        image: PathBuf,
        /// Detector model id (defaults to detection.model)
        #[arg(long)]
        model: Option<String>,
    },
    /// Instance segmentation
    Segment {
        image: PathBuf,
        /// Write one PNG mask per detection into this directory
        #[arg(long)]
        mask_dir: Option<PathBuf>,
    },
    /// Detect faces and match them against a gallery
    Faces {
        image: PathBuf,
        /// JSON descriptor gallery
        #[arg(long)]
        gallery: Option<PathBuf>,
        /// portrait, action, podium or auto
        #[arg(long, default_value = "auto")]
        context: MatchContext,
        /// Skip embedding and matching
        #[arg(long)]
        detect_only: bool,
        /// Include embedding vectors in the output
        #[arg(long)]
        embeddings: bool,
    },
    /// Classify the scene
    Scene { image: PathBuf },
    /// List registered models
    Models,
}

/// An explicit `--config` must load. The implicit `config.toml` may be
/// absent, in which case defaults are used (second value is `true`).
fn load_config(path: Option<&Path>) -> Result<(Config, bool)> {
    match path {
        Some(path) => Ok((Config::load(path)?, false)),
        None => Ok(match Config::load_optional(Config::default_path())? {
            Some(config) => (config, false),
            None => (Config::default(), true),
        }),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_image(path: &Path) -> Result<image::DynamicImage> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(decode_image(&bytes)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, defaulted) = load_config(cli.config.as_deref())?;

    // Initialize logging
    let level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if defaulted {
        info!("No {} found, using default config", Config::default_path());
    }
    info!("Vision pipeline v{} on {}", env!("CARGO_PKG_VERSION"), config.inference.device);

    let build = || VisionService::from_config(config.clone());

    match cli.command {
        Command::Detect { image, model } => {
            let service = build()?;
            let model_id = model.unwrap_or_else(|| config.detection.model.clone());
            service.initialize(&[model_id.as_str()]).await?;
            let image = read_image(&image).await?;
            print_json(&service.detect_objects(&image, Some(model_id.as_str())).await?)?;
        }
        Command::Segment { image, mask_dir } => {
            let service = build()?;
            service.initialize(&[config.detection.segmentation_model.as_str()]).await?;
            let image = read_image(&image).await?;
            let result = service.segment(&image).await?;

            if let Some(dir) = mask_dir {
                tokio::fs::create_dir_all(&dir).await?;
                for detection in &result.detections {
                    if let Some(mask) = &detection.mask {
                        let png = encode_mask_png(mask.width, mask.height, &mask.data)?;
                        let path = dir.join(format!("{}.png", detection.id));
                        tokio::fs::write(&path, png).await?;
                        info!("Saved {} mask to {}", detection.class_name, path.display());
                    }
                }
            }
            print_json(&result)?;
        }
        Command::Faces {
            image,
            gallery,
            context,
            detect_only,
            embeddings,
        } => {
            let mut service = build()?;
            let image = read_image(&image).await?;
            if detect_only {
                service.initialize(&[config.faces.detector.as_str()]).await?;
                print_json(&service.detect_faces(&image).await?)?;
            } else {
                service
                    .initialize(&[config.faces.detector.as_str(), config.faces.embedder.as_str()])
                    .await?;
                if let Some(path) = gallery {
                    let count = service.load_gallery(&JsonFileStore::new(path)).await?;
                    info!("Gallery ready with {} identities", count);
                }
                let mut result = service.analyze_faces(&image, context).await?;
                if !embeddings {
                    for face in &mut result.faces {
                        face.embedding = None;
                    }
                }
                print_json(&result)?;
            }
        }
        Command::Scene { image } => {
            let service = build()?;
            service.initialize(&[registry::SCENE_CLASSIFIER]).await?;
            let image = read_image(&image).await?;
            print_json(&service.classify_scene(&image).await?)?;
        }
        Command::Models => {
            let table: Vec<_> = registry::all_configs()
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "model_id": m.id,
                        "family": m.family,
                        "input_size": [m.input_size.0, m.input_size.1],
                        "path": config.models.path_for(m),
                    })
                })
                .collect();
            print_json(&table)?;
        }
    }

    Ok(())
}
