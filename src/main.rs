use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use image::GrayImage;
use log::{info, warn};

use featr::{
    diagnostics::{KeypointCsvSink, MatchCsvSink},
    DescriptorKind, DetectorKind, MatcherKind, Pipeline, PipelineConfig, SelectorKind, StepReport,
};

/// Track 2D features across an image sequence
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single detector/descriptor/matcher configuration
    Run(RunArgs),
    /// Evaluate every detector and descriptor pairing with brute force KNN matching
    Sweep(SweepArgs),
}

#[derive(Args, Debug)]
struct SequenceArgs {
    /// Directory holding the sequence, frames are taken in file name order
    #[arg(long)]
    images: PathBuf,
    /// First frame position to load
    #[arg(long, default_value_t = 0)]
    start: usize,
    /// Last frame position to load, inclusive
    #[arg(long)]
    end: Option<usize>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    sequence: SequenceArgs,
    /// YAML or JSON configuration, flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    detector: Option<DetectorKind>,
    #[arg(long)]
    descriptor: Option<DescriptorKind>,
    #[arg(long)]
    matcher: Option<MatcherKind>,
    #[arg(long)]
    selector: Option<SelectorKind>,
    /// Keep keypoints from the whole image
    #[arg(long)]
    no_roi: bool,
    /// Keep only the strongest N keypoints per frame
    #[arg(long)]
    limit: Option<usize>,
    /// Number of frames held by the window
    #[arg(long)]
    capacity: Option<usize>,
    #[arg(long)]
    keypoints_csv: Option<PathBuf>,
    #[arg(long)]
    matches_csv: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SweepArgs {
    #[command(flatten)]
    sequence: SequenceArgs,
    /// Output directory for the per-combination CSV files
    #[arg(long, default_value = "sweep")]
    out: PathBuf,
    /// Also dump the keypoints of every detector
    #[arg(long)]
    keypoints: bool,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "pgm", "tif", "tiff"];

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Run(args) => run(args),
        Command::Sweep(args) => sweep(args),
    }
}

fn sequence_paths(args: &SequenceArgs) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(&args.images)
        .with_context(|| format!("Failed to read image directory {}", args.images.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        })
        .collect::<Vec<_>>();
    paths.sort();

    let end = args.end.map_or(paths.len(), |end| (end + 1).min(paths.len()));
    if args.start >= end {
        bail!(
            "No frames in range {}..={:?} of {} images in {}",
            args.start,
            args.end,
            paths.len(),
            args.images.display()
        );
    }
    Ok(paths[args.start..end].to_vec())
}

fn load_gray(path: &Path) -> anyhow::Result<GrayImage> {
    let image = image::open(path).with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(image.to_luma8())
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(detector) = args.detector {
        config.detector = detector;
    }
    if let Some(descriptor) = args.descriptor {
        config.descriptor = descriptor;
    }
    if let Some(matcher) = args.matcher {
        config.matcher = matcher;
    }
    if let Some(selector) = args.selector {
        config.selector = selector;
    }
    if args.no_roi {
        config.region = None;
    }
    if args.limit.is_some() {
        config.keypoint_limit = args.limit;
    }
    if let Some(capacity) = args.capacity {
        config.window_capacity = capacity;
    }

    let mut pipeline = Pipeline::new(config)?;
    if let Some(path) = &args.keypoints_csv {
        pipeline = pipeline.with_sink(Box::new(KeypointCsvSink::create(path)?));
    }
    if let Some(path) = &args.matches_csv {
        pipeline = pipeline.with_sink(Box::new(MatchCsvSink::create(path)?));
    }

    let config = pipeline.config();
    info!(
        "{} detector, {} descriptor, {} matcher, {} selector",
        config.detector, config.descriptor, config.matcher, config.selector
    );

    let mut reports = Vec::new();
    for path in sequence_paths(&args.sequence)? {
        let report = pipeline.process(load_gray(&path)?)?;
        info!(
            "#{} {}: {} keypoints, {} descriptors{}",
            report.frame_index,
            path.display(),
            report.keypoints_retained,
            report.descriptor_rows,
            report.matches.map(|n| format!(", {n} matches")).unwrap_or_default()
        );
        reports.push(report);
    }
    pipeline.flush_sinks();

    summarize(&reports);
    Ok(())
}

fn sweep(args: SweepArgs) -> anyhow::Result<()> {
    let images = sequence_paths(&args.sequence)?
        .iter()
        .map(|path| load_gray(path))
        .collect::<anyhow::Result<Vec<_>>>()?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("Failed to create output directory {}", args.out.display()))?;

    for &detector in DetectorKind::ALL {
        for (i, &descriptor) in DescriptorKind::ALL.iter().enumerate() {
            let config =
                PipelineConfig::new(detector, descriptor, MatcherKind::BruteForce, SelectorKind::KBestRatio);
            let matches_path = args.out.join(format!("{detector}_{descriptor}.csv"));
            let mut pipeline = Pipeline::new(config)?.with_sink(Box::new(MatchCsvSink::create(&matches_path)?));
            if args.keypoints && i == 0 {
                let keypoints_path = args.out.join(format!("{detector}_keypoints.csv"));
                pipeline = pipeline.with_sink(Box::new(KeypointCsvSink::create(&keypoints_path)?));
            }

            info!("{detector} + {descriptor}");
            match pipeline.run(images.iter().cloned()) {
                Ok(reports) => summarize(&reports),
                Err(e) => warn!("{detector} + {descriptor} aborted: {e}"),
            }
        }
    }
    Ok(())
}

fn summarize(reports: &[StepReport]) {
    let Some(last) = reports.last() else {
        return;
    };
    let steps = reports.len() as f64;
    let keypoints = reports.iter().map(|r| r.keypoints_retained).sum::<usize>() as f64 / steps;
    let detect = reports.iter().map(|r| r.timings.detect.as_secs_f64()).sum::<f64>() * 1000.0 / steps;
    let describe = reports.iter().map(|r| r.timings.describe.as_secs_f64()).sum::<f64>() * 1000.0 / steps;
    let matches = reports.iter().filter_map(|r| r.matches).sum::<usize>();

    info!(
        "{} frames up to #{}: {keypoints:.1} keypoints/frame, {matches} matches total, detection {detect:.2} ms, extraction {describe:.2} ms",
        reports.len(),
        last.frame_index
    );
}
