use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use model::GridInfo;
use player::{PlayerConfig, SyntheticDecoder, SyntheticStream, TickOutcome, TilePipeline};
use tiles::FramePlanes;

#[derive(Parser)]
#[command(author, version, about = "Play a tiled panorama stream headlessly")]
struct Arguments {
    /// TOML file with a [playback] table.
    #[arg(long, value_parser)]
    config: Option<PathBuf>,
    /// Stream to open.
    #[arg(long, default_value = "synthetic://panorama")]
    url: String,
    #[arg(long)]
    pool_size: Option<usize>,
    #[arg(long)]
    fps: Option<f64>,
    #[arg(long)]
    jitter_multiplier: Option<f64>,
    /// Write a JSON-lines playback trace to this file.
    #[arg(long, value_parser)]
    trace: Option<PathBuf>,
    #[arg(long, default_value_t = 4)]
    cols: u32,
    #[arg(long, default_value_t = 2)]
    rows: u32,
    #[arg(long, default_value_t = 3840)]
    width: u32,
    #[arg(long, default_value_t = 1920)]
    height: u32,
    /// Frames in the synthetic stream.
    #[arg(long, default_value_t = 300)]
    frames: u64,
    /// Longest staggered decode delay of a single tile.
    #[arg(long, default_value_t = 20)]
    tile_delay_ms: u64,
}

impl Arguments {
    fn player_config(&self) -> Result<PlayerConfig> {
        let mut config = match &self.config {
            Some(path) => PlayerConfig::load(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => PlayerConfig::default(),
        };
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(fps) = self.fps {
            config.target_fps = fps;
        }
        if let Some(jitter_multiplier) = self.jitter_multiplier {
            config.jitter_multiplier = jitter_multiplier;
        }
        if let Some(trace) = &self.trace {
            config.trace_path = Some(trace.clone());
        }
        config.validate().context("validate playback config")?;
        Ok(config)
    }

    fn synthetic_stream(&self) -> SyntheticStream {
        SyntheticStream {
            grid: GridInfo {
                cols: self.cols,
                rows: self.rows,
                frame_width: self.width,
                frame_height: self.height,
            },
            frames: self.frames,
            max_tile_delay: Duration::from_millis(self.tile_delay_ms),
        }
    }
}

/// Stands in for a display: checksums every presented frame.
#[derive(Default)]
struct HeadlessPresenter {
    frames: u64,
    checksum: u64,
}

impl HeadlessPresenter {
    fn present(&mut self, planes: FramePlanes<'_>) {
        self.frames += 1;
        for plane in [planes.luma, planes.chroma_u, planes.chroma_v] {
            self.checksum = plane.iter().fold(self.checksum, |checksum, &value| {
                checksum.rotate_left(5) ^ u64::from(value)
            });
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let arguments = Arguments::parse();
    let config = arguments.player_config()?;
    let tick_interval = config.pacing().update_span();
    let decoder = SyntheticDecoder::new(arguments.synthetic_stream());
    let mut pipeline = TilePipeline::open(decoder, &arguments.url, config)
        .with_context(|| format!("open stream {}", arguments.url))?;

    let mut presenter = HeadlessPresenter::default();
    let mut last_tick = Instant::now();
    loop {
        let now = Instant::now();
        let delta = now.duration_since(last_tick);
        last_tick = now;
        match pipeline.tick(delta).context("presentation tick")? {
            TickOutcome::Presented(frame) => {
                presenter.present(frame.buffer.planes());
                pipeline
                    .buffer_released(frame.buffer)
                    .context("release presented frame")?;
            }
            TickOutcome::Drained => break,
            TickOutcome::Hold | TickOutcome::Stall | TickOutcome::Paused => {}
        }
        let spent = last_tick.elapsed();
        if spent < tick_interval {
            std::thread::sleep(tick_interval - spent);
        }
    }

    let report = pipeline.stop();
    println!(
        "presented {} frames, jitter {}, checksum {:016x}",
        presenter.frames,
        pipeline.clock().jitter_count(),
        presenter.checksum
    );
    if let Some(report) = report {
        println!(
            "producer decoded {} frames in {} batches, completion: {}",
            report.frames_decoded, report.batches_sent, report.completion
        );
    }
    Ok(())
}
