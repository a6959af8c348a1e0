//! Presentation side of the tiled panorama player: stream open, per-tick
//! frame assembly and pacing, and buffer release handling.

pub mod config;
pub mod pipeline;
pub mod synthetic;
pub mod trace;

pub use config::{ConfigError, PlayerConfig};
pub use pipeline::{PipelineError, PipelineState, PresentedFrame, TickOutcome, TilePipeline};
pub use synthetic::{SyntheticDecoder, SyntheticStream};
