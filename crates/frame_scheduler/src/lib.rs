use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum PacingConfigError {
    #[error("target fps must be a finite value above zero (got {0})")]
    InvalidTargetFps(f64),
    #[error("jitter multiplier must be at least 1 (got {0})")]
    InvalidJitterMultiplier(f64),
    #[error("target fps {0} gives an update span too long to represent")]
    UpdateSpanOutOfRange(f64),
    #[error("jitter multiplier {0} gives a jitter span too long to represent")]
    JitterSpanOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingConfig {
    pub target_fps: f64,
    /// Jitter threshold as a multiple of the update span.
    pub jitter_multiplier: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            jitter_multiplier: 3.0,
        }
    }
}

impl PacingConfig {
    pub fn validate(&self) -> Result<(), PacingConfigError> {
        if !self.target_fps.is_finite() || self.target_fps <= 0.0 {
            return Err(PacingConfigError::InvalidTargetFps(self.target_fps));
        }
        if !self.jitter_multiplier.is_finite() || self.jitter_multiplier < 1.0 {
            return Err(PacingConfigError::InvalidJitterMultiplier(
                self.jitter_multiplier,
            ));
        }
        let update_span = self
            .checked_update_span()
            .ok_or(PacingConfigError::UpdateSpanOutOfRange(self.target_fps))?;
        checked_scale(update_span, self.jitter_multiplier)
            .ok_or(PacingConfigError::JitterSpanOutOfRange(self.jitter_multiplier))?;
        Ok(())
    }

    /// Out-of-range values saturate to `Duration::MAX`; `validate` rejects them.
    pub fn update_span(&self) -> Duration {
        self.checked_update_span().unwrap_or(Duration::MAX)
    }

    pub fn jitter_span(&self) -> Duration {
        self.checked_update_span()
            .and_then(|span| checked_scale(span, self.jitter_multiplier))
            .unwrap_or(Duration::MAX)
    }

    fn checked_update_span(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(1.0 / self.target_fps).ok()
    }
}

fn checked_scale(span: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(span.as_secs_f64() * factor).ok()
}

/// One ready -> presenting promotion as seen by the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameUpdate {
    /// Zero-based count of promotions before this one.
    pub index: u64,
    /// Elapsed time since the previous promotion.
    pub delta: Duration,
    pub jitter: bool,
}

/// Presentation-side time bookkeeping. Owned by the pacing controller and
/// mutated only from the presentation tick.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    update_span: Duration,
    jitter_span: Duration,
    elapsed: Duration,
    expected_presentation: Duration,
    last_update_elapsed: Duration,
    frame_update_index: u64,
    frame_ready_index: u64,
    jitter_count: u64,
    last_report_frame_index: u64,
    last_report_elapsed: Duration,
}

impl PlaybackClock {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            update_span: config.update_span(),
            jitter_span: config.jitter_span(),
            elapsed: Duration::ZERO,
            expected_presentation: Duration::ZERO,
            last_update_elapsed: Duration::ZERO,
            frame_update_index: 0,
            frame_ready_index: 0,
            jitter_count: 0,
            last_report_frame_index: 0,
            last_report_elapsed: Duration::ZERO,
        }
    }

    pub fn advance(&mut self, delta: Duration) {
        self.elapsed = self.elapsed.saturating_add(delta);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn expected_presentation(&self) -> Duration {
        self.expected_presentation
    }

    /// Frames promoted to presenting so far.
    pub fn frame_update_index(&self) -> u64 {
        self.frame_update_index
    }

    /// Frames that finished assembly so far.
    pub fn frame_ready_index(&self) -> u64 {
        self.frame_ready_index
    }

    pub fn jitter_count(&self) -> u64 {
        self.jitter_count
    }

    pub fn is_due(&self) -> bool {
        self.elapsed > self.expected_presentation
    }

    pub fn record_ready(&mut self) -> u64 {
        let index = self.frame_ready_index;
        self.frame_ready_index += 1;
        index
    }

    pub fn record_update(&mut self) -> FrameUpdate {
        let index = self.frame_update_index;
        let delta = self.elapsed.saturating_sub(self.last_update_elapsed);
        let jitter = if index == 0 {
            self.expected_presentation = self.elapsed;
            false
        } else {
            delta > self.jitter_span
        };
        if jitter {
            self.jitter_count += 1;
        }
        self.last_update_elapsed = self.elapsed;
        self.expected_presentation = self.expected_presentation.saturating_add(self.update_span);
        self.frame_update_index += 1;
        FrameUpdate {
            index,
            delta,
            jitter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingInput {
    pub ready_available: bool,
    pub stream_drained: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// Promote the head of the ready queue.
    Present(FrameUpdate),
    /// A frame is ready but its presentation time has not come yet.
    Hold,
    /// Nothing ready and more may still arrive.
    Stall,
    /// Nothing ready and nothing more will arrive.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    pub frame_update_index: u64,
    pub fps: f64,
    pub jitter_count: u64,
}

#[derive(Debug, Clone)]
pub struct PacingController {
    config: PacingConfig,
    clock: PlaybackClock,
}

impl PacingController {
    pub fn new(config: PacingConfig) -> Result<Self, PacingConfigError> {
        config.validate()?;
        Ok(Self {
            clock: PlaybackClock::new(&config),
            config,
        })
    }

    pub fn config(&self) -> PacingConfig {
        self.config
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn advance(&mut self, delta: Duration) {
        self.clock.advance(delta);
    }

    pub fn record_ready(&mut self) -> u64 {
        self.clock.record_ready()
    }

    pub fn on_tick(&mut self, input: PacingInput) -> PacingDecision {
        if !input.ready_available {
            return if input.stream_drained {
                PacingDecision::Drained
            } else {
                PacingDecision::Stall
            };
        }
        if !self.clock.is_due() {
            return PacingDecision::Hold;
        }
        let update = self.clock.record_update();
        if update.jitter {
            log::debug!(
                target: "pacing",
                "frame {} late by {:?} (jitter {})",
                update.index,
                update.delta,
                self.clock.jitter_count
            );
        }
        PacingDecision::Present(update)
    }

    /// Returns a report at most once per `interval` of elapsed playback time.
    pub fn throughput_report(&mut self, interval: Duration) -> Option<ThroughputReport> {
        let clock = &mut self.clock;
        let since = clock.elapsed.saturating_sub(clock.last_report_elapsed);
        if since.is_zero() || since < interval {
            return None;
        }
        let frames = clock.frame_update_index - clock.last_report_frame_index;
        let report = ThroughputReport {
            frame_update_index: clock.frame_update_index,
            fps: frames as f64 / since.as_secs_f64(),
            jitter_count: clock.jitter_count,
        };
        clock.last_report_frame_index = clock.frame_update_index;
        clock.last_report_elapsed = clock.elapsed;
        Some(report)
    }
}
