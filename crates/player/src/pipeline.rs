use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use engine::{
    CancelToken, HandoffRecv, PresentationThreadChannels, ReleaseReceiver, ReleaseSender,
    create_release_queue, create_thread_channels,
};
use frame_scheduler::{FrameUpdate, PacingController, PacingDecision, PacingInput, PlaybackClock};
use model::{GridLayout, GridLayoutError, StreamHandle, TilePosition, TileTable};
use protocol::CompletionReason;
use thiserror::Error;
use tile_polling::{
    DecodeError, ProducerReport, SchedulerStartError, TileDecoder, TileSchedulerRuntime,
};
use tiles::{AssemblyOutcome, FrameBuffer, FrameBufferPool, PoolError, TileAssembler};

use crate::config::{ConfigError, PlayerConfig};
use crate::trace::{PlaybackTracer, TraceEvent};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("decoder reported an unusable tile grid: {0}")]
    Grid(#[from] GridLayoutError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Start(#[from] SchedulerStartError),
    #[error("failed to create playback trace {}: {source}", path.display())]
    Trace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Producer/consumer contract broken. The stream must be reopened.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Drained,
    Failed,
}

/// A buffer that just moved to presenting. Hand it back through
/// [`TilePipeline::buffer_released`] or the release sender once consumed.
#[derive(Debug)]
pub struct PresentedFrame {
    pub buffer: FrameBuffer,
    pub update: FrameUpdate,
}

#[derive(Debug)]
pub enum TickOutcome {
    Presented(PresentedFrame),
    /// A frame is ready but not yet due.
    Hold,
    /// Nothing ready yet; presentation skipped this tick.
    Stall,
    /// Stream finished and every ready frame was presented.
    Drained,
    Paused,
}

/// Foreground half of the tile pipeline, driven once per presentation tick.
///
/// Owns the frame buffer pool, the assembler and the pacing controller; the
/// decoder lives on the `tile_polling` worker and reaches this side only
/// through the hand-off channel.
pub struct TilePipeline {
    config: PlayerConfig,
    stream: StreamHandle,
    table: Arc<TileTable>,
    pool: FrameBufferPool,
    assembler: TileAssembler,
    pacing: PacingController,
    channels: PresentationThreadChannels,
    release_sender: Option<ReleaseSender<FrameBuffer>>,
    release_receiver: ReleaseReceiver<FrameBuffer>,
    cancel: CancelToken,
    runtime: TileSchedulerRuntime,
    tracer: PlaybackTracer,
    state: PipelineState,
    failure: Option<String>,
    playing: bool,
    stopped: bool,
    producer_report: Option<ProducerReport>,
}

impl TilePipeline {
    pub fn open<D: TileDecoder>(
        mut decoder: D,
        url: &str,
        config: PlayerConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let pacing = PacingController::new(config.pacing()).map_err(ConfigError::from)?;

        let stream = decoder.open_stream(url)?;
        let layout = GridLayout::new(decoder.grid_info(stream)?)?;
        log::info!(
            target: "pipeline",
            "opened {url}: frame {}x{}, grid {}x{}, tile {}x{}",
            layout.frame_width(),
            layout.frame_height(),
            layout.cols(),
            layout.rows(),
            layout.tile_width(),
            layout.tile_height()
        );
        let table = TileTable::build(layout, |position, sequential_index| {
            decoder.create_tile_stream(stream, position, sequential_index)
        })?;
        decoder.prefetch(stream);

        let pool = FrameBufferPool::new(config.pool_size, &layout)?;
        let (polling_channels, channels) =
            create_thread_channels(table.len(), config.fov_hint_capacity);
        let (release_sender, release_receiver) = create_release_queue(config.pool_size);
        let mut tracer = match &config.trace_path {
            Some(path) => PlaybackTracer::create(path).map_err(|source| PipelineError::Trace {
                path: path.clone(),
                source,
            })?,
            None => PlaybackTracer::disabled(),
        };

        let cancel = CancelToken::new();
        let runtime = TileSchedulerRuntime::start(
            decoder,
            Arc::clone(&table),
            polling_channels,
            config.polling(),
            cancel.clone(),
        )?;
        tracer.record(&TraceEvent::Start {
            cols: layout.cols(),
            rows: layout.rows(),
            frame_width: layout.frame_width(),
            frame_height: layout.frame_height(),
            pool_size: config.pool_size,
        });

        Ok(Self {
            assembler: TileAssembler::new(Arc::clone(&table)),
            config,
            stream,
            table,
            pool,
            pacing,
            channels,
            release_sender: Some(release_sender),
            release_receiver,
            cancel,
            runtime,
            tracer,
            state: PipelineState::Running,
            failure: None,
            playing: true,
            stopped: false,
            producer_report: None,
        })
    }

    /// Runs one presentation tick. `delta` is the time since the previous
    /// tick and advances the playback clock even while paused.
    pub fn tick(&mut self, delta: Duration) -> Result<TickOutcome, PipelineError> {
        if let Some(message) = &self.failure {
            return Err(PipelineError::ProtocolViolation(message.clone()));
        }
        if self.state == PipelineState::Drained {
            return Ok(TickOutcome::Drained);
        }
        self.pacing.advance(delta);
        if let Err(err) = self.drain_release_queue() {
            return Err(self.fail(err.to_string()));
        }
        if !self.playing {
            return Ok(TickOutcome::Paused);
        }
        if let Err(message) = self.drain_ready_batches() {
            return Err(self.fail(message));
        }

        let decision = self.pacing.on_tick(PacingInput {
            ready_available: self.pool.has_ready(),
            stream_drained: self.channels.batch_receiver.is_completed(),
        });
        let outcome = match decision {
            PacingDecision::Present(update) => {
                let buffer = match self.pool.dequeue_ready() {
                    Ok(buffer) => buffer,
                    Err(err) => return Err(self.fail(err.to_string())),
                };
                self.tracer.record(&TraceEvent::FrameUpdate {
                    frame: update.index,
                    jitter: update.jitter,
                    delta_secs: update.delta.as_secs_f64(),
                });
                TickOutcome::Presented(PresentedFrame { buffer, update })
            }
            PacingDecision::Hold => TickOutcome::Hold,
            PacingDecision::Stall => TickOutcome::Stall,
            PacingDecision::Drained => {
                if let Some(CompletionReason::ProtocolViolation(message)) =
                    self.channels.batch_receiver.completion_reason()
                {
                    let message = message.clone();
                    return Err(self.fail(message));
                }
                self.state = PipelineState::Drained;
                let presented = self.presented_frames();
                log::info!(target: "pipeline", "stream drained after {presented} presented frames");
                self.tracer.record(&TraceEvent::Drained { presented });
                self.tracer.flush();
                TickOutcome::Drained
            }
        };

        if let Some(report) = self.pacing.throughput_report(self.config.stats_log_interval()) {
            log::info!(
                target: "pipeline",
                "presented frame {} fps {:.2} jitter {}",
                report.frame_update_index,
                report.fps,
                report.jitter_count
            );
        }
        Ok(outcome)
    }

    /// Returns a presented buffer to the pool from the presentation thread.
    pub fn buffer_released(&mut self, buffer: FrameBuffer) -> Result<(), PipelineError> {
        if let Err(err) = self.pool.return_from_presenting(buffer) {
            return Err(self.fail(err.to_string()));
        }
        Ok(())
    }

    /// Sender for presenters that finish with buffers on another thread.
    /// Released buffers are picked up at the start of the next tick.
    pub fn take_release_sender(&mut self) -> Option<ReleaseSender<FrameBuffer>> {
        self.release_sender.take()
    }

    pub fn set_playing(&mut self, playing: bool) {
        if self.playing != playing {
            log::info!(target: "pipeline", "playback {}", if playing { "resumed" } else { "paused" });
        }
        self.playing = playing;
    }

    pub fn toggle_playing(&mut self) -> bool {
        self.set_playing(!self.playing);
        self.playing
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Forwards a viewing-direction hint to the decode layer. Positions
    /// outside the grid are dropped.
    pub fn notify_field_of_view(&self, col: u32, row: u32) -> bool {
        let position = TilePosition::new(col, row);
        if !self.table.layout().contains(position) {
            log::warn!(target: "pipeline", "ignoring field of view hint outside the grid: ({col}, {row})");
            return false;
        }
        self.channels.hint_producer.push(position.into());
        true
    }

    pub fn pushed_hints(&self) -> u64 {
        self.channels.hint_producer.pushed_hints()
    }

    pub fn dropped_hints(&self) -> u64 {
        self.channels.hint_producer.dropped_hints()
    }

    /// Cancels the producer, completes the hand-off channel and joins the
    /// worker. Safe to call more than once.
    pub fn stop(&mut self) -> Option<ProducerReport> {
        if self.stopped {
            return self.producer_report.clone();
        }
        self.stopped = true;
        self.cancel.cancel();
        self.channels
            .batch_receiver
            .complete(CompletionReason::Cancelled);
        self.producer_report = self.runtime.join();
        log::info!(
            target: "pipeline",
            "stopped after {} presented frames",
            self.presented_frames()
        );
        if let Some(report) = &self.producer_report {
            log::info!(
                target: "pipeline",
                "producer decoded {} frames in {} batches ({})",
                report.frames_decoded,
                report.batches_sent,
                report.completion
            );
        }
        self.tracer.flush();
        self.producer_report.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn layout(&self) -> &GridLayout {
        self.table.layout()
    }

    pub fn pool(&self) -> &FrameBufferPool {
        &self.pool
    }

    pub fn clock(&self) -> &PlaybackClock {
        self.pacing.clock()
    }

    pub fn presented_frames(&self) -> u64 {
        self.pacing.clock().frame_update_index()
    }

    pub fn completion_reason(&self) -> Option<&CompletionReason> {
        self.channels.batch_receiver.completion_reason()
    }

    pub fn producer_report(&self) -> Option<&ProducerReport> {
        self.producer_report.as_ref()
    }

    fn drain_release_queue(&mut self) -> Result<(), PoolError> {
        while let Some(buffer) = self.release_receiver.pop() {
            self.pool.return_from_presenting(buffer)?;
        }
        Ok(())
    }

    /// Applies up to `drain_attempts_per_tick` batches to the preparing
    /// buffer, stopping as soon as it becomes ready.
    fn drain_ready_batches(&mut self) -> Result<(), String> {
        if !self.pool.can_prepare() {
            return Ok(());
        }
        for _ in 0..self.config.drain_attempts_per_tick {
            match self.channels.batch_receiver.try_recv() {
                HandoffRecv::Batch(batch) => {
                    match self.assembler.assemble(&mut self.pool, &batch) {
                        Ok(AssemblyOutcome::Partial { .. }) => {}
                        Ok(AssemblyOutcome::FrameReady { buffer, frame_index }) => {
                            let ready_index = self.pacing.record_ready();
                            log::debug!(
                                target: "pipeline",
                                "decode frame {frame_index} ready in {buffer:?}"
                            );
                            self.tracer
                                .record(&TraceEvent::FrameReady { frame: ready_index });
                            break;
                        }
                        Err(err) => return Err(err.to_string()),
                    }
                }
                HandoffRecv::Empty => break,
                HandoffRecv::Completed(CompletionReason::ProtocolViolation(message)) => {
                    return Err(message);
                }
                HandoffRecv::Completed(_) => break,
            }
        }
        Ok(())
    }

    fn fail(&mut self, message: String) -> PipelineError {
        log::error!(target: "pipeline", "playback failed: {message}");
        self.state = PipelineState::Failed;
        self.tracer.record(&TraceEvent::Failed { reason: &message });
        self.tracer.flush();
        self.cancel.cancel();
        self.channels
            .batch_receiver
            .complete(CompletionReason::ProtocolViolation(message.clone()));
        self.failure = Some(message.clone());
        PipelineError::ProtocolViolation(message)
    }
}

impl Drop for TilePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
