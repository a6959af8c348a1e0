//! Background worker that polls the decode layer for finished tiles and
//! hands ready batches to the presentation thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use engine::{CancelToken, PollingThreadChannels};
use model::TileTable;
use protocol::CompletionReason;
use thiserror::Error;

mod decoder;
mod scheduler;

pub use decoder::{DecodeError, TileDecoder};
pub use scheduler::{PassOutcome, TileScheduler};

#[derive(Debug, Error)]
pub enum SchedulerStartError {
    #[error("tile table is empty")]
    EmptyTileTable,
    #[error("failed to spawn tile polling thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Pause after a pass in which no tile became ready. Zero yields instead.
    pub idle_backoff: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_millis(1),
        }
    }
}

/// What the worker did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerReport {
    pub frames_decoded: u64,
    pub last_frame_index: u64,
    pub batches_sent: u64,
    pub completion: CompletionReason,
}

pub struct TileSchedulerRuntime {
    cancel: CancelToken,
    join_handle: Option<JoinHandle<ProducerReport>>,
}

impl TileSchedulerRuntime {
    pub fn start<D: TileDecoder>(
        decoder: D,
        table: Arc<TileTable>,
        channels: PollingThreadChannels,
        config: PollingConfig,
        cancel: CancelToken,
    ) -> Result<Self, SchedulerStartError> {
        if table.is_empty() {
            return Err(SchedulerStartError::EmptyTileTable);
        }
        let worker_cancel = cancel.clone();
        let join_handle = std::thread::Builder::new()
            .name("tile_polling".to_owned())
            .spawn(move || {
                tile_polling_loop(
                    TileScheduler::new(decoder, table),
                    channels,
                    config,
                    worker_cancel,
                )
            })
            .map_err(SchedulerStartError::Spawn)?;
        Ok(Self {
            cancel,
            join_handle: Some(join_handle),
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|join_handle| join_handle.is_finished())
    }

    /// Waits for the worker. Returns `None` once already joined.
    pub fn join(&mut self) -> Option<ProducerReport> {
        let join_handle = self.join_handle.take()?;
        match join_handle.join() {
            Ok(report) => Some(report),
            Err(_) => {
                log::error!(target: "tile_polling", "tile polling thread terminated abnormally");
                None
            }
        }
    }
}

impl Drop for TileSchedulerRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.join();
    }
}

fn tile_polling_loop<D: TileDecoder>(
    mut scheduler: TileScheduler<D>,
    mut channels: PollingThreadChannels,
    config: PollingConfig,
    cancel: CancelToken,
) -> ProducerReport {
    log::info!(target: "tile_polling", "producer started");
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        loop {
            if cancel.is_cancelled() {
                break PassOutcome::Drained(CompletionReason::Cancelled);
            }
            scheduler.forward_field_of_view_hints(&channels.hint_consumer);
            match scheduler.poll_pass(&mut channels.batch_sender, &cancel) {
                PassOutcome::Continue { progressed: true } => {}
                PassOutcome::Continue { progressed: false } => idle(config.idle_backoff),
                stop => break stop,
            }
        }
    }));

    let reason = match outcome {
        Ok(PassOutcome::Drained(reason)) => reason,
        Ok(PassOutcome::Fatal(message)) => {
            log::error!(target: "tile_polling", "protocol violation: {message}");
            CompletionReason::ProtocolViolation(message)
        }
        Ok(PassOutcome::Continue { .. }) => CompletionReason::Cancelled,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            log::error!(target: "tile_polling", "decode layer panicked: {message}");
            CompletionReason::DecodeFailed(format!("decode layer panicked: {message}"))
        }
    };
    let sender = &channels.batch_sender;
    sender.complete(reason.clone());
    let completion = sender.completion_reason().cloned().unwrap_or(reason);
    let report = ProducerReport {
        frames_decoded: scheduler.frames_decoded(),
        last_frame_index: scheduler.frame_index(),
        batches_sent: sender.sent_batches(),
        completion,
    };
    log::info!(
        target: "tile_polling",
        "producer stopped at decode frame {} after {} batches: {}",
        report.last_frame_index,
        report.batches_sent,
        report.completion
    );
    report
}

fn idle(backoff: Duration) {
    if backoff.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(backoff);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use engine::{HandoffRecv, create_thread_channels};
    use model::{GridInfo, GridLayout, StreamHandle, TileHandle, TilePosition};
    use protocol::{PollStatus, TilePayload};

    use super::*;

    /// Every tile is ready on first poll for `frames` frames, then the stream
    /// ends.
    struct FixedLengthDecoder {
        frames: u64,
        panic_at_frame: Option<u64>,
    }

    impl TileDecoder for FixedLengthDecoder {
        fn open_stream(&mut self, _url: &str) -> Result<StreamHandle, DecodeError> {
            Ok(StreamHandle(0))
        }

        fn grid_info(&self, _stream: StreamHandle) -> Result<GridInfo, DecodeError> {
            Ok(GridInfo {
                cols: 2,
                rows: 1,
                frame_width: 8,
                frame_height: 4,
            })
        }

        fn create_tile_stream(
            &mut self,
            _stream: StreamHandle,
            _position: TilePosition,
            sequential_index: u32,
        ) -> Result<TileHandle, DecodeError> {
            Ok(TileHandle(sequential_index as u64))
        }

        fn poll_tile(
            &mut self,
            _handle: TileHandle,
            frame_index: u64,
            _batch_index: u64,
        ) -> Result<PollStatus, DecodeError> {
            if self.panic_at_frame == Some(frame_index) {
                panic!("decoder state corrupted");
            }
            if frame_index >= self.frames {
                return Ok(PollStatus::EndOfStream);
            }
            Ok(PollStatus::Ready(TilePayload::filled(
                16,
                4,
                frame_index as u8,
                127,
                127,
            )))
        }
    }

    fn table() -> Arc<TileTable> {
        let layout = GridLayout::new(GridInfo {
            cols: 2,
            rows: 1,
            frame_width: 8,
            frame_height: 4,
        })
        .expect("layout");
        TileTable::with_sequential_handles(layout)
    }

    fn drain_until_completed(
        receiver: &engine::BatchReceiver,
    ) -> (Vec<protocol::TileBatch>, CompletionReason) {
        let start = Instant::now();
        let mut batches = Vec::new();
        while start.elapsed() < Duration::from_secs(5) {
            match receiver.try_recv() {
                HandoffRecv::Batch(batch) => batches.push(batch),
                HandoffRecv::Empty => std::thread::sleep(Duration::from_millis(1)),
                HandoffRecv::Completed(reason) => return (batches, reason),
            }
        }
        panic!("tile polling worker did not complete in time");
    }

    #[test]
    fn worker_streams_every_frame_then_completes_at_end_of_stream() {
        let (polling, presentation) = create_thread_channels(2, 4);
        let mut runtime = TileSchedulerRuntime::start(
            FixedLengthDecoder {
                frames: 3,
                panic_at_frame: None,
            },
            table(),
            polling,
            PollingConfig::default(),
            CancelToken::new(),
        )
        .expect("start tile polling runtime");

        let (batches, reason) = drain_until_completed(&presentation.batch_receiver);
        assert_eq!(reason, CompletionReason::EndOfStream);
        assert_eq!(
            batches
                .iter()
                .map(|batch| (batch.frame_index, batch.batch_index))
                .collect::<Vec<_>>(),
            vec![(0, 1), (1, 2), (2, 3)]
        );

        let report = runtime.join().expect("producer report");
        assert_eq!(report.frames_decoded, 3);
        assert_eq!(report.batches_sent, 3);
        assert_eq!(report.completion, CompletionReason::EndOfStream);
        assert!(runtime.join().is_none());
    }

    #[test]
    fn cancel_unblocks_a_worker_stuck_on_a_full_channel() {
        let (polling, presentation) = create_thread_channels(1, 4);
        let mut runtime = TileSchedulerRuntime::start(
            FixedLengthDecoder {
                frames: u64::MAX,
                panic_at_frame: None,
            },
            table(),
            polling,
            PollingConfig::default(),
            CancelToken::new(),
        )
        .expect("start tile polling runtime");

        let start = Instant::now();
        while presentation.batch_receiver.is_empty() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        runtime.cancel();
        let report = runtime.join().expect("producer report");
        assert_eq!(report.completion, CompletionReason::Cancelled);
        assert!(report.batches_sent >= 1);
    }

    #[test]
    fn decoder_panic_completes_the_channel_as_decode_failure() {
        let (polling, presentation) = create_thread_channels(4, 4);
        let mut runtime = TileSchedulerRuntime::start(
            FixedLengthDecoder {
                frames: 10,
                panic_at_frame: Some(1),
            },
            table(),
            polling,
            PollingConfig {
                idle_backoff: Duration::ZERO,
            },
            CancelToken::new(),
        )
        .expect("start tile polling runtime");

        let (batches, reason) = drain_until_completed(&presentation.batch_receiver);
        assert_eq!(batches.len(), 1);
        assert!(matches!(reason, CompletionReason::DecodeFailed(_)));
        let report = runtime.join().expect("producer report");
        assert_eq!(report.frames_decoded, 1);
    }
}
