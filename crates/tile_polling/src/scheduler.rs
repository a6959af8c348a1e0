use std::sync::Arc;

use engine::{BatchSender, CancelToken, FovHintConsumer, HandoffSendError};
use model::TileTable;
use protocol::{BatchTiles, CompletionReason, FieldOfViewHint, PollStatus, ReadyTile, TileBatch};

use crate::decoder::TileDecoder;

const MAX_HINTS_PER_PASS: usize = 64;

/// Result of one polling pass over the pending tiles of the current frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Keep polling. `progressed` is false when no tile became ready.
    Continue { progressed: bool },
    /// The producer stops and completes the channel with this reason.
    Drained(CompletionReason),
    /// Producer/consumer contract broken; the stream must not continue.
    Fatal(String),
}

/// Producer-side polling state: which tiles of which decode frame are still
/// pending, and the monotonic batch counter. Batch indices start at 1; a pass
/// polls with the index its batch will carry.
///
/// Pending tiles are always a suffix of the descriptor table in sequential
/// order, since each pass only reports the ready prefix.
pub struct TileScheduler<D> {
    decoder: D,
    table: Arc<TileTable>,
    frame_index: u64,
    batch_index: u64,
    next_pending: usize,
    frames_decoded: u64,
    hint_scratch: Vec<FieldOfViewHint>,
}

impl<D: TileDecoder> TileScheduler<D> {
    pub fn new(decoder: D, table: Arc<TileTable>) -> Self {
        Self {
            decoder,
            table,
            frame_index: 0,
            batch_index: 1,
            next_pending: 0,
            frames_decoded: 0,
            hint_scratch: Vec::with_capacity(MAX_HINTS_PER_PASS),
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Index the next batch will carry.
    pub fn batch_index(&self) -> u64 {
        self.batch_index
    }

    /// Frames whose every tile was handed off.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn pending_tile_count(&self) -> usize {
        self.table.len() - self.next_pending
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn forward_field_of_view_hints(&mut self, hints: &FovHintConsumer) {
        hints.drain_into(&mut self.hint_scratch, MAX_HINTS_PER_PASS);
        for hint in self.hint_scratch.drain(..) {
            self.decoder.notify_field_of_view(hint);
        }
    }

    /// Polls pending tiles in sequential order, stopping at the first one
    /// that is not ready, and pushes the ready prefix as one batch.
    ///
    /// Blocks while the hand-off channel is full.
    pub fn poll_pass(&mut self, sender: &mut BatchSender, cancel: &CancelToken) -> PassOutcome {
        let mut tiles = BatchTiles::new();
        let mut end_of_stream = false;
        for descriptor in &self.table.descriptors()[self.next_pending..] {
            if cancel.is_cancelled() {
                return PassOutcome::Drained(CompletionReason::Cancelled);
            }
            let status =
                match self
                    .decoder
                    .poll_tile(descriptor.decode_handle, self.frame_index, self.batch_index)
                {
                    Ok(status) => status,
                    Err(err) => {
                        log::error!(target: "tile_polling", "decode layer error: {err}");
                        return PassOutcome::Drained(CompletionReason::DecodeFailed(
                            err.to_string(),
                        ));
                    }
                };
            match status {
                PollStatus::Ready(payload) => tiles.push(ReadyTile {
                    sequential_index: descriptor.sequential_index,
                    payload,
                }),
                PollStatus::Pending => break,
                PollStatus::EndOfStream => {
                    end_of_stream = true;
                    break;
                }
            }
        }

        if end_of_stream {
            if !tiles.is_empty() {
                return PassOutcome::Fatal(format!(
                    "end of stream reported alongside {} ready tiles of frame {}",
                    tiles.len(),
                    self.frame_index
                ));
            }
            return PassOutcome::Drained(CompletionReason::EndOfStream);
        }
        if tiles.is_empty() {
            return PassOutcome::Continue { progressed: false };
        }

        let delivered = tiles.len();
        let batch = TileBatch {
            frame_index: self.frame_index,
            batch_index: self.batch_index,
            tiles,
        };
        match sender.send_blocking(batch, cancel) {
            Ok(()) => {}
            Err(HandoffSendError::Cancelled) => {
                return PassOutcome::Drained(CompletionReason::Cancelled);
            }
            Err(HandoffSendError::Completed) | Err(HandoffSendError::Disconnected) => {
                let reason = sender
                    .completion_reason()
                    .cloned()
                    .unwrap_or(CompletionReason::Cancelled);
                return PassOutcome::Drained(reason);
            }
        }

        self.batch_index += 1;
        self.next_pending += delivered;
        if self.next_pending == self.table.len() {
            log::debug!(
                target: "tile_polling",
                "frame {} fully handed off after batch {}",
                self.frame_index,
                self.batch_index - 1
            );
            self.frame_index += 1;
            self.frames_decoded += 1;
            self.next_pending = 0;
        }
        PassOutcome::Continue { progressed: true }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use engine::{HandoffRecv, create_handoff_channel, create_hint_ring};
    use model::{GridInfo, GridLayout, StreamHandle, TileHandle, TilePosition};
    use protocol::TilePayload;

    use super::*;
    use crate::decoder::DecodeError;

    /// Answers polls from a queue of statuses per tile handle; an exhausted
    /// queue reports `Pending`.
    struct ScriptedDecoder {
        scripts: Vec<VecDeque<Result<PollStatus, DecodeError>>>,
        polls: Vec<(u64, u64, u64)>,
        hints: Vec<FieldOfViewHint>,
        cancel_on_poll: Option<(u64, CancelToken)>,
    }

    impl ScriptedDecoder {
        fn new(tile_count: usize) -> Self {
            Self {
                scripts: vec![VecDeque::new(); tile_count],
                polls: Vec::new(),
                hints: Vec::new(),
                cancel_on_poll: None,
            }
        }

        fn push(&mut self, sequential_index: u32, status: PollStatus) {
            self.scripts[sequential_index as usize - 1].push_back(Ok(status));
        }
    }

    impl TileDecoder for ScriptedDecoder {
        fn open_stream(&mut self, _url: &str) -> Result<StreamHandle, DecodeError> {
            Ok(StreamHandle(1))
        }

        fn grid_info(&self, stream: StreamHandle) -> Result<GridInfo, DecodeError> {
            Err(DecodeError::GridInfo {
                stream,
                message: "not scripted".to_owned(),
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
            handle: TileHandle,
            frame_index: u64,
            batch_index: u64,
        ) -> Result<PollStatus, DecodeError> {
            self.polls.push((handle.0, frame_index, batch_index));
            if let Some((trigger, cancel)) = &self.cancel_on_poll {
                if *trigger == handle.0 {
                    cancel.cancel();
                }
            }
            self.scripts[handle.0 as usize - 1]
                .pop_front()
                .unwrap_or(Ok(PollStatus::Pending))
        }

        fn notify_field_of_view(&mut self, hint: FieldOfViewHint) {
            self.hints.push(hint);
        }
    }

    fn table_2x2() -> Arc<TileTable> {
        let layout = GridLayout::new(GridInfo {
            cols: 2,
            rows: 2,
            frame_width: 8,
            frame_height: 4,
        })
        .expect("layout");
        TileTable::with_sequential_handles(layout)
    }

    fn ready(value: u8) -> PollStatus {
        PollStatus::Ready(TilePayload::filled(8, 2, value, 127, 127))
    }

    fn received_batches(receiver: &engine::BatchReceiver) -> Vec<TileBatch> {
        let mut batches = Vec::new();
        while let HandoffRecv::Batch(batch) = receiver.try_recv() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn all_ready_tiles_form_one_batch_and_advance_the_frame() {
        let mut decoder = ScriptedDecoder::new(4);
        for index in 1..=4 {
            decoder.push(index, ready(index as u8));
        }
        let mut scheduler = TileScheduler::new(decoder, table_2x2());
        let (mut sender, receiver) = create_handoff_channel(4);
        let cancel = CancelToken::new();

        assert_eq!(
            scheduler.poll_pass(&mut sender, &cancel),
            PassOutcome::Continue { progressed: true }
        );
        let batches = received_batches(&receiver);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].frame_index, 0);
        assert_eq!(batches[0].batch_index, 1);
        assert_eq!(
            batches[0].sequential_indices().collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(scheduler.frame_index(), 1);
        assert_eq!(scheduler.frames_decoded(), 1);
        assert_eq!(scheduler.pending_tile_count(), 4);
        // the decode layer sees the index the batch is labelled with
        assert!(scheduler.decoder().polls.iter().all(|&(_, _, batch)| batch == 1));
        assert_eq!(scheduler.batch_index(), 2);
    }

    #[test]
    fn slow_tile_blocks_later_ready_tiles_in_the_same_pass() {
        let mut decoder = ScriptedDecoder::new(4);
        decoder.push(1, ready(1));
        decoder.push(2, PollStatus::Pending);
        decoder.push(2, ready(2));
        decoder.push(3, ready(3));
        decoder.push(4, ready(4));
        let mut scheduler = TileScheduler::new(decoder, table_2x2());
        let (mut sender, receiver) = create_handoff_channel(4);
        let cancel = CancelToken::new();

        scheduler.poll_pass(&mut sender, &cancel);
        scheduler.poll_pass(&mut sender, &cancel);

        let batches = received_batches(&receiver);
        let indices: Vec<Vec<u32>> = batches
            .iter()
            .map(|batch| batch.sequential_indices().collect())
            .collect();
        assert_eq!(indices, vec![vec![1], vec![2, 3, 4]]);
        assert_eq!(batches[1].batch_index, 2);
        // tiles 3 and 4 were never polled during the first pass
        assert_eq!(
            scheduler.decoder().polls,
            vec![(1, 0, 1), (2, 0, 1), (2, 0, 2), (3, 0, 2), (4, 0, 2)]
        );
    }

    #[test]
    fn empty_pass_reports_no_progress() {
        let mut scheduler = TileScheduler::new(ScriptedDecoder::new(4), table_2x2());
        let (mut sender, receiver) = create_handoff_channel(4);
        assert_eq!(
            scheduler.poll_pass(&mut sender, &CancelToken::new()),
            PassOutcome::Continue { progressed: false }
        );
        assert!(receiver.is_empty());
        assert_eq!(scheduler.batch_index(), 1);
    }

    #[test]
    fn immediate_end_of_stream_drains_without_batches() {
        let mut decoder = ScriptedDecoder::new(4);
        decoder.push(1, PollStatus::EndOfStream);
        let mut scheduler = TileScheduler::new(decoder, table_2x2());
        let (mut sender, receiver) = create_handoff_channel(4);

        assert_eq!(
            scheduler.poll_pass(&mut sender, &CancelToken::new()),
            PassOutcome::Drained(CompletionReason::EndOfStream)
        );
        assert!(receiver.is_empty());
        assert_eq!(sender.sent_batches(), 0);
    }

    #[test]
    fn end_of_stream_after_ready_tiles_is_fatal() {
        let mut decoder = ScriptedDecoder::new(4);
        decoder.push(1, ready(1));
        decoder.push(2, PollStatus::EndOfStream);
        let mut scheduler = TileScheduler::new(decoder, table_2x2());
        let (mut sender, receiver) = create_handoff_channel(4);

        assert!(matches!(
            scheduler.poll_pass(&mut sender, &CancelToken::new()),
            PassOutcome::Fatal(_)
        ));
        assert!(receiver.is_empty());
    }

    #[test]
    fn decode_error_drains_as_decode_failure() {
        let mut decoder = ScriptedDecoder::new(4);
        decoder.scripts[0].push_back(Err(DecodeError::Poll {
            handle: TileHandle(1),
            frame_index: 0,
            message: "socket closed".to_owned(),
        }));
        let mut scheduler = TileScheduler::new(decoder, table_2x2());
        let (mut sender, _receiver) = create_handoff_channel(4);

        match scheduler.poll_pass(&mut sender, &CancelToken::new()) {
            PassOutcome::Drained(CompletionReason::DecodeFailed(message)) => {
                assert!(message.contains("socket closed"));
            }
            other => panic!("expected decode failure, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_mid_pass_discards_the_partial_batch() {
        let cancel = CancelToken::new();
        let mut decoder = ScriptedDecoder::new(4);
        for index in 1..=4 {
            decoder.push(index, ready(index as u8));
        }
        decoder.cancel_on_poll = Some((2, cancel.clone()));
        let mut scheduler = TileScheduler::new(decoder, table_2x2());
        let (mut sender, receiver) = create_handoff_channel(4);

        assert_eq!(
            scheduler.poll_pass(&mut sender, &cancel),
            PassOutcome::Drained(CompletionReason::Cancelled)
        );
        assert!(receiver.is_empty());
        assert_eq!(scheduler.decoder().polls.len(), 2);
    }

    #[test]
    fn cancelled_token_stops_before_polling() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut scheduler = TileScheduler::new(ScriptedDecoder::new(4), table_2x2());
        let (mut sender, _receiver) = create_handoff_channel(4);
        assert_eq!(
            scheduler.poll_pass(&mut sender, &cancel),
            PassOutcome::Drained(CompletionReason::Cancelled)
        );
        assert!(scheduler.decoder().polls.is_empty());
    }

    #[test]
    fn completed_channel_stops_the_pass_with_its_reason() {
        let mut decoder = ScriptedDecoder::new(4);
        decoder.push(1, ready(1));
        let mut scheduler = TileScheduler::new(decoder, table_2x2());
        let (mut sender, receiver) = create_handoff_channel(4);
        receiver.complete(CompletionReason::Cancelled);

        assert_eq!(
            scheduler.poll_pass(&mut sender, &CancelToken::new()),
            PassOutcome::Drained(CompletionReason::Cancelled)
        );
    }

    #[test]
    fn field_of_view_hints_reach_the_decoder() {
        let mut scheduler = TileScheduler::new(ScriptedDecoder::new(4), table_2x2());
        let (hint_producer, hint_consumer) = create_hint_ring(4);
        hint_producer.push(FieldOfViewHint { col: 1, row: 0 });
        hint_producer.push(FieldOfViewHint { col: 0, row: 1 });

        scheduler.forward_field_of_view_hints(&hint_consumer);
        assert_eq!(
            scheduler.decoder().hints,
            vec![
                FieldOfViewHint { col: 1, row: 0 },
                FieldOfViewHint { col: 0, row: 1 },
            ]
        );
    }
}
