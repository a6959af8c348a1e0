use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, bounded};
use crossbeam_queue::ArrayQueue;
use protocol::{CompletionReason, FieldOfViewHint, TileBatch};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use thiserror::Error;

/// How long a blocked producer waits on a full channel before re-checking
/// cancellation and completion.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Cooperative cancellation flag shared between the presentation thread and
/// the polling worker. Nothing is ever aborted; the worker observes the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffSendError {
    #[error("hand-off send abandoned: cancellation requested")]
    Cancelled,
    #[error("hand-off send abandoned: channel already marked complete")]
    Completed,
    #[error("hand-off receiver disconnected")]
    Disconnected,
}

#[derive(Debug)]
struct HandoffShared {
    // first reason wins; never reset
    completion: OnceLock<CompletionReason>,
}

impl HandoffShared {
    fn complete(&self, reason: CompletionReason) -> bool {
        self.completion.set(reason).is_ok()
    }
}

/// Producer half of the bounded batch hand-off channel.
#[derive(Debug)]
pub struct BatchSender {
    sender: Sender<TileBatch>,
    shared: Arc<HandoffShared>,
    sent: u64,
}

impl BatchSender {
    /// Pushes a batch, blocking while the channel is full. This is the
    /// producer's backpressure point; it gives up only on cancellation,
    /// completion or a vanished receiver.
    pub fn send_blocking(
        &mut self,
        batch: TileBatch,
        cancel: &CancelToken,
    ) -> Result<(), HandoffSendError> {
        let mut pending_batch = batch;
        loop {
            if cancel.is_cancelled() {
                return Err(HandoffSendError::Cancelled);
            }
            if self.shared.completion.get().is_some() {
                return Err(HandoffSendError::Completed);
            }
            match self.sender.send_timeout(pending_batch, SEND_RETRY_INTERVAL) {
                Ok(()) => {
                    self.sent += 1;
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(returned_batch)) => {
                    pending_batch = returned_batch;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(HandoffSendError::Disconnected);
                }
            }
        }
    }

    /// Marks the channel complete: no further batches will be sent.
    /// Returns false if it was already complete.
    pub fn complete(&self, reason: CompletionReason) -> bool {
        self.shared.complete(reason)
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completion.get().is_some()
    }

    pub fn completion_reason(&self) -> Option<&CompletionReason> {
        self.shared.completion.get()
    }

    pub fn sent_batches(&self) -> u64 {
        self.sent
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffRecv {
    Batch(TileBatch),
    Empty,
    /// The channel is complete and every batch sent before completion has
    /// been received.
    Completed(CompletionReason),
}

/// Consumer half of the bounded batch hand-off channel. Never blocks.
#[derive(Debug)]
pub struct BatchReceiver {
    receiver: Receiver<TileBatch>,
    shared: Arc<HandoffShared>,
}

impl BatchReceiver {
    pub fn try_recv(&self) -> HandoffRecv {
        match self.receiver.try_recv() {
            Ok(batch) => HandoffRecv::Batch(batch),
            Err(TryRecvError::Empty) => match self.shared.completion.get() {
                None => HandoffRecv::Empty,
                // a batch may have landed between the empty check and the
                // completion load; everything sent before completion is
                // visible now
                Some(reason) => match self.receiver.try_recv() {
                    Ok(batch) => HandoffRecv::Batch(batch),
                    Err(_) => HandoffRecv::Completed(reason.clone()),
                },
            },
            Err(TryRecvError::Disconnected) => {
                let reason = self.shared.completion.get_or_init(|| {
                    CompletionReason::DecodeFailed(
                        "polling worker disconnected without completing".to_owned(),
                    )
                });
                HandoffRecv::Completed(reason.clone())
            }
        }
    }

    pub fn complete(&self, reason: CompletionReason) -> bool {
        self.shared.complete(reason)
    }

    /// Complete and fully drained.
    pub fn is_completed(&self) -> bool {
        self.shared.completion.get().is_some() && self.receiver.is_empty()
    }

    pub fn completion_reason(&self) -> Option<&CompletionReason> {
        self.shared.completion.get()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

pub fn create_handoff_channel(capacity: usize) -> (BatchSender, BatchReceiver) {
    assert!(capacity > 0, "hand-off channel capacity must be greater than zero");
    let (sender, receiver) = bounded(capacity);
    let shared = Arc::new(HandoffShared {
        completion: OnceLock::new(),
    });
    (
        BatchSender {
            sender,
            shared: Arc::clone(&shared),
            sent: 0,
        },
        BatchReceiver { receiver, shared },
    )
}

// Single producer (presentation thread), single consumer (polling worker).
// When full, the oldest hint is evicted so the newest viewing direction wins.
#[derive(Debug)]
struct SharedHintRing {
    queue: ArrayQueue<FieldOfViewHint>,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

#[derive(Debug)]
pub struct FovHintProducer {
    shared: Arc<SharedHintRing>,
}

impl FovHintProducer {
    pub fn push(&self, hint: FieldOfViewHint) {
        let mut pending_hint = hint;
        loop {
            match self.shared.queue.push(pending_hint) {
                Ok(()) => {
                    self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(returned_hint) => {
                    pending_hint = returned_hint;
                    if self.shared.queue.pop().is_some() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    pub fn dropped_hints(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed_hints(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct FovHintConsumer {
    shared: Arc<SharedHintRing>,
}

impl FovHintConsumer {
    /// Drains up to `max_items` hints, appending to `output`.
    pub fn drain_into(&self, output: &mut Vec<FieldOfViewHint>, max_items: usize) {
        for _ in 0..max_items {
            match self.shared.queue.pop() {
                Some(hint) => output.push(hint),
                None => break,
            }
        }
    }
}

pub fn create_hint_ring(capacity: usize) -> (FovHintProducer, FovHintConsumer) {
    assert!(capacity > 0, "hint ring capacity must be greater than zero");
    let shared = Arc::new(SharedHintRing {
        queue: ArrayQueue::new(capacity),
        dropped: AtomicU64::new(0),
        pushed: AtomicU64::new(0),
    });
    (
        FovHintProducer {
            shared: Arc::clone(&shared),
        },
        FovHintConsumer { shared },
    )
}

/// Hands items back from a presenter thread to the presentation thread.
pub struct ReleaseSender<T> {
    producer: Producer<T>,
}

impl<T> ReleaseSender<T> {
    /// Returns the item back if the queue is full.
    pub fn release(&mut self, item: T) -> Result<(), T> {
        match self.producer.push(item) {
            Ok(()) => Ok(()),
            Err(PushError::Full(returned_item)) => Err(returned_item),
        }
    }

    pub fn slots(&self) -> usize {
        self.producer.slots()
    }
}

pub struct ReleaseReceiver<T> {
    consumer: Consumer<T>,
}

impl<T> ReleaseReceiver<T> {
    pub fn pop(&mut self) -> Option<T> {
        self.consumer.pop().ok()
    }

    pub fn items(&self) -> usize {
        self.consumer.slots()
    }
}

pub fn create_release_queue<T>(capacity: usize) -> (ReleaseSender<T>, ReleaseReceiver<T>) {
    assert!(capacity > 0, "release queue capacity must be greater than zero");
    let (producer, consumer) = RingBuffer::new(capacity);
    (ReleaseSender { producer }, ReleaseReceiver { consumer })
}

/// Endpoints owned by the polling worker.
#[derive(Debug)]
pub struct PollingThreadChannels {
    pub batch_sender: BatchSender,
    pub hint_consumer: FovHintConsumer,
}

/// Endpoints owned by the presentation thread.
#[derive(Debug)]
pub struct PresentationThreadChannels {
    pub batch_receiver: BatchReceiver,
    pub hint_producer: FovHintProducer,
}

pub fn create_thread_channels(
    handoff_capacity: usize,
    hint_capacity: usize,
) -> (PollingThreadChannels, PresentationThreadChannels) {
    let (batch_sender, batch_receiver) = create_handoff_channel(handoff_capacity);
    let (hint_producer, hint_consumer) = create_hint_ring(hint_capacity);
    (
        PollingThreadChannels {
            batch_sender,
            hint_consumer,
        },
        PresentationThreadChannels {
            batch_receiver,
            hint_producer,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::BatchTiles;

    fn batch(batch_index: u64) -> TileBatch {
        TileBatch {
            frame_index: 0,
            batch_index,
            tiles: BatchTiles::new(),
        }
    }

    #[test]
    fn batches_arrive_in_send_order() {
        let (mut sender, receiver) = create_handoff_channel(4);
        let cancel = CancelToken::new();
        for index in 1..=3 {
            sender.send_blocking(batch(index), &cancel).expect("send batch");
        }
        assert_eq!(sender.sent_batches(), 3);
        for index in 1..=3 {
            assert_eq!(receiver.try_recv(), HandoffRecv::Batch(batch(index)));
        }
        assert_eq!(receiver.try_recv(), HandoffRecv::Empty);
    }

    #[test]
    fn completion_is_reported_only_after_pending_batches_drain() {
        let (mut sender, receiver) = create_handoff_channel(2);
        let cancel = CancelToken::new();
        sender.send_blocking(batch(1), &cancel).expect("send batch");
        assert!(sender.complete(CompletionReason::EndOfStream));

        assert!(!receiver.is_completed());
        assert_eq!(receiver.try_recv(), HandoffRecv::Batch(batch(1)));
        assert!(receiver.is_completed());
        assert_eq!(
            receiver.try_recv(),
            HandoffRecv::Completed(CompletionReason::EndOfStream)
        );
    }

    #[test]
    fn first_completion_reason_wins() {
        let (sender, receiver) = create_handoff_channel(1);
        assert!(sender.complete(CompletionReason::ProtocolViolation("dup".to_owned())));
        assert!(!receiver.complete(CompletionReason::Cancelled));
        assert_eq!(
            receiver.completion_reason(),
            Some(&CompletionReason::ProtocolViolation("dup".to_owned()))
        );
    }

    #[test]
    fn blocked_send_gives_up_on_cancellation() {
        let (mut sender, receiver) = create_handoff_channel(1);
        let cancel = CancelToken::new();
        sender.send_blocking(batch(1), &cancel).expect("first send fits");

        let canceller = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            canceller.cancel();
        });
        let result = sender.send_blocking(batch(2), &cancel);
        handle.join().expect("join canceller");

        assert_eq!(result, Err(HandoffSendError::Cancelled));
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn send_after_completion_is_refused() {
        let (mut sender, receiver) = create_handoff_channel(1);
        receiver.complete(CompletionReason::Cancelled);
        let result = sender.send_blocking(batch(1), &CancelToken::new());
        assert_eq!(result, Err(HandoffSendError::Completed));
        assert!(receiver.is_empty());
    }

    #[test]
    fn dropped_sender_without_completion_reads_as_decode_failure() {
        let (sender, receiver) = create_handoff_channel(1);
        drop(sender);
        assert!(matches!(
            receiver.try_recv(),
            HandoffRecv::Completed(CompletionReason::DecodeFailed(_))
        ));
    }

    #[test]
    fn hint_ring_evicts_oldest_when_full() {
        let (producer, consumer) = create_hint_ring(2);
        for col in 0..3 {
            producer.push(FieldOfViewHint { col, row: 0 });
        }
        assert_eq!(producer.pushed_hints(), 3);
        assert_eq!(producer.dropped_hints(), 1);

        let mut drained = Vec::new();
        consumer.drain_into(&mut drained, 8);
        assert_eq!(
            drained,
            vec![
                FieldOfViewHint { col: 1, row: 0 },
                FieldOfViewHint { col: 2, row: 0 },
            ]
        );
    }

    #[test]
    fn release_queue_returns_item_when_full() {
        let (mut sender, mut receiver) = create_release_queue::<u32>(1);
        assert_eq!(sender.release(7), Ok(()));
        assert_eq!(sender.release(8), Err(8));
        assert_eq!(receiver.items(), 1);
        assert_eq!(receiver.pop(), Some(7));
        assert_eq!(receiver.pop(), None);
    }
}
