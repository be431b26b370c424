//! Merge loop: five bounded per-mode channels into one output channel.
//!
//! Producers emit through [`StreamEmitter`] with a non-blocking `try_send`;
//! a full channel drops the event and bumps that mode's counter. The merge
//! loop forwards events whose mode is subscribed, terminates when the
//! driving context is cancelled or every emitter handle has been dropped,
//! drains what is left, then closes the output channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{StreamEvent, StreamMode, ToolStreamWriter};

/// Per-mode channel capacity used by [`StreamMultiplexer::start`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Producer handle: one sender per mode plus shared drop counters.
///
/// Cloneable; the merge loop ends once every clone is dropped and the
/// channels are drained.
#[derive(Clone)]
pub struct StreamEmitter {
    senders: [mpsc::Sender<StreamEvent>; 5],
    dropped: Arc<[AtomicU64; 5]>,
}

impl StreamEmitter {
    /// Non-blocking emit. Returns `false` when the event was dropped
    /// because its mode channel was full or already closed.
    pub fn emit(&self, event: StreamEvent) -> bool {
        let idx = event.mode().index();
        match self.senders[idx].try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped[idx].fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Events dropped so far for `mode`.
    pub fn dropped(&self, mode: StreamMode) -> u64 {
        self.dropped[mode.index()].load(Ordering::Relaxed)
    }

    /// A type-erased writer for tools; payloads land on mode `custom`.
    pub fn tool_writer(&self) -> ToolStreamWriter {
        let emitter = self.clone();
        ToolStreamWriter::new(move |value| emitter.emit(StreamEvent::custom(value)))
    }
}

impl std::fmt::Debug for StreamEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEmitter")
            .field(
                "dropped",
                &StreamMode::ALL.map(|m| self.dropped(m)),
            )
            .finish()
    }
}

/// The five-mode event bus.
pub struct StreamMultiplexer;

impl StreamMultiplexer {
    /// Starts a multiplexer with [`DEFAULT_CHANNEL_CAPACITY`] per mode.
    ///
    /// Returns the producer handle and the single merged output channel.
    /// Events for modes outside `subscriptions` are accepted by `emit` but
    /// never forwarded.
    pub fn start(
        subscriptions: HashSet<StreamMode>,
        cancel: CancellationToken,
    ) -> (StreamEmitter, mpsc::Receiver<StreamEvent>) {
        Self::start_with_capacity(subscriptions, cancel, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn start_with_capacity(
        subscriptions: HashSet<StreamMode>,
        cancel: CancellationToken,
        capacity: usize,
    ) -> (StreamEmitter, mpsc::Receiver<StreamEvent>) {
        let capacity = capacity.max(1);
        let mut senders = Vec::with_capacity(5);
        let mut receivers = Vec::with_capacity(5);
        for _ in 0..5 {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(rx);
        }
        let senders: [mpsc::Sender<StreamEvent>; 5] = senders
            .try_into()
            .unwrap_or_else(|_| unreachable!("five senders"));
        let emitter = StreamEmitter {
            senders,
            dropped: Arc::new([
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ]),
        };

        let (out_tx, out_rx) = mpsc::channel(capacity);
        tokio::spawn(merge_loop(receivers, subscriptions, cancel, out_tx));
        (emitter, out_rx)
    }
}

async fn merge_loop(
    receivers: Vec<mpsc::Receiver<StreamEvent>>,
    subscriptions: HashSet<StreamMode>,
    cancel: CancellationToken,
    out: mpsc::Sender<StreamEvent>,
) {
    let receivers: [mpsc::Receiver<StreamEvent>; 5] = receivers
        .try_into()
        .unwrap_or_else(|_| unreachable!("five receivers"));
    let [mut r0, mut r1, mut r2, mut r3, mut r4] = receivers;
    let mut open = [true; 5];

    loop {
        if !open.iter().any(|o| *o) {
            break;
        }
        // `select!` picks randomly among ready branches, which is the
        // fair-interleaving contract across modes; each branch preserves
        // its own channel's FIFO order.
        let forwarded = tokio::select! {
            _ = cancel.cancelled() => None,
            event = recv_open(&mut r0, open[0]) => Some((0, event)),
            event = recv_open(&mut r1, open[1]) => Some((1, event)),
            event = recv_open(&mut r2, open[2]) => Some((2, event)),
            event = recv_open(&mut r3, open[3]) => Some((3, event)),
            event = recv_open(&mut r4, open[4]) => Some((4, event)),
        };

        match forwarded {
            None => break,
            Some((idx, None)) => open[idx] = false,
            Some((_, Some(event))) => {
                if subscriptions.contains(&event.mode()) && out.send(event).await.is_err() {
                    // Consumer went away; nothing left to forward to.
                    return;
                }
            }
        }
    }

    // Drain whatever is already buffered, then let `out` drop to close the
    // output channel.
    for rx in [&mut r0, &mut r1, &mut r2, &mut r3, &mut r4] {
        while let Ok(event) = rx.try_recv() {
            if subscriptions.contains(&event.mode()) && out.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Receives from `rx` when the channel is still open; pends forever once it
/// is closed so the other select branches keep progressing.
async fn recv_open(
    rx: &mut mpsc::Receiver<StreamEvent>,
    open: bool,
) -> Option<StreamEvent> {
    if open {
        rx.recv().await
    } else {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamPayload;
    use serde_json::json;

    fn all_modes() -> HashSet<StreamMode> {
        StreamMode::ALL.into_iter().collect()
    }

    #[tokio::test]
    async fn per_mode_order_is_preserved() {
        let cancel = CancellationToken::new();
        let (emitter, mut rx) = StreamMultiplexer::start(all_modes(), cancel);
        for i in 0..10 {
            assert!(emitter.emit(StreamEvent::token(format!("t{i}"))));
        }
        drop(emitter);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamPayload::Token(chunk) = event.payload {
                seen.push(chunk.content);
            }
        }
        let expected: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn unsubscribed_modes_are_not_forwarded() {
        let cancel = CancellationToken::new();
        let (emitter, mut rx) =
            StreamMultiplexer::start(HashSet::from([StreamMode::Updates]), cancel);
        emitter.emit(StreamEvent::token("dropped"));
        emitter.emit(StreamEvent::update("loop", json!({"step": 1})));
        drop(emitter);

        let event = rx.recv().await.expect("one forwarded event");
        assert_eq!(event.mode(), StreamMode::Updates);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let cancel = CancellationToken::new();
        // Tiny capacity, no consumer yet: overflow must drop, not block.
        let (emitter, _rx) =
            StreamMultiplexer::start_with_capacity(all_modes(), cancel, 1);
        // The merge loop may pull a few events; flood well past capacity.
        let mut accepted = 0;
        for i in 0..200 {
            if emitter.emit(StreamEvent::custom(json!(i))) {
                accepted += 1;
            }
        }
        assert!(accepted < 200);
        assert!(emitter.dropped(StreamMode::Custom) > 0);
        assert_eq!(emitter.dropped(StreamMode::Messages), 0);
    }

    #[tokio::test]
    async fn output_closes_after_all_emitters_drop() {
        let cancel = CancellationToken::new();
        let (emitter, mut rx) = StreamMultiplexer::start(all_modes(), cancel);
        let clone = emitter.clone();
        emitter.emit(StreamEvent::token("a"));
        drop(emitter);
        clone.emit(StreamEvent::token("b"));
        drop(clone);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_drains_then_closes() {
        let cancel = CancellationToken::new();
        let (emitter, mut rx) = StreamMultiplexer::start(all_modes(), cancel.clone());
        emitter.emit(StreamEvent::token("pre-cancel"));
        cancel.cancel();

        // Already-buffered events still arrive, then the channel closes even
        // though the emitter is alive.
        let mut drained = 0;
        while let Some(_event) = rx.recv().await {
            drained += 1;
        }
        assert_eq!(drained, 1);
        drop(emitter);
    }
}
