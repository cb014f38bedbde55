//! Multicast frame channel with a short replay buffer
//!
//! Publishing never blocks. A subscriber that falls behind loses its oldest
//! frames and keeps receiving from the newest retained one.

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

struct ChannelState<T> {
    tx: Option<broadcast::Sender<T>>,
    replay: VecDeque<T>,
}

/// Sending half, owned by the transport
pub(crate) struct FrameChannel<T> {
    name: &'static str,
    replay_len: usize,
    state: Mutex<ChannelState<T>>,
}

impl<T: Clone + Send + 'static> FrameChannel<T> {
    /// `capacity` frames are buffered per subscriber; the last `replay_len`
    /// frames are handed to every new subscriber first.
    pub(crate) fn new(name: &'static str, capacity: usize, replay_len: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            replay_len,
            state: Mutex::new(ChannelState {
                tx: Some(tx),
                replay: VecDeque::with_capacity(replay_len),
            }),
        }
    }

    pub(crate) fn publish(&self, frame: T) {
        let mut state = self.state.lock();
        if self.replay_len > 0 {
            if state.replay.len() == self.replay_len {
                state.replay.pop_front();
            }
            state.replay.push_back(frame.clone());
        }
        if let Some(tx) = &state.tx {
            // No subscribers is fine
            let _ = tx.send(frame);
        }
    }

    pub(crate) fn subscribe(&self) -> FrameSubscription<T> {
        let state = self.state.lock();
        FrameSubscription {
            name: self.name,
            backlog: state.replay.clone(),
            rx: state.tx.as_ref().map(|tx| tx.subscribe()),
        }
    }

    /// End every subscription once it has drained
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.tx = None;
        state.replay.clear();
    }
}

/// Receiving half handed to consumers
pub struct FrameSubscription<T> {
    name: &'static str,
    backlog: VecDeque<T>,
    rx: Option<broadcast::Receiver<T>>,
}

impl<T: Clone + Send + 'static> FrameSubscription<T> {
    /// Next frame, or `None` once the transport is closed
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(frame) = self.backlog.pop_front() {
            return Some(frame);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = self.name, skipped, "slow subscriber dropped frames");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next frame if one is ready
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(frame) = self.backlog.pop_front() {
            return Some(frame);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(frame) => return Some(frame),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = self.name, skipped, "slow subscriber dropped frames");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = T> {
        stream::unfold(self, |mut sub| async move {
            let frame = sub.recv().await?;
            Some((frame, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_gets_replay() {
        let channel = FrameChannel::new("test", 8, 2);
        channel.publish(1);
        channel.publish(2);
        channel.publish(3);

        let mut sub = channel.subscribe();
        channel.publish(4);
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.recv().await, Some(4));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let channel = FrameChannel::new("test", 4, 0);
        let mut sub = channel.subscribe();
        for i in 0..10 {
            channel.publish(i);
        }
        // Only the newest four survive
        assert_eq!(sub.recv().await, Some(6));
        assert_eq!(sub.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let channel = FrameChannel::new("test", 4, 0);
        let mut sub = channel.subscribe();
        channel.publish(1);
        channel.close();
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
        assert_eq!(channel.subscribe().recv().await, None);
    }
}
