//! Per-channel inbound queueing with reaction bookkeeping.
//!
//! Discord and Telegram mark each accepted message with exactly one
//! reaction reflecting its state: 👀 on the message the session is (or is
//! next to be) responding to, ⏳ on everything queued behind it. The
//! transitions live here; bridges only translate
//! [`Mark`]s into platform reaction calls.

use std::collections::VecDeque;

/// Reaction a bridge should show on an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// 👀 — current or next up.
    Eye,
    /// ⏳ — queued behind another message.
    Hourglass,
}

impl Mark {
    pub fn emoji(&self) -> &'static str {
        match self {
            Mark::Eye => "\u{1f440}",
            Mark::Hourglass => "\u{23f3}",
        }
    }
}

/// FIFO of accepted-but-not-started messages plus the single current
/// context, for one `(channel_id, channel_user_id)` pair. `M` is the
/// platform message reference (chat id + message id).
#[derive(Debug)]
pub struct ChannelQueue<M> {
    queued: VecDeque<M>,
    current: Option<M>,
}

impl<M: Clone + PartialEq> Default for ChannelQueue<M> {
    fn default() -> Self {
        Self {
            queued: VecDeque::new(),
            current: None,
        }
    }
}

impl<M: Clone + PartialEq> ChannelQueue<M> {
    /// Accept a message and return the reaction it should carry: 👀 when
    /// nothing is in flight or waiting, ⏳ otherwise.
    pub fn accept(&mut self, msg: M) -> Mark {
        let mark = if self.current.is_none() && self.queued.is_empty() {
            Mark::Eye
        } else {
            Mark::Hourglass
        };
        self.queued.push_back(msg);
        mark
    }

    /// Roll back an optimistically accepted message (`on_message` returned
    /// false). Returns true when it was still queued.
    pub fn rollback(&mut self, msg: &M) -> bool {
        if let Some(pos) = self.queued.iter().position(|m| m == msg) {
            self.queued.remove(pos);
            true
        } else {
            false
        }
    }

    /// A turn started: the head of the queue becomes the current context.
    pub fn begin(&mut self) -> Option<M> {
        self.current = self.queued.pop_front();
        self.current.clone()
    }

    /// A turn finished (`done`/`error`): release the current context and
    /// promote the next head.
    ///
    /// Returns `(finished, promoted)` — the bridge clears `finished`'s
    /// reaction and upgrades `promoted` from ⏳ to 👀.
    pub fn finish(&mut self) -> (Option<M>, Option<M>) {
        let finished = self.current.take();
        let promoted = self.queued.front().cloned();
        (finished, promoted)
    }

    pub fn current(&self) -> Option<&M> {
        self.current.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_gets_the_eye() {
        let mut q: ChannelQueue<u32> = ChannelQueue::default();
        assert_eq!(q.accept(1), Mark::Eye);
        assert_eq!(q.begin(), Some(1));
    }

    #[test]
    fn three_messages_while_processing() {
        // The first message keeps 👀 through its turn; the two that arrive
        // behind it get ⏳; done promotes exactly the next one.
        let mut q: ChannelQueue<u32> = ChannelQueue::default();
        assert_eq!(q.accept(1), Mark::Eye);
        q.begin();
        assert_eq!(q.accept(2), Mark::Hourglass);
        assert_eq!(q.accept(3), Mark::Hourglass);

        let (finished, promoted) = q.finish();
        assert_eq!(finished, Some(1));
        assert_eq!(promoted, Some(2));

        // Message 3 is untouched until message 2 finishes.
        q.begin();
        let (finished, promoted) = q.finish();
        assert_eq!(finished, Some(2));
        assert_eq!(promoted, Some(3));
    }

    #[test]
    fn rollback_removes_only_queued_messages() {
        let mut q: ChannelQueue<u32> = ChannelQueue::default();
        q.accept(1);
        q.begin();
        q.accept(2);
        assert!(q.rollback(&2));
        assert!(!q.rollback(&1)); // already current, not queued
        let (finished, promoted) = q.finish();
        assert_eq!(finished, Some(1));
        assert_eq!(promoted, None);
        assert!(q.is_idle());
    }
}
