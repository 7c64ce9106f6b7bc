//! Mailbox of received-but-unconsumed OCPP messages
//!
//! Inbound Calls wait here until the dispatcher takes them, oldest first.
//! Replies are matched to their request by message id, in any order. A reply
//! is only kept while somebody is waiting for its id; late replies (the
//! caller already gave up) are dropped instead of piling up.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::messages::{Call, OcppMessage};

#[derive(Default)]
struct Inner {
    messages: VecDeque<OcppMessage>,
    /// Reply ids somebody is waiting for, with the number of waiters
    awaiting: HashMap<String, usize>,
}

/// Shared mailbox; clones refer to the same queue
#[derive(Clone, Default)]
pub struct Mailbox {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a received message and wake waiters
    pub fn push(&self, message: OcppMessage) {
        {
            let mut inner = self.inner.lock();
            if let OcppMessage::Call(_) = message {
                inner.messages.push_back(message);
            } else if inner.awaiting.contains_key(message.message_id()) {
                inner.messages.push_back(message);
            } else {
                debug!("Dropping unsolicited reply {}", message.message_id());
                return;
            }
        }
        self.notify.notify_waiters();
    }

    /// Wait for the oldest unconsumed Call and remove it
    pub async fn receive_call(&self) -> Call {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                let index = inner
                    .messages
                    .iter()
                    .position(|m| matches!(m, OcppMessage::Call(_)));
                if let Some(OcppMessage::Call(call)) = index.and_then(|i| inner.messages.remove(i)) {
                    return call;
                }
            }

            notified.await;
        }
    }

    /// Wait for the reply (CallResult or CallError) carrying `message_id`.
    ///
    /// Interest in the id is registered as soon as this is called, so a reply
    /// that arrives before the returned future is first polled is kept.
    /// Dropping the future withdraws the interest.
    pub fn receive(&self, message_id: &str) -> impl Future<Output = OcppMessage> + Send + 'static {
        let guard = AwaitGuard::register(self.clone(), message_id);

        async move {
            let guard = guard;
            loop {
                let notified = guard.mailbox.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(message) = guard.take() {
                    return message;
                }

                notified.await;
            }
        }
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration of interest in a reply id, withdrawn on drop
struct AwaitGuard {
    mailbox: Mailbox,
    message_id: String,
}

impl AwaitGuard {
    fn register(mailbox: Mailbox, message_id: &str) -> Self {
        *mailbox
            .inner
            .lock()
            .awaiting
            .entry(message_id.to_string())
            .or_insert(0) += 1;

        Self {
            mailbox,
            message_id: message_id.to_string(),
        }
    }

    fn take(&self) -> Option<OcppMessage> {
        let mut inner = self.mailbox.inner.lock();
        let index = inner.messages.iter().position(|m| {
            !matches!(m, OcppMessage::Call(_)) && m.message_id() == self.message_id
        })?;
        inner.messages.remove(index)
    }
}

impl Drop for AwaitGuard {
    fn drop(&mut self) {
        let mut inner = self.mailbox.inner.lock();
        let remaining = match inner.awaiting.get_mut(&self.message_id) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return,
        };

        if remaining == 0 {
            inner.awaiting.remove(&self.message_id);
            let id = &self.message_id;
            inner
                .messages
                .retain(|m| matches!(m, OcppMessage::Call(_)) || m.message_id() != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::messages::{Action, CallResult};
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    fn call(id: &str, action: &str) -> OcppMessage {
        OcppMessage::Call(Call {
            message_id: id.into(),
            action: Action::from(action),
            payload: json!({}),
        })
    }

    fn result(id: &str) -> OcppMessage {
        OcppMessage::CallResult(CallResult::new(id, json!({"id": id})).unwrap())
    }

    #[test]
    fn test_receive_call_returns_oldest_call_only() {
        let mailbox = Mailbox::new();
        let pending = mailbox.receive("r1");

        mailbox.push(result("r1"));
        mailbox.push(call("c1", "Reset"));
        mailbox.push(call("c2", "RemoteStartTransaction"));

        let mut first = task::spawn(mailbox.receive_call());
        let first = assert_ready!(first.poll());
        assert_eq!(first.message_id, "c1");

        let mut second = task::spawn(mailbox.receive_call());
        let second = assert_ready!(second.poll());
        assert_eq!(second.message_id, "c2");

        // The CallResult is still there for its requester
        let mut third = task::spawn(mailbox.receive_call());
        assert_pending!(third.poll());
        assert_eq!(mailbox.len(), 1);
        drop(pending);
    }

    #[test]
    fn test_receive_call_wakes_on_push() {
        let mailbox = Mailbox::new();
        let mut waiting = task::spawn(mailbox.receive_call());
        assert_pending!(waiting.poll());

        mailbox.push(call("c1", "Reset"));
        assert!(waiting.is_woken());
        let received = assert_ready!(waiting.poll());
        assert_eq!(received.action, Action::Reset);
    }

    #[test]
    fn test_replies_match_by_id_in_any_order() {
        let mailbox = Mailbox::new();
        let mut a = task::spawn(mailbox.receive("a"));
        let mut b = task::spawn(mailbox.receive("b"));
        assert_pending!(a.poll());
        assert_pending!(b.poll());

        mailbox.push(result("b"));
        assert_pending!(a.poll());
        assert_ready_eq!(b.poll(), result("b"));

        mailbox.push(result("a"));
        assert_ready_eq!(a.poll(), result("a"));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_reply_before_first_poll_is_kept() {
        let mailbox = Mailbox::new();
        let reply = mailbox.receive("early");
        mailbox.push(result("early"));

        let mut reply = task::spawn(reply);
        assert_ready_eq!(reply.poll(), result("early"));
    }

    #[test]
    fn test_unsolicited_and_abandoned_replies_are_dropped() {
        let mailbox = Mailbox::new();
        mailbox.push(result("nobody"));
        assert!(mailbox.is_empty());

        let abandoned = mailbox.receive("late");
        drop(abandoned);
        mailbox.push(result("late"));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_calls_are_never_returned_as_replies() {
        let mailbox = Mailbox::new();
        let mut reply = task::spawn(mailbox.receive("same"));
        mailbox.push(call("same", "Reset"));
        assert_pending!(reply.poll());
        assert_eq!(mailbox.len(), 1);
    }
}
