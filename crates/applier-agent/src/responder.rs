//! Exactly-once reply guard
//!
//! Every request delivered to a page agent carries one reply slot. Several
//! parties may try to answer (the handler, an acknowledgement timer); the
//! first wins and later attempts are dropped with a log line.

use applier_core::PageResponse;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Single-use reply slot shared by everyone who may answer a request
#[derive(Debug)]
pub struct Responder {
    action: &'static str,
    slot: Mutex<Option<oneshot::Sender<PageResponse>>>,
}

impl Responder {
    /// Create a responder and the receiver its reply arrives on
    pub fn channel(action: &'static str) -> (Self, oneshot::Receiver<PageResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                action,
                slot: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver `response` if nobody answered yet.
    ///
    /// Returns whether this call was the one that answered.
    pub fn respond(&self, response: PageResponse) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!("Requester for '{}' went away before the reply", self.action);
                }
                true
            }
            None => {
                debug!("Dropping second reply to '{}': {:?}", self.action, response);
                false
            }
        }
    }

    pub fn is_answered(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use applier_core::DispatchAck;

    #[tokio::test]
    async fn test_first_reply_wins() {
        let (responder, rx) = Responder::channel("process_job_queue");
        assert!(!responder.is_answered());

        assert!(responder.respond(PageResponse::accepted(DispatchAck::Initiated, "started")));
        assert!(!responder.respond(PageResponse::accepted(DispatchAck::Processing, "late")));
        assert!(responder.is_answered());

        assert_eq!(
            rx.await.unwrap(),
            PageResponse::accepted(DispatchAck::Initiated, "started")
        );
    }

    #[test]
    fn test_reply_after_requester_left() {
        let (responder, rx) = Responder::channel("ping");
        drop(rx);
        assert!(responder.respond(PageResponse::Pong));
        assert!(!responder.respond(PageResponse::Pong));
    }
}
