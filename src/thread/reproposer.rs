use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time;

use crate::internal;
use crate::message::Proposal;
use crate::protocol;

/// One-shot timer that re-submits a proposal if its slot hasn't
/// gathered a majority of promises before the deadline.
///
/// Re-submission runs through the dispatcher like any other input, so
/// it restarts the round with a fresh psn and arms a replacement
/// timer; this task fires at most once.
pub(crate) struct ReProposer {
    dispatcher: internal::Tx<protocol::In>,
    proposal: Proposal,
    delay: Duration,
    cancelled: oneshot::Receiver<()>,
}

impl ReProposer {
    /// The returned sender cancels the timer when dropped.
    pub fn new(
        dispatcher: internal::Tx<protocol::In>,
        proposal: Proposal,
        delay: Duration,
    ) -> (Self, oneshot::Sender<()>) {
        let (cancel, cancelled) = oneshot::channel();
        let reproposer = ReProposer {
            dispatcher,
            proposal,
            delay,
            cancelled,
        };
        (reproposer, cancel)
    }

    pub async fn run(mut self) {
        tokio::select! {
            _ = time::sleep(self.delay) => {
                debug!("re-proposing {:?}", self.proposal);
                self.dispatcher.try_send(protocol::In::Submit {
                    csn: Some(self.proposal.csn),
                    value: self.proposal.value,
                });
            }
            _ = &mut self.cancelled => (),
        }
    }
}
