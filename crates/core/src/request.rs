//! Local proposal requests from the miner.

use crate::core::{Core, State};
use crate::errors::CoreError;
use ibft_types::Block;
use tracing::{debug, trace};

impl Core {
    /// Entry point for a `Request` event carrying a candidate block.
    pub(crate) fn handle_request_event(&mut self, block: Block) {
        match self.check_request(&block) {
            Ok(()) => self.accept_request(block),
            Err(CoreError::FutureMessage) => self.store_request(block),
            Err(err) => {
                debug!(sequence = block.number(), %err, "dropping request");
            }
        }
    }

    fn check_request(&self, block: &Block) -> Result<(), CoreError> {
        let sequence = self.current.sequence();
        if block.number() < sequence {
            Err(CoreError::OldMessage)
        } else if block.number() > sequence {
            Err(CoreError::FutureMessage)
        } else {
            Ok(())
        }
    }

    /// Adopt a request for the current sequence; propose it right away if
    /// we are still waiting for a proposal.
    pub(crate) fn accept_request(&mut self, block: Block) {
        trace!(sequence = block.number(), hash = %block.hash(), "accepted request");
        self.current.pending_request = Some(block.clone());
        if self.state == State::AcceptRequest {
            self.send_preprepare(block);
        }
    }
}
