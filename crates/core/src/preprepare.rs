//! Preprepare phase: proposal broadcast and acceptance.

use crate::core::{Core, State};
use crate::errors::CoreError;
use ibft_types::{BftError, Block, Message, MessageCode, Preprepare};
use tracing::{debug, warn};

impl Core {
    /// Broadcast the proposal for the current view. Only the speaker of the
    /// view does this; everyone else ignores the call.
    pub(crate) fn send_preprepare(&mut self, proposal: Block) {
        if self.current.sequence() != proposal.number() || !self.is_proposer() {
            return;
        }

        let view = self.current_view();
        debug!(%view, hash = %proposal.hash(), "broadcasting preprepare");
        let preprepare = Preprepare { view, proposal };
        let message = Message::new(
            MessageCode::Preprepare,
            alloy_rlp::encode(&preprepare).into(),
            self.backend.address(),
        );
        self.broadcast(message);
    }

    pub(crate) fn handle_preprepare(&mut self, message: &Message) -> Result<(), CoreError> {
        let preprepare: Preprepare = message.payload()?;
        self.check_message(MessageCode::Preprepare, preprepare.view)?;

        if !self.validators.is_proposer(message.address) {
            warn!(sender = %message.address, "preprepare from non-speaker");
            return Err(CoreError::NotFromSpeaker);
        }

        let proposal = &preprepare.proposal;
        if proposal.number() != preprepare.view.sequence {
            warn!(
                number = proposal.number(),
                sequence = preprepare.view.sequence,
                "preprepare proposal is not for its view"
            );
            return Err(CoreError::Ignored);
        }
        if self.backend.has_bad_block(proposal.hash()) {
            warn!(hash = %proposal.hash(), "preprepare proposes a known bad block");
            self.send_next_round_change();
            return Err(CoreError::Ignored);
        }

        match self.backend.verify(proposal) {
            Ok(()) => {}
            Err(BftError::FutureBlock) => {
                // Not wrong, just early: re-handle once its timestamp is
                // reached. Not backlogged, the timer owns the replay.
                debug!(hash = %proposal.hash(), "parking preprepare for a future block");
                self.start_future_preprepare_timer(proposal.header.timestamp, message.clone());
                return Err(CoreError::Protocol(BftError::FutureBlock));
            }
            Err(err) => {
                warn!(hash = %proposal.hash(), %err, "preprepare proposal failed verification");
                self.send_next_round_change();
                return Err(err.into());
            }
        }

        if self.state == State::AcceptRequest {
            if self.current.is_hash_locked() && self.current.locked_hash() != Some(proposal.hash())
            {
                // Locked on a different proposal: refuse and move the round.
                debug!(
                    locked = ?self.current.locked_hash(),
                    offered = %proposal.hash(),
                    "preprepare conflicts with locked hash"
                );
                self.send_next_round_change();
                return Ok(());
            }
            self.current.preprepare = Some(preprepare);
            self.set_state(State::Preprepared);
            self.send_prepare();
        }

        Ok(())
    }
}
