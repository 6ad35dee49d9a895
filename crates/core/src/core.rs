//! The consensus task.
//!
//! Exactly one spawned task owns this state machine. It consumes requests,
//! peer messages, chain-head notifications, and its own timer expiries from
//! channels, sequentially; no round state is touched from outside the task.

use crate::backend::CoreBackend;
use crate::backlog::{Backlogs, MessageClass};
use crate::errors::CoreError;
use crate::events::{ConsensusEvent, EventMux};
use crate::round_change::RoundChangeSet;
use crate::round_state::RoundState;
use ibft_types::{
    Address, BftConfig, BftResult, Block, Message, MessageCode, Preprepare, ProposerPolicy,
    Subject, ValidatorSet, View,
};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Phases of one consensus instance, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    AcceptRequest,
    Preprepared,
    Prepared,
    Committed,
    FinalCommitted,
}

/// Inputs the core generates for itself: timer expiries and replays of
/// messages that were parked (backlog, future preprepare).
#[derive(Debug)]
pub(crate) enum InternalEvent {
    Timeout { view: View },
    Replay { message: Message },
}

#[derive(Debug, PartialEq, Eq)]
struct PendingRequest {
    sequence: u64,
    block: Block,
}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

/// Handle to a running consensus task.
///
/// Dropping the handle aborts the task; [`CoreHandle::stop`] shuts it down
/// cleanly and waits for it to drain.
#[derive(Debug)]
pub struct CoreHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl CoreHandle {
    /// Signal shutdown and join the task.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        if let Some(join) = &self.join {
            join.abort();
        }
    }
}

/// The consensus state machine.
pub struct Core {
    config: BftConfig,
    address: Address,
    pub(crate) state: State,
    pub(crate) backend: Arc<dyn CoreBackend>,
    pub(crate) validators: ValidatorSet,
    pub(crate) current: RoundState,
    started: bool,
    pub(crate) waiting_for_round_change: bool,
    pub(crate) round_change_set: RoundChangeSet,
    backlogs: Backlogs,
    pending_requests: BinaryHeap<Reverse<PendingRequest>>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: Option<mpsc::UnboundedReceiver<InternalEvent>>,
    round_timer: Option<JoinHandle<()>>,
    future_preprepare_timer: Option<JoinHandle<()>>,
}

impl Core {
    pub fn new(config: BftConfig, backend: Arc<dyn CoreBackend>) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let address = backend.address();
        let placeholder = ValidatorSet::new(Vec::new(), ProposerPolicy::RoundRobin);
        let backlog_capacity = config.backlog_per_sender;
        Self {
            config,
            address,
            state: State::AcceptRequest,
            backend,
            validators: placeholder.clone(),
            current: RoundState::new(View::new(0, 0), placeholder.clone(), None, None, None),
            started: false,
            waiting_for_round_change: false,
            round_change_set: RoundChangeSet::new(placeholder),
            backlogs: Backlogs::new(backlog_capacity),
            pending_requests: BinaryHeap::new(),
            internal_tx,
            internal_rx: Some(internal_rx),
            round_timer: None,
            future_preprepare_timer: None,
        }
    }

    /// Spawn the consensus task, subscribed to `mux`.
    pub fn spawn(config: BftConfig, backend: Arc<dyn CoreBackend>, mux: &EventMux) -> CoreHandle {
        let events = mux.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Core::new(config, backend);
        let join = tokio::spawn(core.run(events, shutdown_rx));
        CoreHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConsensusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut internal = self.internal_rx.take().expect("core runs once");
        info!(address = %self.address, "consensus task started");
        self.start_new_round(0);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ConsensusEvent::Request { block }) => self.handle_request_event(block),
                    Some(ConsensusEvent::Message { payload }) => self.handle_incoming(&payload),
                    Some(ConsensusEvent::FinalCommitted) => self.handle_final_committed(),
                    None => break,
                },
                Some(event) = internal.recv() => match event {
                    InternalEvent::Timeout { view } => self.handle_timeout(view),
                    InternalEvent::Replay { message } => self.handle_checked(message),
                },
                _ = shutdown.changed() => break,
            }
        }

        self.stop_timers();
        info!(address = %self.address, "consensus task stopped");
    }

    // ── message intake ────────────────────────────────────────────────────

    /// Decode, authenticate, and dispatch a wire payload.
    fn handle_incoming(&mut self, payload: &[u8]) {
        let message = match Message::decode_bytes(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "failed to decode consensus message");
                return;
            }
        };

        match message.recover() {
            Ok(signer) if signer == message.address => {}
            Ok(signer) => {
                debug!(%signer, claimed = %message.address, "message signer mismatch");
                return;
            }
            Err(err) => {
                debug!(%err, "failed to recover message signer");
                return;
            }
        }
        if !self.validators.contains(message.address) {
            debug!(sender = %message.address, "message from non-validator");
            return;
        }

        self.handle_checked(message);
    }

    /// Dispatch an authenticated message; park future ones, log the rest.
    fn handle_checked(&mut self, message: Message) {
        let sender = message.address;
        let code = message.code;
        match self.dispatch(&message) {
            Ok(()) => {}
            Err(CoreError::FutureMessage) => {
                if let Some(view) = message_view(&message) {
                    trace!(%sender, %code, %view, "parking future message");
                    self.backlogs.store(sender, view, message);
                }
            }
            Err(err) => {
                debug!(%sender, %code, %err, view = %self.current_view(), "discarding message");
            }
        }
    }

    fn dispatch(&mut self, message: &Message) -> Result<(), CoreError> {
        match message.code {
            MessageCode::Preprepare => self.handle_preprepare(message),
            MessageCode::Prepare => self.handle_prepare(message),
            MessageCode::Commit => self.handle_commit(message),
            MessageCode::RoundChange => self.handle_round_change(message),
        }
    }

    /// Relate a message's view to the current state.
    pub(crate) fn check_message(&self, code: MessageCode, view: View) -> Result<(), CoreError> {
        match classify(
            self.current_view(),
            self.waiting_for_round_change,
            self.state,
            code,
            view,
        ) {
            MessageClass::Current => Ok(()),
            MessageClass::Future => Err(CoreError::FutureMessage),
            MessageClass::Old => Err(CoreError::OldMessage),
        }
    }

    // ── view transitions ──────────────────────────────────────────────────

    pub(crate) fn current_view(&self) -> View {
        self.current.view()
    }

    pub(crate) fn is_proposer(&self) -> bool {
        self.validators.is_proposer(self.address)
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "state transition");
            self.state = state;
        }
        if matches!(state, State::AcceptRequest | State::Preprepared) {
            self.process_pending_requests();
        }
        self.process_backlog();
    }

    /// Enter a view: `(sequence, round)` for a round change within the
    /// current height, or `(head + 1, 0)` when the chain advanced.
    pub(crate) fn start_new_round(&mut self, round: u64) {
        let mut round_change = false;
        let (last_proposal, last_proposer) = self.backend.last_proposal();

        if !self.started {
            self.started = true;
            debug!("starting the initial round");
        } else if last_proposal.number() >= self.current.sequence() {
            debug!(
                head = last_proposal.number(),
                "chain advanced, starting a new height"
            );
        } else if last_proposal.number() == self.current.sequence() - 1 {
            if round == 0 {
                // Same sequence, same round.
                return;
            }
            if round < self.current.round() {
                warn!(
                    round,
                    current = self.current.round(),
                    "ignoring round regression"
                );
                return;
            }
            round_change = true;
        } else {
            warn!(
                head = last_proposal.number(),
                sequence = self.current.sequence(),
                "chain head behind current sequence, refusing new round"
            );
            return;
        }

        let new_view = if round_change {
            View::new(self.current.sequence(), round)
        } else {
            View::new(last_proposal.number() + 1, 0)
        };

        if !round_change {
            self.validators = self.backend.validators(new_view.sequence);
            self.round_change_set = RoundChangeSet::new(self.validators.clone());
        }
        self.round_change_set.clear(new_view.round);
        self.update_round_state(new_view, round_change);
        self.validators.calc_proposer(last_proposer, new_view.round);
        self.waiting_for_round_change = false;
        self.set_state(State::AcceptRequest);

        if round_change && self.is_proposer() {
            if self.current.is_hash_locked() {
                // Re-propose the locked block.
                if let Some(preprepare) = self.current.preprepare.clone() {
                    self.send_preprepare(preprepare.proposal);
                }
            } else if let Some(request) = self.current.pending_request.clone() {
                self.send_preprepare(request);
            }
        }
        self.new_round_timer();

        info!(
            view = %new_view,
            proposer = %self.validators.proposer(),
            validators = self.validators.len(),
            "entered new round"
        );
    }

    pub(crate) fn update_round_state(&mut self, view: View, round_change: bool) {
        self.current = if round_change {
            if self.current.is_hash_locked() {
                RoundState::new(
                    view,
                    self.validators.clone(),
                    self.current.locked_hash(),
                    self.current.preprepare.clone(),
                    self.current.pending_request.clone(),
                )
            } else {
                RoundState::new(
                    view,
                    self.validators.clone(),
                    None,
                    None,
                    self.current.pending_request.clone(),
                )
            }
        } else {
            RoundState::new(view, self.validators.clone(), None, None, None)
        };
    }

    fn handle_final_committed(&mut self) {
        debug!("chain inserted a block, starting a new height");
        self.state = State::FinalCommitted;
        self.start_new_round(0);
    }

    // ── timers ────────────────────────────────────────────────────────────

    pub(crate) fn new_round_timer(&mut self) {
        if let Some(timer) = self.round_timer.take() {
            timer.abort();
        }
        let view = self.current_view();
        let timeout = self.config.round_timeout(view.round);
        let tx = self.internal_tx.clone();
        self.round_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(InternalEvent::Timeout { view });
        }));
    }

    /// Re-inject a preprepare whose proposal timestamp has not been reached
    /// yet, once it has.
    pub(crate) fn start_future_preprepare_timer(&mut self, timestamp: u64, message: Message) {
        if let Some(timer) = self.future_preprepare_timer.take() {
            timer.abort();
        }
        let delay = Duration::from_secs(timestamp.saturating_sub(unix_now()));
        let tx = self.internal_tx.clone();
        self.future_preprepare_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(InternalEvent::Replay { message });
        }));
    }

    fn handle_timeout(&mut self, view: View) {
        if view != self.current_view() {
            trace!(%view, "ignoring stale round timer");
            return;
        }
        let (last_proposal, _) = self.backend.last_proposal();
        if last_proposal.number() >= self.current.sequence() {
            debug!(
                head = last_proposal.number(),
                "round timed out but the chain advanced, catching up"
            );
            self.start_new_round(0);
        } else {
            debug!(%view, "round timed out, asking for a round change");
            self.send_next_round_change();
        }
    }

    fn stop_timers(&mut self) {
        if let Some(timer) = self.round_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.future_preprepare_timer.take() {
            timer.abort();
        }
    }

    // ── replay queues ─────────────────────────────────────────────────────

    fn process_backlog(&mut self) {
        let current = self.current_view();
        let waiting = self.waiting_for_round_change;
        let state = self.state;
        let ready = self
            .backlogs
            .drain_ready(|code, view| classify(current, waiting, state, code, view));
        for message in ready {
            let _ = self.internal_tx.send(InternalEvent::Replay { message });
        }
    }

    pub(crate) fn process_pending_requests(&mut self) {
        while let Some(Reverse(head)) = self.pending_requests.peek() {
            if head.sequence > self.current.sequence() {
                break;
            }
            let Reverse(request) = self.pending_requests.pop().expect("peeked request");
            if request.sequence < self.current.sequence() {
                debug!(
                    sequence = request.sequence,
                    "dropping stale pending request"
                );
                continue;
            }
            self.accept_request(request.block);
        }
    }

    pub(crate) fn store_request(&mut self, block: Block) {
        debug!(sequence = block.number(), "parking request for a future height");
        self.pending_requests.push(Reverse(PendingRequest {
            sequence: block.number(),
            block,
        }));
    }

    // ── outbound ──────────────────────────────────────────────────────────

    /// Sign and broadcast a message to the validator set (self included,
    /// via the event-mux loopback).
    pub(crate) fn broadcast(&mut self, message: Message) {
        match self.finalize_message(message) {
            Ok(finalized) => self.backend.broadcast(&self.validators, finalized.encoded()),
            Err(err) => warn!(%err, "failed to finalize outgoing message"),
        }
    }

    /// Attach the committed seal (commit messages) and the envelope
    /// signature.
    fn finalize_message(&self, mut message: Message) -> BftResult<Message> {
        if message.code == MessageCode::Commit {
            if let Some(subject) = self.current.subject() {
                let digest = ibft_types::extra::commit_digest(subject.digest);
                message.committed_seal = self.backend.sign(digest)?;
            }
        }
        message.signature = self.backend.sign(message.sign_hash())?;
        Ok(message)
    }
}

/// Shared view classification used for both live checks and backlog drains.
///
/// Round changes for the current sequence are current at any round at or
/// above ours; for every other code the view must match exactly, the node
/// must not be waiting out a round change, and only preprepares are current
/// while a proposal is still awaited.
fn classify(
    current: View,
    waiting_for_round_change: bool,
    state: State,
    code: MessageCode,
    view: View,
) -> MessageClass {
    if code == MessageCode::RoundChange {
        if view.sequence > current.sequence {
            return MessageClass::Future;
        }
        if view < current {
            return MessageClass::Old;
        }
        return MessageClass::Current;
    }

    if view > current {
        return MessageClass::Future;
    }
    if view < current {
        return MessageClass::Old;
    }
    if waiting_for_round_change {
        return MessageClass::Future;
    }
    if state == State::AcceptRequest && code != MessageCode::Preprepare {
        return MessageClass::Future;
    }
    MessageClass::Current
}

/// View carried by a message payload.
fn message_view(message: &Message) -> Option<View> {
    match message.code {
        MessageCode::Preprepare => message.payload::<Preprepare>().ok().map(|p| p.view),
        _ => message.payload::<Subject>().ok().map(|s| s.view),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
