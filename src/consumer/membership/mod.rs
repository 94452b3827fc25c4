//! Group membership state machine
//!
//! One [`MembershipManager`] implementation serves the consumer, share and
//! streams group protocols. The protocol-specific parts (how a target
//! assignment resolves to partitions, what goes into a heartbeat, which
//! callbacks the application sees) live behind [`MembershipFlavor`].
//!
//! # Reconciliation
//!
//! ```text
//! target received ──► RECONCILING ──► revoke callback ──► assign callback ──► ACKNOWLEDGING
//!                                           │                   │
//!                                           └── failure ────────┴──► stay RECONCILING, retry on next poll
//! ```
//!
//! Each reconciliation captures the manager's generation. Rejoining, fencing,
//! leaving and fatal errors bump the generation, so callbacks that complete
//! after such a transition are ignored instead of re-applying a stale
//! assignment.

mod assignment;
pub mod consumer;
pub mod share;
mod state;
pub mod streams;

pub use assignment::{LocalAssignment, NONE_EPOCH};
pub use consumer::ConsumerFlavor;
pub use share::ShareFlavor;
pub use state::MemberState;
pub use streams::{StreamsAssignment, StreamsFlavor, StreamsTask, TaskKind};

use super::events::{BackgroundEventHandler, BackgroundEvent, CallbackMethod, CallbackPayload};
use super::future::CompletableResult;
use super::heartbeat::HeartbeatSentFields;
use super::metadata::MetadataView;
use super::protocol::{
    RequestBody, ResponseBody, JOIN_GROUP_MEMBER_EPOCH, LEAVE_GROUP_MEMBER_EPOCH,
    LEAVE_GROUP_STATIC_MEMBER_EPOCH,
};
use super::subscription::SubscriptionState;
use super::topic_partition::TopicPartition;
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, KafkaErrorCode, Result};
use crate::metrics;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

// ========== Flavor Seam ==========

/// Resolvable part of a target assignment
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAssignment<A> {
    /// Subset of the target that could be resolved, in the target's shape
    pub assignment: A,
    /// Partitions the member owns once the resolved assignment is applied
    pub partitions: BTreeSet<TopicPartition>,
}

/// Member fields available when building a heartbeat
pub struct HeartbeatContext<'a, A> {
    pub group_id: &'a str,
    pub member_id: &'a str,
    pub member_epoch: i32,
    pub state: MemberState,
    pub instance_id: Option<&'a str>,
    pub rack_id: Option<&'a str>,
    pub server_assignor: Option<&'a str>,
    pub rebalance_timeout_ms: i32,
    pub subscription: &'a BTreeSet<String>,
    pub current_assignment: &'a LocalAssignment<A>,
}

impl<A> HeartbeatContext<'_, A> {
    /// Every field is sent while joining; afterwards only what changed
    pub fn send_all_fields(&self) -> bool {
        self.state == MemberState::Joining
    }
}

/// Protocol-independent view of a heartbeat response
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatResponseData<A> {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub member_id: Option<String>,
    pub member_epoch: i32,
    pub heartbeat_interval_ms: i32,
    /// New target assignment; `None` when unchanged
    pub assignment: Option<A>,
}

impl<A> HeartbeatResponseData<A> {
    pub fn error(&self) -> KafkaErrorCode {
        KafkaErrorCode::from_i16(self.error_code)
    }
}

/// Protocol-specific behavior of a group type
pub trait MembershipFlavor {
    /// Target assignment as carried by heartbeat responses
    type Assignment: Clone + fmt::Debug + Default + PartialEq;

    /// Metric and log label
    const GROUP_TYPE: &'static str;

    /// Whether a configured group instance id makes this a static member
    fn supports_static_membership(&self) -> bool {
        true
    }

    /// Resolve the target into owned partitions, asking metadata for anything unknown
    fn resolve_assignment(
        &mut self,
        target: &Self::Assignment,
        metadata: &mut dyn MetadataView,
    ) -> ResolvedAssignment<Self::Assignment>;

    /// Payload of the callback the application must run, or `None` to skip it.
    ///
    /// `from` is the currently owned assignment and `to` the one being
    /// applied; `partitions` are the revoked, added or lost partitions.
    fn callback_payload(
        &self,
        method: CallbackMethod,
        from: &Self::Assignment,
        to: &Self::Assignment,
        partitions: &BTreeSet<TopicPartition>,
        has_listener: bool,
    ) -> Option<CallbackPayload>;

    fn build_heartbeat_request(
        &self,
        context: &HeartbeatContext<'_, Self::Assignment>,
        sent: &mut HeartbeatSentFields<Self::Assignment>,
    ) -> RequestBody;

    fn parse_heartbeat_response(
        &self,
        response: ResponseBody,
    ) -> Result<HeartbeatResponseData<Self::Assignment>>;
}

/// Observer of member epoch and assignment changes
pub trait MemberStateListener: Send + Sync {
    /// `epoch` is `None` once the member can no longer heartbeat
    fn on_member_epoch_updated(&self, epoch: Option<i32>, member_id: &str);

    fn on_group_assignment_updated(&self, partitions: &BTreeSet<TopicPartition>);
}

// ========== Manager ==========

/// What to do when a rebalance callback completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuation {
    Revoked,
    Assigned,
    LostOnFenced,
    LostOnFatal,
    LostOnStale,
    Leaving,
}

#[derive(Debug, Clone, Copy)]
struct PendingCallback {
    method: CallbackMethod,
    continuation: Continuation,
    generation: u64,
}

#[derive(Debug, Clone)]
struct Reconciliation<A> {
    generation: u64,
    resolved: LocalAssignment<A>,
    assigned: BTreeSet<TopicPartition>,
    added: BTreeSet<TopicPartition>,
}

pub struct MembershipManager<F: MembershipFlavor> {
    flavor: F,
    group_id: String,
    group_instance_id: Option<String>,
    rack_id: Option<String>,
    server_assignor: Option<String>,
    rebalance_timeout_ms: i32,
    member_id: String,
    member_epoch: i32,
    state: MemberState,
    subscriptions: SubscriptionState,
    subscription_updated: bool,
    current_assignment: LocalAssignment<F::Assignment>,
    current_target: LocalAssignment<F::Assignment>,
    reconciliation: Option<Reconciliation<F::Assignment>>,
    generation: u64,
    pending_callbacks: BTreeMap<u64, PendingCallback>,
    next_callback_id: u64,
    leave_waiters: Vec<CompletableResult<()>>,
    poll_timer_expired: bool,
    stale_release_pending: bool,
    rejoin_when_released: bool,
    listeners: Vec<Arc<dyn MemberStateListener>>,
    background: BackgroundEventHandler,
}

impl<F: MembershipFlavor> MembershipManager<F> {
    pub fn new(flavor: F, config: &ConsumerConfig, background: BackgroundEventHandler) -> Self {
        let group_instance_id = if flavor.supports_static_membership() {
            config.group_instance_id.clone()
        } else {
            None
        };
        Self {
            flavor,
            group_id: config.group_id.clone(),
            group_instance_id,
            rack_id: config.client_rack.clone(),
            server_assignor: config.group_remote_assignor.clone(),
            rebalance_timeout_ms: config.rebalance_timeout_ms(),
            member_id: Uuid::new_v4().to_string(),
            member_epoch: JOIN_GROUP_MEMBER_EPOCH,
            state: MemberState::Unsubscribed,
            subscriptions: SubscriptionState::new(),
            subscription_updated: false,
            current_assignment: LocalAssignment::none(),
            current_target: LocalAssignment::none(),
            reconciliation: None,
            generation: 0,
            pending_callbacks: BTreeMap::new(),
            next_callback_id: 0,
            leave_waiters: Vec::new(),
            poll_timer_expired: false,
            stale_release_pending: false,
            rejoin_when_released: false,
            listeners: Vec::new(),
            background,
        }
    }

    // ========== Accessors ==========

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn group_instance_id(&self) -> Option<&str> {
        self.group_instance_id.as_deref()
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn member_epoch(&self) -> i32 {
        self.member_epoch
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn flavor(&self) -> &F {
        &self.flavor
    }

    pub fn subscriptions(&self) -> &SubscriptionState {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionState {
        &mut self.subscriptions
    }

    pub fn current_assignment(&self) -> &LocalAssignment<F::Assignment> {
        &self.current_assignment
    }

    pub fn target_assignment(&self) -> &LocalAssignment<F::Assignment> {
        &self.current_target
    }

    pub fn reconciliation_in_progress(&self) -> bool {
        self.reconciliation.is_some()
    }

    pub fn is_leaving_group(&self) -> bool {
        self.state.is_leaving_group()
    }

    pub fn should_skip_heartbeat(&self) -> bool {
        self.state.should_skip_heartbeat()
    }

    pub fn should_heartbeat_now(&self) -> bool {
        self.state.should_not_wait_for_heartbeat_interval()
    }

    pub fn is_poll_timer_expired(&self) -> bool {
        self.poll_timer_expired
    }

    pub fn pending_callback_count(&self) -> usize {
        self.pending_callbacks.len()
    }

    pub fn register_state_listener(&mut self, listener: Arc<dyn MemberStateListener>) {
        self.listeners.push(listener);
    }

    fn target_assignment_reconciled(&self) -> bool {
        self.current_assignment == self.current_target
    }

    fn leave_epoch(&self) -> i32 {
        if self.group_instance_id.is_some() {
            LEAVE_GROUP_STATIC_MEMBER_EPOCH
        } else {
            LEAVE_GROUP_MEMBER_EPOCH
        }
    }

    // ========== Transitions ==========

    fn transition_to(&mut self, next: MemberState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ConsumerError::illegal_state(
                "member state transition",
                format!("invalid transition from {} to {}", self.state, next),
            ));
        }
        if self.state != next {
            info!(
                group_id = %self.group_id,
                member_id = %self.member_id,
                member_epoch = self.member_epoch,
                from = %self.state,
                to = %next,
                "Member state transition"
            );
            metrics::record_member_transition(next.as_str());
        }
        self.state = next;
        Ok(())
    }

    /// Transition from a call site that already checked the source state
    fn set_state(&mut self, next: MemberState) {
        if let Err(err) = self.transition_to(next) {
            error!(
                group_id = %self.group_id,
                member_id = %self.member_id,
                error = %err,
                "Rejected member state transition"
            );
        }
    }

    fn update_member_epoch(&mut self, epoch: i32) {
        if self.member_epoch != epoch {
            self.member_epoch = epoch;
            self.notify_epoch_change(Some(epoch));
        }
    }

    fn notify_epoch_change(&self, epoch: Option<i32>) {
        for listener in &self.listeners {
            listener.on_member_epoch_updated(epoch, &self.member_id);
        }
    }

    fn notify_assignment_change(&self, partitions: &BTreeSet<TopicPartition>) {
        for listener in &self.listeners {
            listener.on_group_assignment_updated(partitions);
        }
    }

    /// Subscription changed; joining happens on the next application poll
    pub fn on_subscription_updated(&mut self) {
        self.subscription_updated = true;
    }

    pub fn on_consumer_poll(&mut self) {
        if std::mem::take(&mut self.subscription_updated) && self.state == MemberState::Unsubscribed {
            self.transition_to_joining();
        }
    }

    pub fn transition_to_joining(&mut self) {
        if self.state == MemberState::Fatal {
            warn!(
                group_id = %self.group_id,
                member_id = %self.member_id,
                "Member is in FATAL state and cannot rejoin the group"
            );
            return;
        }
        self.generation += 1;
        self.update_member_epoch(JOIN_GROUP_MEMBER_EPOCH);
        match self.transition_to(MemberState::Joining) {
            Ok(()) => self.current_target = LocalAssignment::none(),
            Err(err) => debug!(error = %err, "Member cannot rejoin from its current state"),
        }
    }

    pub fn on_heartbeat_success(&mut self, response: HeartbeatResponseData<F::Assignment>) {
        if self.state == MemberState::Leaving {
            debug!(
                member_id = %self.member_id,
                member_epoch = self.member_epoch,
                "Ignoring heartbeat response, member is already leaving the group"
            );
            return;
        }
        if self.state == MemberState::Unsubscribed && self.maybe_complete_leave_in_progress() {
            debug!(
                member_id = %self.member_id,
                "Leave heartbeat answered, leave operation completed"
            );
            return;
        }
        if self.state.is_not_in_group() {
            debug!(
                member_id = %self.member_id,
                state = %self.state,
                "Ignoring heartbeat response, member is not in the group"
            );
            return;
        }

        if let Some(member_id) = response.member_id.filter(|id| !id.is_empty()) {
            self.member_id = member_id;
        }
        self.update_member_epoch(response.member_epoch);

        let Some(assignment) = response.assignment else {
            return;
        };
        if !self.state.can_handle_new_assignment() {
            debug!(
                state = %self.state,
                "Ignoring new assignment received while member cannot handle it"
            );
            return;
        }
        self.process_assignment_received(assignment);
    }

    fn process_assignment_received(&mut self, assignment: F::Assignment) {
        if let Some(updated) = self.current_target.update_with(&assignment) {
            debug!(
                member_id = %self.member_id,
                local_epoch = updated.local_epoch(),
                target = ?updated.assignment(),
                "Received new target assignment"
            );
            self.current_target = updated;
        }

        if !self.target_assignment_reconciled() {
            self.set_state(MemberState::Reconciling);
        } else if matches!(self.state, MemberState::Reconciling | MemberState::Joining) {
            debug!(
                member_id = %self.member_id,
                "Target assignment equals the current assignment, nothing to reconcile"
            );
            self.set_state(MemberState::Stable);
        }
    }

    /// Run reconciliation when a target is pending; called every background loop
    pub fn poll(&mut self, metadata: &mut dyn MetadataView) {
        if self.state == MemberState::Reconciling {
            self.maybe_reconcile(metadata);
        }
    }

    fn maybe_reconcile(&mut self, metadata: &mut dyn MetadataView) {
        if self.target_assignment_reconciled() {
            trace!("Target assignment already reconciled");
            return;
        }
        if self.reconciliation.is_some() {
            trace!("Reconciliation already in progress");
            return;
        }

        let target_epoch = self.current_target.local_epoch();
        let resolved = self
            .flavor
            .resolve_assignment(self.current_target.assignment(), metadata);
        let resolved_assignment = LocalAssignment::new(target_epoch, resolved.assignment);

        if !self.current_assignment.is_none()
            && resolved_assignment.assignment() == self.current_assignment.assignment()
        {
            debug!(
                member_id = %self.member_id,
                "Resolvable part of the target equals the current assignment, acknowledging it"
            );
            self.current_assignment = resolved_assignment;
            self.set_state(MemberState::Acknowledging);
            return;
        }

        // Partitions still awaiting a successful assign callback count as
        // added again, and are never offered to the revoke callback
        let owned = self.subscriptions.enabled_partitions();
        let assigned = resolved.partitions;
        let added: BTreeSet<_> = assigned.difference(&owned).cloned().collect();
        let revoked: BTreeSet<_> = owned.difference(&assigned).cloned().collect();
        info!(
            group_id = %self.group_id,
            member_id = %self.member_id,
            assigned = ?assigned,
            added = ?added,
            revoked = ?revoked,
            "Reconciling target assignment"
        );

        self.reconciliation = Some(Reconciliation {
            generation: self.generation,
            resolved: resolved_assignment,
            assigned,
            added,
        });

        if revoked.is_empty() {
            self.assign_partitions();
            return;
        }

        self.subscriptions.mark_pending_revocation(&revoked);
        let payload = self.flavor.callback_payload(
            CallbackMethod::Revoked,
            self.current_assignment.assignment(),
            self.current_target.assignment(),
            &revoked,
            self.subscriptions.has_rebalance_listener(),
        );
        self.signal(CallbackMethod::Revoked, payload, Continuation::Revoked);
    }

    fn assign_partitions(&mut self) {
        let Some(reconciliation) = self.reconciliation.clone() else {
            return;
        };
        self.subscriptions
            .assign_from_subscribed_awaiting_callback(&reconciliation.assigned, &reconciliation.added);
        self.notify_assignment_change(&reconciliation.assigned);

        let payload = self.flavor.callback_payload(
            CallbackMethod::Assigned,
            self.current_assignment.assignment(),
            reconciliation.resolved.assignment(),
            &reconciliation.added,
            self.subscriptions.has_rebalance_listener(),
        );
        self.signal(CallbackMethod::Assigned, payload, Continuation::Assigned);
    }

    fn on_revocation_completed(&mut self, generation: u64, result: Result<()>) {
        if let Err(err) = result {
            error!(
                member_id = %self.member_id,
                error = %err,
                "Reconciliation failed, revocation callback did not complete"
            );
            self.reconciliation = None;
            return;
        }
        if self.maybe_abort_reconciliation(generation) {
            return;
        }
        self.assign_partitions();
    }

    fn on_assignment_completed(&mut self, generation: u64, result: Result<()>) {
        let Some(reconciliation) = self.reconciliation.clone() else {
            return;
        };
        if let Err(err) = result {
            if !reconciliation.added.is_empty() {
                warn!(
                    added = ?reconciliation.added,
                    error = %err,
                    "Newly assigned partitions stay non-fetchable after the assign callback failed"
                );
            }
            error!(member_id = %self.member_id, error = %err, "Reconciliation failed");
            self.reconciliation = None;
            return;
        }

        self.subscriptions
            .enable_partitions_awaiting_callback(&reconciliation.added);
        if self.maybe_abort_reconciliation(generation) {
            return;
        }
        self.current_assignment = reconciliation.resolved;
        self.set_state(MemberState::Acknowledging);
        self.reconciliation = None;
    }

    fn maybe_abort_reconciliation(&mut self, generation: u64) -> bool {
        let rejoined = generation != self.generation;
        let should_abort = self.state != MemberState::Reconciling || rejoined;
        if should_abort {
            let reason = if rejoined {
                "the member has re-joined the group".to_string()
            } else {
                format!("the member already transitioned to {}", self.state)
            };
            info!(
                member_id = %self.member_id,
                reason = %reason,
                "Interrupting reconciliation that is not relevant anymore"
            );
            self.reconciliation = None;
        }
        should_abort
    }

    // ========== Callbacks ==========

    /// Ask the application to run a callback, or continue right away when
    /// there is nothing to run
    fn signal(
        &mut self,
        method: CallbackMethod,
        payload: Option<CallbackPayload>,
        continuation: Continuation,
    ) {
        let generation = self.generation;
        match payload {
            Some(payload) => {
                let id = self.next_callback_id;
                self.next_callback_id += 1;
                self.pending_callbacks.insert(
                    id,
                    PendingCallback {
                        method,
                        continuation,
                        generation,
                    },
                );
                debug!(id, method = method.as_str(), "Requesting rebalance callback");
                self.background
                    .add(BackgroundEvent::RebalanceCallbackNeeded { id, method, payload });
            }
            None => self.run_continuation(continuation, generation, Ok(())),
        }
    }

    /// The application finished running callback `id`
    pub fn on_callback_completed(&mut self, id: u64, result: Result<()>) {
        let Some(pending) = self.pending_callbacks.remove(&id) else {
            debug!(id, "Ignoring completion of unknown rebalance callback");
            return;
        };
        metrics::record_rebalance_callback(pending.method.as_str(), result.is_ok());
        self.run_continuation(pending.continuation, pending.generation, result);
    }

    fn run_continuation(&mut self, continuation: Continuation, generation: u64, result: Result<()>) {
        match continuation {
            Continuation::Revoked => self.on_revocation_completed(generation, result),
            Continuation::Assigned => self.on_assignment_completed(generation, result),
            Continuation::LostOnFenced => {
                if let Err(err) = &result {
                    error!(error = %err, "Lost callback failed after the member got fenced, rejoining anyway");
                }
                self.clear_assignment();
                if self.state == MemberState::Fenced {
                    self.transition_to_joining();
                } else {
                    debug!(
                        state = %self.state,
                        "Fenced member released its assignment but already left FENCED, not rejoining"
                    );
                }
            }
            Continuation::LostOnFatal => {
                if let Err(err) = &result {
                    error!(error = %err, "Lost callback failed after the member turned fatal");
                }
                self.clear_assignment();
            }
            Continuation::LostOnStale => {
                if let Err(err) = &result {
                    error!(error = %err, "Lost callback failed while the member was stale");
                }
                self.clear_assignment();
                self.stale_release_pending = false;
                debug!(
                    member_id = %self.member_id,
                    "Stale member released its assignment, it rejoins once the poll timer is reset"
                );
                if std::mem::take(&mut self.rejoin_when_released) && self.state == MemberState::Stale {
                    self.transition_to_joining();
                }
            }
            Continuation::Leaving => {
                match &result {
                    Ok(()) => info!(
                        member_id = %self.member_id,
                        "Released assignment, sending leave group heartbeat"
                    ),
                    Err(err) => error!(
                        member_id = %self.member_id,
                        error = %err,
                        "Callback releasing the assignment failed, sending leave group heartbeat anyway"
                    ),
                }
                self.subscriptions.unsubscribe();
                self.notify_assignment_change(&BTreeSet::new());
                self.clear_assignment();
                self.transition_to_sending_leave_group(false);
            }
        }
    }

    /// Ask the application to drop every owned partition or task
    fn signal_all_lost(&mut self, continuation: Continuation) {
        let owned = self.subscriptions.assigned_partitions();
        let payload = self.flavor.callback_payload(
            CallbackMethod::Lost,
            self.current_assignment.assignment(),
            &F::Assignment::default(),
            &owned,
            self.subscriptions.has_rebalance_listener(),
        );
        self.signal(CallbackMethod::Lost, payload, continuation);
    }

    fn clear_assignment(&mut self) {
        if self.subscriptions.num_assigned_partitions() > 0 {
            self.subscriptions.assign_from_subscribed(&BTreeSet::new());
            self.notify_assignment_change(&BTreeSet::new());
        }
        self.current_assignment = LocalAssignment::none();
        self.current_target = LocalAssignment::none();
    }

    // ========== Fencing, Fatal, Stale ==========

    pub fn transition_to_fenced(&mut self) {
        match self.state {
            MemberState::PrepareLeaving => {
                info!(
                    member_id = %self.member_id,
                    member_epoch = self.member_epoch,
                    "Member got fenced while preparing to leave, it will not send the leave request or rejoin"
                );
                self.finalize_leaving();
                self.set_state(MemberState::Unsubscribed);
                self.maybe_complete_leave_in_progress();
                return;
            }
            MemberState::Leaving => {
                debug!(
                    member_id = %self.member_id,
                    "Member got fenced before sending the leave heartbeat, it will not rejoin"
                );
                self.set_state(MemberState::Unsubscribed);
                self.maybe_complete_leave_in_progress();
                return;
            }
            MemberState::Unsubscribed => {
                debug!(member_id = %self.member_id, "Member got fenced but already left the group");
                return;
            }
            _ => {}
        }

        if let Err(err) = self.transition_to(MemberState::Fenced) {
            debug!(error = %err, "Ignoring fencing");
            return;
        }
        self.generation += 1;
        self.update_member_epoch(JOIN_GROUP_MEMBER_EPOCH);
        debug!(
            member_id = %self.member_id,
            "Member fenced, releasing assignment before rejoining"
        );
        self.signal_all_lost(Continuation::LostOnFenced);
    }

    pub fn transition_to_fatal(&mut self) {
        let previous = self.state;
        if let Err(err) = self.transition_to(MemberState::Fatal) {
            debug!(error = %err, "Member is already fatal");
            return;
        }
        self.generation += 1;
        error!(
            group_id = %self.group_id,
            member_id = %self.member_id,
            member_epoch = self.member_epoch,
            "Member transitioned to fatal state"
        );
        self.notify_epoch_change(None);

        if previous == MemberState::Unsubscribed {
            debug!("Member got fatal error while already out of the group");
            return;
        }
        if previous.is_leaving_group() {
            info!(
                member_id = %self.member_id,
                "Member was leaving the group when it got a fatal error, discarding the ongoing leave"
            );
            self.maybe_complete_leave_in_progress();
            return;
        }
        self.signal_all_lost(Continuation::LostOnFatal);
    }

    /// Member sent the leave heartbeat after the poll timer expired
    fn transition_to_stale(&mut self) {
        if let Err(err) = self.transition_to(MemberState::Stale) {
            debug!(error = %err, "Member cannot become stale from its current state");
            return;
        }
        self.generation += 1;
        self.stale_release_pending = true;
        self.signal_all_lost(Continuation::LostOnStale);
    }

    /// The application polled again after the poll timer expired
    pub fn maybe_rejoin_stale_member(&mut self) {
        self.poll_timer_expired = false;
        if self.state != MemberState::Stale {
            return;
        }
        if self.stale_release_pending {
            debug!(
                member_id = %self.member_id,
                "Poll timer reset, stale member rejoins once its assignment is released"
            );
            self.rejoin_when_released = true;
        } else {
            self.transition_to_joining();
        }
    }

    // ========== Leaving ==========

    /// Release the assignment and leave the group; `result` completes once the
    /// leave heartbeat has been answered or skipped
    pub fn leave_group(&mut self, result: CompletableResult<()>) {
        if self.state.is_not_in_group() {
            if matches!(self.state, MemberState::Fenced | MemberState::Stale) {
                self.clear_assignment();
                self.set_state(MemberState::Unsubscribed);
            }
            self.subscriptions.unsubscribe();
            self.notify_assignment_change(&BTreeSet::new());
            result.complete(());
            return;
        }
        if self.state.is_leaving_group() {
            debug!(member_id = %self.member_id, "Leave group already in progress");
            self.leave_waiters.push(result);
            return;
        }

        if let Err(err) = self.transition_to(MemberState::PrepareLeaving) {
            debug!(error = %err, "Leave requested while not in the group");
            result.complete(());
            return;
        }
        self.generation += 1;
        self.leave_waiters.push(result);

        let owned = self.subscriptions.assigned_partitions();
        if owned.is_empty() {
            self.run_continuation(Continuation::Leaving, self.generation, Ok(()));
            return;
        }
        let has_listener = self.subscriptions.has_rebalance_listener();
        let (method, payload) = if self.member_epoch > 0 {
            self.subscriptions.mark_pending_revocation(&owned);
            let payload = self.flavor.callback_payload(
                CallbackMethod::Revoked,
                self.current_assignment.assignment(),
                &F::Assignment::default(),
                &owned,
                has_listener,
            );
            (CallbackMethod::Revoked, payload)
        } else {
            let payload = self.flavor.callback_payload(
                CallbackMethod::Lost,
                self.current_assignment.assignment(),
                &F::Assignment::default(),
                &owned,
                has_listener,
            );
            (CallbackMethod::Lost, payload)
        };
        self.signal(method, payload, Continuation::Leaving);
    }

    /// Move to `Leaving` so the next heartbeat carries the leave epoch
    pub fn transition_to_sending_leave_group(&mut self, due_to_expired_poll_timer: bool) {
        match self.state {
            MemberState::Fatal => {
                warn!(member_id = %self.member_id, "Member in FATAL state will not send a leave group request");
                return;
            }
            MemberState::Unsubscribed => {
                warn!(member_id = %self.member_id, "Member already out of the group will not send a leave group request");
                return;
            }
            _ => {}
        }
        if due_to_expired_poll_timer {
            self.poll_timer_expired = true;
            if self.state != MemberState::PrepareLeaving {
                if let Err(err) = self.transition_to(MemberState::PrepareLeaving) {
                    debug!(error = %err, "Skipping leave after poll timer expiry");
                    return;
                }
            }
            self.generation += 1;
        }
        self.finalize_leaving();
        self.set_state(MemberState::Leaving);
    }

    fn finalize_leaving(&mut self) {
        let epoch = self.leave_epoch();
        self.update_member_epoch(epoch);
        self.current_assignment = LocalAssignment::none();
    }

    fn maybe_complete_leave_in_progress(&mut self) -> bool {
        if self.leave_waiters.is_empty() {
            return false;
        }
        for waiter in self.leave_waiters.drain(..) {
            waiter.complete(());
        }
        true
    }

    pub fn has_leave_in_progress(&self) -> bool {
        !self.leave_waiters.is_empty()
    }

    // ========== Heartbeat Hooks ==========

    pub fn on_heartbeat_request_generated(&mut self) {
        match self.state {
            MemberState::Acknowledging => {
                if self.target_assignment_reconciled() {
                    self.set_state(MemberState::Stable);
                } else {
                    debug!(
                        member_id = %self.member_id,
                        "Heartbeat acknowledged the previous reconciliation, new target ready to reconcile"
                    );
                    self.set_state(MemberState::Reconciling);
                }
            }
            MemberState::Leaving => {
                if self.poll_timer_expired {
                    debug!(
                        member_id = %self.member_id,
                        "Leave heartbeat generated after poll timer expiry, member stays stale until next poll"
                    );
                    self.transition_to_stale();
                } else {
                    debug!(member_id = %self.member_id, "Leave heartbeat generated");
                    self.set_state(MemberState::Unsubscribed);
                }
            }
            _ => {}
        }
    }

    pub fn on_heartbeat_request_skipped(&mut self) {
        if self.state == MemberState::Leaving {
            warn!(
                member_id = %self.member_id,
                "Leave heartbeat cannot be sent, most likely the coordinator is unknown. Member transitions to UNSUBSCRIBED"
            );
            self.set_state(MemberState::Unsubscribed);
            self.maybe_complete_leave_in_progress();
        }
    }

    pub fn on_heartbeat_failure(&mut self, retriable: bool) {
        if self.state == MemberState::Unsubscribed && self.maybe_complete_leave_in_progress() {
            warn!(
                member_id = %self.member_id,
                retriable,
                "Leave heartbeat failed, leave operation completed anyway"
            );
        }
    }

    pub fn build_heartbeat_request(&self, sent: &mut HeartbeatSentFields<F::Assignment>) -> RequestBody {
        let context = HeartbeatContext {
            group_id: &self.group_id,
            member_id: &self.member_id,
            member_epoch: self.member_epoch,
            state: self.state,
            instance_id: self.group_instance_id.as_deref(),
            rack_id: self.rack_id.as_deref(),
            server_assignor: self.server_assignor.as_deref(),
            rebalance_timeout_ms: self.rebalance_timeout_ms,
            subscription: self.subscriptions.subscription(),
            current_assignment: &self.current_assignment,
        };
        self.flavor.build_heartbeat_request(&context, sent)
    }

    pub fn parse_heartbeat_response(
        &self,
        response: ResponseBody,
    ) -> Result<HeartbeatResponseData<F::Assignment>> {
        self.flavor.parse_heartbeat_response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::events::{event_queue, EventReceiver};
    use crate::consumer::metadata::ClusterMetadata;
    use crate::consumer::protocol::Node;
    use parking_lot::Mutex;

    fn config() -> ConsumerConfig {
        ConsumerConfig::builder().group_id("group").build()
    }

    struct Fixture {
        manager: MembershipManager<ConsumerFlavor>,
        events: EventReceiver<BackgroundEvent>,
        metadata: ClusterMetadata,
        topic_id: Uuid,
    }

    fn fixture() -> Fixture {
        let (tx, events) = event_queue("background");
        let mut manager =
            MembershipManager::new(ConsumerFlavor::new(), &config(), BackgroundEventHandler::new(tx));
        let topic_id = Uuid::new_v4();
        let mut metadata = ClusterMetadata::new();
        metadata.add_node(Node::new(1, "localhost", 9092));
        metadata.update_topic("orders", topic_id, &[(0, 1, 0), (1, 1, 0), (2, 1, 0)]);
        manager
            .subscriptions_mut()
            .subscribe(BTreeSet::from(["orders".to_string()]), true);
        manager.on_subscription_updated();
        manager.on_consumer_poll();
        Fixture {
            manager,
            events,
            metadata,
            topic_id,
        }
    }

    fn response(epoch: i32, assignment: Option<BTreeMap<Uuid, BTreeSet<i32>>>) -> HeartbeatResponseData<BTreeMap<Uuid, BTreeSet<i32>>> {
        HeartbeatResponseData {
            error_code: 0,
            error_message: None,
            member_id: Some("member-1".to_string()),
            member_epoch: epoch,
            heartbeat_interval_ms: 1_000,
            assignment,
        }
    }

    fn callbacks(events: &mut EventReceiver<BackgroundEvent>) -> Vec<(u64, CallbackMethod, CallbackPayload)> {
        events
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                BackgroundEvent::RebalanceCallbackNeeded { id, method, payload } => {
                    Some((id, method, payload))
                }
                _ => None,
            })
            .collect()
    }

    fn partitions(ids: &[i32]) -> BTreeSet<TopicPartition> {
        ids.iter().map(|p| TopicPartition::new("orders", *p)).collect()
    }

    #[test]
    fn test_join_assign_acknowledge_stable() {
        let mut f = fixture();
        assert_eq!(f.manager.state(), MemberState::Joining);

        let target = BTreeMap::from([(f.topic_id, BTreeSet::from([0]))]);
        f.manager.on_heartbeat_success(response(1, Some(target)));
        assert_eq!(f.manager.state(), MemberState::Reconciling);
        assert_eq!(f.manager.member_id(), "member-1");

        f.manager.poll(&mut f.metadata);
        let requested = callbacks(&mut f.events);
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].1, CallbackMethod::Assigned);
        assert!(!f.manager.subscriptions().is_fetchable(&TopicPartition::new("orders", 0)));

        f.manager.on_callback_completed(requested[0].0, Ok(()));
        assert_eq!(f.manager.state(), MemberState::Acknowledging);
        assert!(f.manager.subscriptions().is_fetchable(&TopicPartition::new("orders", 0)));

        f.manager.on_heartbeat_request_generated();
        assert_eq!(f.manager.state(), MemberState::Stable);
    }

    #[test]
    fn test_empty_assignment_while_joining_goes_stable() {
        let mut f = fixture();
        f.manager
            .on_heartbeat_success(response(1, Some(BTreeMap::new())));
        assert_eq!(f.manager.state(), MemberState::Stable);
    }

    #[test]
    fn test_revoke_completes_before_assign_is_requested() {
        let mut f = fixture();
        let first = BTreeMap::from([(f.topic_id, BTreeSet::from([0, 1]))]);
        f.manager.on_heartbeat_success(response(1, Some(first)));
        f.manager.poll(&mut f.metadata);
        let assign = callbacks(&mut f.events);
        f.manager.on_callback_completed(assign[0].0, Ok(()));
        f.manager.on_heartbeat_request_generated();
        assert_eq!(f.manager.state(), MemberState::Stable);

        let second = BTreeMap::from([(f.topic_id, BTreeSet::from([1, 2]))]);
        f.manager.on_heartbeat_success(response(2, Some(second)));
        f.manager.poll(&mut f.metadata);

        let revoke = callbacks(&mut f.events);
        assert_eq!(revoke.len(), 1);
        assert_eq!(revoke[0].1, CallbackMethod::Revoked);
        assert_eq!(revoke[0].2, CallbackPayload::Partitions(partitions(&[0])));
        assert!(!f.manager.subscriptions().is_fetchable(&TopicPartition::new("orders", 0)));

        f.manager.poll(&mut f.metadata);
        assert!(callbacks(&mut f.events).is_empty());

        f.manager.on_callback_completed(revoke[0].0, Ok(()));
        let assign = callbacks(&mut f.events);
        assert_eq!(assign.len(), 1);
        assert_eq!(assign[0].1, CallbackMethod::Assigned);
        assert_eq!(assign[0].2, CallbackPayload::Partitions(partitions(&[2])));
        assert_eq!(f.manager.subscriptions().assigned_partitions(), partitions(&[1, 2]));
    }

    #[test]
    fn test_failed_callback_retries_on_next_poll() {
        let mut f = fixture();
        let target = BTreeMap::from([(f.topic_id, BTreeSet::from([0]))]);
        f.manager.on_heartbeat_success(response(1, Some(target)));
        f.manager.poll(&mut f.metadata);
        let first = callbacks(&mut f.events);
        f.manager
            .on_callback_completed(first[0].0, Err(ConsumerError::Callback("boom".into())));
        assert_eq!(f.manager.state(), MemberState::Reconciling);
        assert!(!f.manager.reconciliation_in_progress());
        assert!(!f.manager.subscriptions().is_fetchable(&TopicPartition::new("orders", 0)));

        f.manager.poll(&mut f.metadata);
        let retry = callbacks(&mut f.events);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].1, CallbackMethod::Assigned);
        // the retry offers the partition the failed callback never confirmed
        assert_eq!(retry[0].2, first[0].2);
        assert_eq!(retry[0].2, CallbackPayload::Partitions(partitions(&[0])));
        assert!(!f.manager.subscriptions().is_fetchable(&TopicPartition::new("orders", 0)));

        f.manager.on_callback_completed(retry[0].0, Ok(()));
        assert_eq!(f.manager.state(), MemberState::Acknowledging);
        assert!(f.manager.subscriptions().is_fetchable(&TopicPartition::new("orders", 0)));
    }

    #[test]
    fn test_unconfirmed_partition_dropped_without_revoke_callback() {
        let mut f = fixture();
        let target = BTreeMap::from([(f.topic_id, BTreeSet::from([0]))]);
        f.manager.on_heartbeat_success(response(1, Some(target)));
        f.manager.poll(&mut f.metadata);
        let first = callbacks(&mut f.events);
        f.manager
            .on_callback_completed(first[0].0, Err(ConsumerError::Callback("boom".into())));

        let moved = BTreeMap::from([(f.topic_id, BTreeSet::from([1]))]);
        f.manager.on_heartbeat_success(response(2, Some(moved)));
        f.manager.poll(&mut f.metadata);
        let requested = callbacks(&mut f.events);
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].1, CallbackMethod::Assigned);
        assert_eq!(requested[0].2, CallbackPayload::Partitions(partitions(&[1])));
        assert_eq!(f.manager.subscriptions().assigned_partitions(), partitions(&[1]));

        f.manager.on_callback_completed(requested[0].0, Ok(()));
        assert_eq!(f.manager.subscriptions().fetchable_partitions(), vec![TopicPartition::new("orders", 1)]);
    }

    #[test]
    fn test_fenced_during_reconciliation_aborts_stale_callback() {
        let mut f = fixture();
        let target = BTreeMap::from([(f.topic_id, BTreeSet::from([0]))]);
        f.manager.on_heartbeat_success(response(1, Some(target)));
        f.manager.poll(&mut f.metadata);
        let assign = callbacks(&mut f.events);

        f.manager.transition_to_fenced();
        assert_eq!(f.manager.state(), MemberState::Fenced);
        assert_eq!(f.manager.member_epoch(), 0);
        let lost = callbacks(&mut f.events);
        assert_eq!(lost[0].1, CallbackMethod::Lost);

        f.manager.on_callback_completed(lost[0].0, Ok(()));
        assert_eq!(f.manager.state(), MemberState::Joining);

        f.manager.on_callback_completed(assign[0].0, Ok(()));
        assert_eq!(f.manager.state(), MemberState::Joining);
        assert!(f.manager.current_assignment().is_none());
        assert!(!f.manager.reconciliation_in_progress());
    }

    #[test]
    fn test_leave_group_revokes_then_sends_leave() {
        let mut f = fixture();
        let target = BTreeMap::from([(f.topic_id, BTreeSet::from([0]))]);
        f.manager.on_heartbeat_success(response(3, Some(target)));
        f.manager.poll(&mut f.metadata);
        let assign = callbacks(&mut f.events);
        f.manager.on_callback_completed(assign[0].0, Ok(()));

        let leave = CompletableResult::new();
        f.manager.leave_group(leave.clone());
        assert_eq!(f.manager.state(), MemberState::PrepareLeaving);
        let revoke = callbacks(&mut f.events);
        assert_eq!(revoke[0].1, CallbackMethod::Revoked);

        let second = CompletableResult::new();
        f.manager.leave_group(second.clone());

        f.manager.on_callback_completed(revoke[0].0, Ok(()));
        assert_eq!(f.manager.state(), MemberState::Leaving);
        assert_eq!(f.manager.member_epoch(), LEAVE_GROUP_MEMBER_EPOCH);
        assert!(f.manager.subscriptions().subscription().is_empty());

        f.manager.on_heartbeat_request_generated();
        assert_eq!(f.manager.state(), MemberState::Unsubscribed);
        assert!(!leave.is_done());

        f.manager.on_heartbeat_success(response(-1, None));
        assert!(leave.is_done());
        assert!(second.is_done());
    }

    #[test]
    fn test_leave_when_not_in_group_completes_immediately() {
        let (tx, _events) = event_queue("background");
        let mut manager =
            MembershipManager::new(ShareFlavor::new(), &config(), BackgroundEventHandler::new(tx));
        let leave = CompletableResult::new();
        manager.leave_group(leave.clone());
        assert_eq!(leave.try_get(), Some(Ok(())));
        assert_eq!(manager.state(), MemberState::Unsubscribed);
    }

    #[test]
    fn test_poll_timer_expiry_goes_stale_then_rejoins() {
        let mut f = fixture();
        f.manager.on_heartbeat_success(response(1, Some(BTreeMap::from([(f.topic_id, BTreeSet::from([0]))]))));
        f.manager.poll(&mut f.metadata);
        let assign = callbacks(&mut f.events);
        f.manager.on_callback_completed(assign[0].0, Ok(()));
        f.manager.on_heartbeat_request_generated();

        f.manager.transition_to_sending_leave_group(true);
        assert_eq!(f.manager.state(), MemberState::Leaving);
        assert!(f.manager.is_poll_timer_expired());

        f.manager.on_heartbeat_request_generated();
        assert_eq!(f.manager.state(), MemberState::Stale);
        let lost = callbacks(&mut f.events);
        assert_eq!(lost[0].1, CallbackMethod::Lost);

        f.manager.maybe_rejoin_stale_member();
        assert_eq!(f.manager.state(), MemberState::Stale);

        f.manager.on_callback_completed(lost[0].0, Ok(()));
        assert_eq!(f.manager.state(), MemberState::Joining);
        assert_eq!(f.manager.subscriptions().num_assigned_partitions(), 0);
    }

    #[test]
    fn test_fatal_is_terminal() {
        let mut f = fixture();
        f.manager.transition_to_fatal();
        assert_eq!(f.manager.state(), MemberState::Fatal);
        assert!(f.manager.should_skip_heartbeat());
        f.manager.transition_to_joining();
        assert_eq!(f.manager.state(), MemberState::Fatal);
    }

    #[test]
    fn test_rejected_transition_keeps_state() {
        let mut f = fixture();
        assert!(f.manager.transition_to(MemberState::Leaving).is_err());

        f.manager.set_state(MemberState::Leaving);
        assert_eq!(f.manager.state(), MemberState::Joining);
        f.manager.set_state(MemberState::Stale);
        assert_eq!(f.manager.state(), MemberState::Joining);
    }

    #[test]
    fn test_unresolved_topic_requests_metadata() {
        let mut f = fixture();
        let unknown = Uuid::new_v4();
        let target = BTreeMap::from([(unknown, BTreeSet::from([0]))]);
        f.manager.on_heartbeat_success(response(1, Some(target)));
        f.manager.poll(&mut f.metadata);
        assert!(f.metadata.update_requested());
    }

    #[derive(Default)]
    struct Recorder {
        epochs: Mutex<Vec<Option<i32>>>,
        assignments: Mutex<Vec<BTreeSet<TopicPartition>>>,
    }

    impl MemberStateListener for Recorder {
        fn on_member_epoch_updated(&self, epoch: Option<i32>, _member_id: &str) {
            self.epochs.lock().push(epoch);
        }

        fn on_group_assignment_updated(&self, partitions: &BTreeSet<TopicPartition>) {
            self.assignments.lock().push(partitions.clone());
        }
    }

    #[test]
    fn test_listeners_observe_epoch_and_assignment() {
        let mut f = fixture();
        let recorder = Arc::new(Recorder::default());
        f.manager.register_state_listener(recorder.clone());

        let target = BTreeMap::from([(f.topic_id, BTreeSet::from([2]))]);
        f.manager.on_heartbeat_success(response(4, Some(target)));
        f.manager.poll(&mut f.metadata);

        assert_eq!(*recorder.epochs.lock(), vec![Some(4)]);
        assert_eq!(*recorder.assignments.lock(), vec![partitions(&[2])]);
    }
}
