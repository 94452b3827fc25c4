//! Background network thread
//!
//! [`ConsumerNetworkThread`] owns every request manager, the metadata cache
//! and the [`NetworkClientDelegate`]. Each loop iteration:
//!
//! 1. drains the application queue and hands each event to the
//!    [`ApplicationEventProcessor`], tracking completable ones in the reaper
//! 2. polls the managers and queues their requests
//! 3. polls the transport for at most the smallest wait any manager asked for
//! 4. dispatches completed requests back to their managers
//! 5. expires completable events past their deadline
//!
//! Nothing here is shared with the application thread except the two queues
//! and the futures carried by events.

use super::events::{ApplicationEvent, BackgroundEventHandler, CompletableEventReaper, EventReceiver};
use super::heartbeat::HeartbeatRequestManager;
use super::membership::{MembershipFlavor, MembershipManager};
use super::metadata::MetadataView;
use super::request::{
    CompletedRequest, CoordinatorRequestManager, NetworkClientDelegate, NetworkWaker, RequestHandler,
};
use super::share::ShareConsumeRequestManager;
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, Result};
use crate::util::Clock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

pub const NETWORK_THREAD_NAME: &str = "streamline-consumer-network-thread";

// ========== Request Managers ==========

/// Every manager the background loop drives
pub struct RequestManagers<F: MembershipFlavor> {
    pub coordinator: CoordinatorRequestManager,
    pub heartbeat: HeartbeatRequestManager<F>,
    /// Present for share groups only
    pub share: Option<ShareConsumeRequestManager>,
}

impl<F: MembershipFlavor> RequestManagers<F> {
    pub fn new(
        config: &ConsumerConfig,
        membership: MembershipManager<F>,
        background: BackgroundEventHandler,
        with_share: bool,
        now_ms: u64,
    ) -> Self {
        let share = with_share.then(|| ShareConsumeRequestManager::new(config, background.clone()));
        Self {
            coordinator: CoordinatorRequestManager::new(config),
            heartbeat: HeartbeatRequestManager::new(config, membership, background, now_ms),
            share,
        }
    }

    pub fn membership(&self) -> &MembershipManager<F> {
        self.heartbeat.membership()
    }

    pub fn membership_mut(&mut self) -> &mut MembershipManager<F> {
        self.heartbeat.membership_mut()
    }
}

// ========== Application Event Processor ==========

/// Applies application events to the request managers
pub struct ApplicationEventProcessor<F: MembershipFlavor> {
    managers: RequestManagers<F>,
    metadata: Box<dyn MetadataView + Send>,
}

impl<F: MembershipFlavor> ApplicationEventProcessor<F> {
    pub fn new(managers: RequestManagers<F>, metadata: Box<dyn MetadataView + Send>) -> Self {
        Self { managers, metadata }
    }

    pub fn managers(&self) -> &RequestManagers<F> {
        &self.managers
    }

    pub fn managers_mut(&mut self) -> &mut RequestManagers<F> {
        &mut self.managers
    }

    pub fn process(&mut self, event: ApplicationEvent, now_ms: u64) {
        trace!(event = event.name(), "Processing application event");
        match event {
            ApplicationEvent::Poll { poll_time_ms } => {
                self.managers.heartbeat.reset_poll_timer(poll_time_ms);
                self.managers.membership_mut().on_consumer_poll();
            }
            ApplicationEvent::Subscribe {
                topics,
                has_listener,
                result,
                ..
            } => {
                let membership = self.managers.membership_mut();
                if membership.state() == super::membership::MemberState::Fatal {
                    result.complete_exceptionally(ConsumerError::illegal_state(
                        "subscribe",
                        "member is in a fatal state",
                    ));
                    return;
                }
                if membership.subscriptions_mut().subscribe(topics, has_listener) {
                    membership.on_subscription_updated();
                }
                result.complete(());
            }
            ApplicationEvent::Unsubscribe { result, .. } | ApplicationEvent::LeaveGroupOnClose { result, .. } => {
                self.managers.membership_mut().leave_group(result);
            }
            ApplicationEvent::RebalanceCallbackCompleted { id, result } => {
                self.managers.membership_mut().on_callback_completed(id, result);
            }
            ApplicationEvent::ShareFetch { acknowledgements } => match self.managers.share.as_mut() {
                Some(share) => share.fetch(acknowledgements),
                None => warn!("ShareFetch ignored, this is not a share group member"),
            },
            ApplicationEvent::ShareAcknowledgeAsync { acknowledgements } => match self.managers.share.as_mut() {
                Some(share) => share.acknowledge_async(acknowledgements, now_ms),
                None => warn!("ShareAcknowledgeAsync ignored, this is not a share group member"),
            },
            ApplicationEvent::ShareAcknowledgeSync {
                acknowledgements,
                deadline_ms,
                result,
            } => match self.managers.share.as_mut() {
                Some(share) => share.acknowledge_sync(acknowledgements, deadline_ms, result),
                None => {
                    result.complete_exceptionally(not_share_member("commitSync"));
                }
            },
            ApplicationEvent::ShareAcknowledgeOnClose {
                acknowledgements,
                deadline_ms,
                result,
            } => match self.managers.share.as_mut() {
                Some(share) => share.acknowledge_on_close(acknowledgements, deadline_ms, result),
                None => {
                    result.complete_exceptionally(not_share_member("close"));
                }
            },
            ApplicationEvent::ShareAcknowledgementCommitCallbackRegistration { enabled } => {
                if let Some(share) = self.managers.share.as_mut() {
                    share.set_commit_callback_enabled(enabled);
                }
            }
        }
    }

    /// Run reconciliation, poll every manager and queue their requests.
    /// Returns the smallest wait any manager asked for.
    pub fn poll_managers(&mut self, network: &mut NetworkClientDelegate, now_ms: u64) -> u64 {
        let managers = &mut self.managers;
        managers.membership_mut().poll(self.metadata.as_mut());

        let mut wait_ms = network.add_all(managers.coordinator.poll(now_ms), now_ms);
        let heartbeat = managers.heartbeat.poll(&mut managers.coordinator, now_ms);
        wait_ms = wait_ms.min(network.add_all(heartbeat, now_ms));

        if let Some(share) = managers.share.as_mut() {
            let membership = managers.heartbeat.membership();
            let result = share.poll(
                membership.member_id(),
                membership.subscriptions(),
                self.metadata.as_mut(),
                now_ms,
            );
            wait_ms = wait_ms.min(network.add_all(result, now_ms));
        }
        wait_ms
    }

    pub fn maximum_time_to_wait(&mut self, now_ms: u64) -> u64 {
        let managers = &mut self.managers;
        managers
            .heartbeat
            .maximum_time_to_wait(&managers.coordinator, now_ms)
    }

    /// Route a completed request to the manager that sent it
    pub fn dispatch(&mut self, completed: CompletedRequest, now_ms: u64) {
        let managers = &mut self.managers;
        match completed.handler {
            RequestHandler::FindCoordinator => {
                managers.coordinator.handle_response(completed.outcome, now_ms);
            }
            RequestHandler::Heartbeat { ignore_response } => {
                managers.heartbeat.handle_response(
                    ignore_response,
                    completed.outcome,
                    &mut managers.coordinator,
                    now_ms,
                );
            }
            RequestHandler::ShareFetch { node_id } => match managers.share.as_mut() {
                Some(share) => share.handle_fetch_response(node_id, completed.outcome, self.metadata.as_mut()),
                None => debug!(node_id, "Dropping ShareFetch completion without a share manager"),
            },
            RequestHandler::ShareAcknowledge { node_id, request_type } => match managers.share.as_mut() {
                Some(share) => share.handle_acknowledge_response(
                    node_id,
                    request_type,
                    completed.outcome,
                    self.metadata.as_mut(),
                    now_ms,
                ),
                None => debug!(node_id, "Dropping ShareAcknowledge completion without a share manager"),
            },
        }
    }
}

fn not_share_member(operation: &str) -> ConsumerError {
    ConsumerError::illegal_state(operation, "this is not a share group member")
}

// ========== Network Thread ==========

/// The background loop; run inline with [`run_once`](Self::run_once) or on
/// its own thread with [`start`](Self::start)
pub struct ConsumerNetworkThread<F: MembershipFlavor> {
    processor: ApplicationEventProcessor<F>,
    network: NetworkClientDelegate,
    application_events: EventReceiver<ApplicationEvent>,
    background: BackgroundEventHandler,
    reaper: CompletableEventReaper,
    clock: Arc<dyn Clock>,
    network_poll_timeout_ms: u64,
    cached_maximum_time_to_wait_ms: u64,
}

impl<F: MembershipFlavor> ConsumerNetworkThread<F> {
    pub fn new(
        config: &ConsumerConfig,
        processor: ApplicationEventProcessor<F>,
        network: NetworkClientDelegate,
        application_events: EventReceiver<ApplicationEvent>,
        background: BackgroundEventHandler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            processor,
            network,
            application_events,
            background,
            reaper: CompletableEventReaper::new(),
            clock,
            network_poll_timeout_ms: config.network_poll_timeout_ms,
            cached_maximum_time_to_wait_ms: config.network_poll_timeout_ms,
        }
    }

    pub fn processor(&self) -> &ApplicationEventProcessor<F> {
        &self.processor
    }

    pub fn waker(&self) -> Arc<dyn NetworkWaker> {
        self.network.waker()
    }

    /// How long the last iteration allowed the loop to sleep
    pub fn cached_maximum_time_to_wait_ms(&self) -> u64 {
        self.cached_maximum_time_to_wait_ms
    }

    fn process_application_events(&mut self, now_ms: u64) {
        for event in self.application_events.drain_events() {
            if let Some((deadline_ms, result)) = event.completable() {
                self.reaper.add(event.name(), deadline_ms, result);
            }
            self.processor.process(event, now_ms);
        }
    }

    /// One iteration of the background loop
    pub fn run_once(&mut self) {
        let now_ms = self.clock.now_ms();
        self.process_application_events(now_ms);

        let now_ms = self.clock.now_ms();
        let manager_wait_ms = self.processor.poll_managers(&mut self.network, now_ms);
        let timeout_ms = manager_wait_ms
            .min(self.cached_maximum_time_to_wait_ms)
            .min(self.network_poll_timeout_ms);

        let completed = self.network.poll(timeout_ms, now_ms);
        let now_ms = self.clock.now_ms();
        for request in completed {
            self.processor.dispatch(request, now_ms);
        }

        self.cached_maximum_time_to_wait_ms = self.processor.maximum_time_to_wait(now_ms);
        let expired = self.reaper.reap(now_ms);
        if expired > 0 {
            debug!(expired, "Expired application events past their deadline");
        }
    }

    /// Keep polling the managers and flushing their requests until nothing is
    /// left to send or `timeout_ms` passes, then fail anything still pending
    /// and release the transport
    pub fn cleanup(&mut self, timeout_ms: u64) {
        let start_ms = self.clock.now_ms();
        let deadline_ms = start_ms.saturating_add(timeout_ms);
        debug!(timeout_ms, "Closing the network thread");

        self.process_application_events(start_ms);
        loop {
            let now_ms = self.clock.now_ms();
            if now_ms >= deadline_ms {
                break;
            }
            // a leave or close acknowledgement may only now produce its request
            self.processor.poll_managers(&mut self.network, now_ms);
            if !self.network.has_pending_requests() {
                break;
            }
            let wait_ms = (deadline_ms - now_ms).min(self.network_poll_timeout_ms);
            for request in self.network.poll(wait_ms, now_ms) {
                self.processor.dispatch(request, now_ms);
            }
        }

        let expired = self.reaper.reap_all();
        if expired > 0 {
            debug!(expired, "Failed pending application events on close");
        }
        self.network.close();
        self.background.close();
        debug!("Closed the network thread");
    }
}

impl<F> ConsumerNetworkThread<F>
where
    F: MembershipFlavor + Send + 'static,
    F::Assignment: Send,
{
    /// Run the loop on a dedicated thread until the handle is closed
    pub fn start(mut self) -> Result<NetworkThreadHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let close_timeout_ms = Arc::new(AtomicU64::new(0));
        let waker = self.waker();

        let thread_running = Arc::clone(&running);
        let thread_close_timeout = Arc::clone(&close_timeout_ms);
        let join = thread::Builder::new()
            .name(NETWORK_THREAD_NAME.to_string())
            .spawn(move || {
                debug!("Network thread started");
                while thread_running.load(Ordering::Acquire) {
                    self.run_once();
                }
                self.cleanup(thread_close_timeout.load(Ordering::Acquire));
            })
            .map_err(|e| ConsumerError::illegal_state("start network thread", e.to_string()))?;

        info!(thread = NETWORK_THREAD_NAME, "Started background network thread");
        Ok(NetworkThreadHandle {
            running,
            close_timeout_ms,
            waker,
            join: Some(join),
        })
    }
}

/// Owner side of a running network thread
pub struct NetworkThreadHandle {
    running: Arc<AtomicBool>,
    close_timeout_ms: Arc<AtomicU64>,
    waker: Arc<dyn NetworkWaker>,
    join: Option<JoinHandle<()>>,
}

impl NetworkThreadHandle {
    pub fn waker(&self) -> Arc<dyn NetworkWaker> {
        Arc::clone(&self.waker)
    }

    pub fn is_running(&self) -> bool {
        self.join.is_some()
    }

    /// Stop the loop, give it `timeout_ms` to flush, and join it. Later calls
    /// do nothing.
    pub fn close(&mut self, timeout_ms: u64) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.close_timeout_ms.store(timeout_ms, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.waker.wakeup();
        if join.join().is_err() {
            error!(thread = NETWORK_THREAD_NAME, "Network thread panicked");
        }
    }
}

impl Drop for NetworkThreadHandle {
    fn drop(&mut self) {
        self.close(0);
    }
}
