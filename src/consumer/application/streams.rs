//! Streams group facade

use super::{complete_callback, GroupClient, MemberSnapshot, WakeupTrigger};
use crate::config::ConsumerConfig;
use crate::consumer::events::{ApplicationEvent, ApplicationEventHandler, BackgroundEvent, CallbackMethod, CallbackPayload};
use crate::consumer::future::CompletableResult;
use crate::consumer::membership::{StreamsFlavor, StreamsTask};
use crate::consumer::metadata::MetadataView;
use crate::consumer::protocol::StreamsTopology;
use crate::consumer::request::KafkaClient;
use crate::error::{ConsumerError, Result};
use crate::util::Clock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Task lifecycle hooks of a streams application
pub trait StreamsRebalanceListener: Send {
    fn on_tasks_revoked(&mut self, tasks: &BTreeSet<StreamsTask>) -> Result<()>;

    fn on_tasks_assigned(&mut self, tasks: &BTreeSet<StreamsTask>) -> Result<()>;

    fn on_all_tasks_lost(&mut self) -> Result<()>;
}

type Listener = Box<dyn StreamsRebalanceListener>;

/// One process instance of a streams application in a streams group
pub struct StreamsGroupMember {
    client: GroupClient,
    source_topics: BTreeSet<String>,
    listener: Listener,
}

impl StreamsGroupMember {
    pub fn new(
        config: ConsumerConfig,
        topology: StreamsTopology,
        process_id: Uuid,
        listener: Listener,
        client: Box<dyn KafkaClient>,
        metadata: Box<dyn MetadataView + Send>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let source_topics: BTreeSet<String> = topology
            .subtopologies
            .iter()
            .flat_map(|s| s.source_topics.iter().chain(&s.repartition_source_topics).cloned())
            .collect();
        if source_topics.is_empty() {
            return Err(ConsumerError::config("topology", "no source topics"));
        }
        let flavor = StreamsFlavor::new(topology, process_id);
        let client = GroupClient::start(config, flavor, false, client, metadata, clock)?;
        Ok(Self {
            client,
            source_topics,
            listener,
        })
    }

    /// Join the group with the topology's source topics
    pub fn join(&mut self) -> Result<()> {
        self.client.ensure_open()?;
        let deadline_ms = self.client.default_deadline_ms();
        let result = CompletableResult::new();
        let event = ApplicationEvent::Subscribe {
            topics: self.source_topics.clone(),
            has_listener: true,
            deadline_ms,
            result: result.clone(),
        };
        let listener = &mut self.listener;
        self.client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(listener.as_mut(), events, event)
            })
    }

    /// Give up all tasks and leave the group
    pub fn leave(&mut self) -> Result<()> {
        self.client.ensure_open()?;
        let deadline_ms = self.client.default_deadline_ms();
        let result = CompletableResult::new();
        let event = ApplicationEvent::Unsubscribe {
            deadline_ms,
            result: result.clone(),
        };
        let listener = &mut self.listener;
        self.client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(listener.as_mut(), events, event)
            })
    }

    /// Reset the poll timer and run task callbacks for up to `timeout`
    pub fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.client.ensure_open()?;
        self.client.wakeup_trigger().maybe_trigger_wakeup()?;
        let deadline_ms = self.client.deadline_ms(timeout);
        self.client.add(ApplicationEvent::Poll {
            poll_time_ms: self.client.now_ms(),
        })?;
        loop {
            let listener = &mut self.listener;
            self.client
                .process_background_events(&mut |events, event| handle_event(listener.as_mut(), events, event))?;
            let now_ms = self.client.now_ms();
            if now_ms >= deadline_ms {
                return Ok(());
            }
            self.client.wait(deadline_ms - now_ms)?;
        }
    }

    pub fn member(&self) -> MemberSnapshot {
        self.client.member()
    }

    pub fn wakeup_trigger(&self) -> WakeupTrigger {
        self.client.wakeup_trigger()
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        let listener = &mut self.listener;
        self.client
            .close(timeout, &mut |events, event| handle_event(listener.as_mut(), events, event))
    }
}

impl Drop for StreamsGroupMember {
    fn drop(&mut self) {
        if !self.client.is_closed() {
            let timeout = Duration::from_millis(self.client.config().default_api_timeout_ms);
            if let Err(error) = self.close(timeout) {
                warn!(error = %error, "Streams member close on drop failed");
            }
        }
    }
}

fn handle_event(
    listener: &mut dyn StreamsRebalanceListener,
    events: &ApplicationEventHandler,
    event: BackgroundEvent,
) -> Result<()> {
    let name = event.name();
    let BackgroundEvent::RebalanceCallbackNeeded { id, method, payload } = event else {
        debug!(event = name, "Ignoring background event not meant for a streams group member");
        return Ok(());
    };
    let CallbackPayload::Tasks(tasks) = payload else {
        return complete_callback(
            events,
            id,
            Err(ConsumerError::illegal_state("task callback", "expected tasks")),
        );
    };
    debug!(id, method = method.as_str(), tasks = tasks.len(), "Running task callback");
    let result = match method {
        CallbackMethod::Revoked => listener.on_tasks_revoked(&tasks),
        CallbackMethod::Assigned => listener.on_tasks_assigned(&tasks),
        CallbackMethod::Lost => listener.on_all_tasks_lost(),
    }
    .map_err(|e| ConsumerError::Callback(format!("tasks {}: {}", method.as_str(), e)));
    complete_callback(events, id, result)
}
