//! Network client delegate
//!
//! Owns the transport on the background thread. Managers hand it
//! [`UnsentRequest`]s; each call to [`NetworkClientDelegate::poll`] sends what
//! it can, expires what waited too long, fails requests to dead nodes and
//! returns the requests that completed.

use super::{CompletedRequest, PollResult, RequestHandler, UnsentRequest};
use crate::consumer::protocol::{Node, RequestBody, ResponseBody};
use crate::error::{ConsumerError, Result};
use crate::util::Timer;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Interrupts a blocking transport poll from another thread
pub trait NetworkWaker: Send + Sync {
    fn wakeup(&self);
}

/// Response (or disconnect) reported by the transport
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub correlation_id: i32,
    pub node_id: i32,
    pub disconnected: bool,
    pub body: Option<ResponseBody>,
}

impl ClientResponse {
    pub fn received(correlation_id: i32, node_id: i32, body: ResponseBody) -> Self {
        Self {
            correlation_id,
            node_id,
            disconnected: false,
            body: Some(body),
        }
    }

    pub fn disconnected(correlation_id: i32, node_id: i32) -> Self {
        Self {
            correlation_id,
            node_id,
            disconnected: true,
            body: None,
        }
    }
}

/// Raw transport used by the delegate. Encoding and connection management
/// live behind this trait.
pub trait KafkaClient: Send {
    /// Begin connecting if needed; true when a request can be sent now
    fn ready(&mut self, node: &Node, now_ms: u64) -> bool;

    /// The last connection attempt to `node` failed
    fn connection_failed(&self, node: &Node) -> bool;

    /// Authentication error that caused the connection failure, if any
    fn authentication_error(&self, node: &Node) -> Option<ConsumerError>;

    fn least_loaded_node(&self, now_ms: u64) -> Option<Node>;

    fn send(&mut self, correlation_id: i32, node: &Node, body: RequestBody, now_ms: u64);

    /// Wait up to `timeout_ms` for responses
    fn poll(&mut self, timeout_ms: u64, now_ms: u64) -> Vec<ClientResponse>;

    fn waker(&self) -> Arc<dyn NetworkWaker>;

    fn in_flight_request_count(&self) -> usize;

    fn close(&mut self);
}

struct InFlightRequest {
    handler: RequestHandler,
    node: Node,
    api: &'static str,
}

/// Sends manager requests and demultiplexes their completions
pub struct NetworkClientDelegate {
    client: Box<dyn KafkaClient>,
    unsent: VecDeque<UnsentRequest>,
    in_flight: HashMap<i32, InFlightRequest>,
    completed: Vec<CompletedRequest>,
    next_correlation_id: i32,
    request_timeout_ms: u64,
    retry_backoff_ms: u64,
}

impl NetworkClientDelegate {
    pub fn new(client: Box<dyn KafkaClient>, request_timeout_ms: u64, retry_backoff_ms: u64) -> Self {
        Self {
            client,
            unsent: VecDeque::new(),
            in_flight: HashMap::new(),
            completed: Vec::new(),
            next_correlation_id: 0,
            request_timeout_ms,
            retry_backoff_ms,
        }
    }

    /// Queue every request of a poll result; returns its wait time
    pub fn add_all(&mut self, result: PollResult, now_ms: u64) -> u64 {
        for request in result.unsent_requests {
            self.add(request, now_ms);
        }
        result.time_until_next_poll_ms
    }

    pub fn add(&mut self, mut request: UnsentRequest, now_ms: u64) {
        if request.timer.is_none() {
            request.timer = Some(Timer::new(now_ms, self.request_timeout_ms));
        }
        trace!(api = request.body.api_name(), node = ?request.node.as_ref().map(|n| n.id), "Queued request");
        self.unsent.push_back(request);
    }

    /// Send, wait for the transport and collect completed requests
    pub fn poll(&mut self, timeout_ms: u64, now_ms: u64) -> Vec<CompletedRequest> {
        self.try_send(now_ms);

        // Unsendable requests are retried after a short backoff instead of
        // sleeping through the full timeout.
        let poll_timeout_ms = if self.unsent.is_empty() {
            timeout_ms
        } else {
            timeout_ms.min(self.retry_backoff_ms)
        };

        for response in self.client.poll(poll_timeout_ms, now_ms) {
            self.handle_response(response, now_ms);
        }
        self.check_disconnects(now_ms);

        std::mem::take(&mut self.completed)
    }

    fn try_send(&mut self, now_ms: u64) {
        let mut retained = VecDeque::with_capacity(self.unsent.len());
        while let Some(mut request) = self.unsent.pop_front() {
            if let Some(timer) = request.timer.as_mut() {
                timer.update(now_ms);
                if timer.is_expired() {
                    let api = request.body.api_name();
                    debug!(api, "Request expired before it could be sent");
                    let error = ConsumerError::timeout(
                        &format!("{} request", api),
                        timer.timeout_ms(),
                    );
                    self.complete(request.handler, request.node, Err(error), now_ms);
                    continue;
                }
            }

            let node = match request.node.clone() {
                Some(node) => node,
                None => match self.client.least_loaded_node(now_ms) {
                    Some(node) => node,
                    None => {
                        retained.push_back(request);
                        continue;
                    }
                },
            };

            if !self.client.ready(&node, now_ms) {
                retained.push_back(request);
                continue;
            }

            let correlation_id = self.next_correlation_id;
            self.next_correlation_id = self.next_correlation_id.wrapping_add(1);
            let api = request.body.api_name();
            trace!(api, node = node.id, correlation_id, "Sending request");
            self.client.send(correlation_id, &node, request.body, now_ms);
            self.in_flight.insert(
                correlation_id,
                InFlightRequest {
                    handler: request.handler,
                    node,
                    api,
                },
            );
        }
        self.unsent = retained;
    }

    /// Fail unsent requests whose target node's connection failed
    fn check_disconnects(&mut self, now_ms: u64) {
        let mut retained = VecDeque::with_capacity(self.unsent.len());
        while let Some(request) = self.unsent.pop_front() {
            let failed = request
                .node
                .as_ref()
                .filter(|node| self.client.connection_failed(node))
                .map(|node| {
                    self.client
                        .authentication_error(node)
                        .unwrap_or_else(|| ConsumerError::disconnected(node.id))
                });
            match failed {
                Some(error) => {
                    debug!(api = request.body.api_name(), error = %error, "Failing request to unreachable node");
                    self.complete(request.handler, request.node, Err(error), now_ms);
                }
                None => retained.push_back(request),
            }
        }
        self.unsent = retained;
    }

    fn handle_response(&mut self, response: ClientResponse, now_ms: u64) {
        let Some(request) = self.in_flight.remove(&response.correlation_id) else {
            debug!(
                correlation_id = response.correlation_id,
                node = response.node_id,
                "Dropping response for unknown request"
            );
            return;
        };

        let outcome = if response.disconnected {
            Err(self
                .client
                .authentication_error(&request.node)
                .unwrap_or_else(|| ConsumerError::disconnected(request.node.id)))
        } else {
            match response.body {
                Some(body) => Ok(body),
                None => Err(ConsumerError::illegal_state(
                    request.api,
                    "response carried no body",
                )),
            }
        };
        self.complete(request.handler, Some(request.node), outcome, now_ms);
    }

    fn complete(
        &mut self,
        handler: RequestHandler,
        node: Option<Node>,
        outcome: Result<ResponseBody>,
        now_ms: u64,
    ) {
        self.completed.push(CompletedRequest {
            handler,
            node,
            outcome,
            received_ms: now_ms,
        });
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.unsent.is_empty() || !self.in_flight.is_empty()
    }

    pub fn unsent_count(&self) -> usize {
        self.unsent.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn waker(&self) -> Arc<dyn NetworkWaker> {
        self.client.waker()
    }

    pub fn close(&mut self) {
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::protocol::{FindCoordinatorRequest, FindCoordinatorResponse};
    use crate::testing::MockClient;

    fn find_coordinator() -> UnsentRequest {
        UnsentRequest::new(
            RequestBody::FindCoordinator(FindCoordinatorRequest {
                key: "group".to_string(),
            }),
            None,
            RequestHandler::FindCoordinator,
        )
    }

    #[test]
    fn test_sends_to_least_loaded_node_and_returns_response() {
        let client = MockClient::new(vec![Node::new(1, "localhost", 9092)]);
        client.respond_with(|_, body| match body {
            RequestBody::FindCoordinator(req) => Some(ResponseBody::FindCoordinator(
                FindCoordinatorResponse::found(req.key.clone(), Node::new(1, "localhost", 9092)),
            )),
            _ => None,
        });
        let mut delegate = NetworkClientDelegate::new(Box::new(client.clone()), 1_000, 100);
        delegate.add(find_coordinator(), 0);

        let completed = delegate.poll(0, 0);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].handler, RequestHandler::FindCoordinator);
        assert!(completed[0].outcome.is_ok());
        assert_eq!(client.sent_requests().len(), 1);
        assert!(!delegate.has_pending_requests());
    }

    #[test]
    fn test_unsent_request_expires() {
        let client = MockClient::new(vec![]);
        let mut delegate = NetworkClientDelegate::new(Box::new(client), 1_000, 100);
        delegate.add(find_coordinator(), 0);

        assert!(delegate.poll(0, 500).is_empty());
        assert_eq!(delegate.unsent_count(), 1);

        let completed = delegate.poll(0, 1_000);
        assert_eq!(completed.len(), 1);
        assert!(matches!(completed[0].outcome, Err(ConsumerError::Timeout(_))));
    }

    #[test]
    fn test_failed_connection_completes_with_disconnect() {
        let node = Node::new(7, "localhost", 9092);
        let client = MockClient::new(vec![node.clone()]);
        client.set_node_ready(7, false);
        client.fail_connection(7);
        let mut delegate = NetworkClientDelegate::new(Box::new(client), 1_000, 100);
        delegate.add(
            UnsentRequest::new(
                RequestBody::FindCoordinator(FindCoordinatorRequest { key: "g".into() }),
                Some(node),
                RequestHandler::FindCoordinator,
            ),
            0,
        );

        let completed = delegate.poll(0, 0);
        assert_eq!(completed.len(), 1);
        assert!(matches!(completed[0].outcome, Err(ConsumerError::Disconnected(_))));
    }

    #[test]
    fn test_disconnect_after_send() {
        let client = MockClient::new(vec![Node::new(1, "localhost", 9092)]);
        client.disconnect_responses(true);
        let mut delegate = NetworkClientDelegate::new(Box::new(client), 1_000, 100);
        delegate.add(find_coordinator(), 0);

        let completed = delegate.poll(0, 0);
        assert_eq!(completed.len(), 1);
        assert!(completed[0].outcome.as_ref().unwrap_err().is_disconnect());
        assert_eq!(completed[0].node.as_ref().map(|n| n.id), Some(1));
    }
}
