//! Member-to-member calls.
//!
//! The [`Transport`] trait is the contract with whatever carries messages between
//! members; the [`RequestHandler`] trait is what a member exposes to it. Every
//! call made through [`RemoteClient`] carries a timeout.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use steward_core::{ChildId, MemberId};
use steward_runtime::ChildHandle;
use tracing::debug;

use crate::spec::WorkerSpec;
use crate::state::ClusterState;
use crate::table::ChildReport;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Target cannot be reached
    #[error("Member unreachable: {0}")]
    Unreachable(MemberId),

    /// Target did not answer in time
    #[error("Request to {target} timed out after {after_ms}ms")]
    Timeout {
        /// Target member
        target: MemberId,
        /// Timeout that expired
        after_ms: u64,
    },

    /// Target answered with the wrong message
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Request ID
    pub request_id: uuid::Uuid,
    /// Calling member
    pub source: MemberId,
    /// Request body
    pub body: Request,
}

impl RemoteRequest {
    /// Create a new request with a fresh id
    #[must_use]
    pub fn new(source: MemberId, body: Request) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4(),
            source,
            body,
        }
    }
}

/// Request bodies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Push-pull state exchange
    Gossip(Box<ClusterState>),
    /// Start a child forwarded by its caller
    StartChild(WorkerSpec),
    /// Take over a child released by a departing or restarting member
    Handoff(WorkerSpec),
    /// Stop a child
    StopChild(ChildId),
    /// Report local children
    LocalChildren,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Self::Gossip(_) => "gossip",
            Self::StartChild(_) => "start_child",
            Self::Handoff(_) => "handoff",
            Self::StopChild(_) => "stop_child",
            Self::LocalChildren => "local_children",
        }
    }
}

/// Answer to a start or handoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartReply {
    /// Launched a new instance
    Started(ChildHandle),
    /// An instance already runs
    AlreadyStarted(ChildHandle),
    /// Launch failed
    Failed(String),
    /// Member is shutting down
    NotAccepting,
}

/// Response bodies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Responder's state after merging the request
    Gossip(Box<ClusterState>),
    /// Start or handoff outcome
    Start(StartReply),
    /// Stop outcome
    Stopped {
        /// Whether the child was known
        found: bool,
    },
    /// Local children
    Children(Vec<ChildReport>),
}

/// Carries requests between members
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a request and wait for the response
    ///
    /// # Errors
    ///
    /// Returns error if the target cannot be reached or does not answer in time
    async fn call(
        &self,
        target: MemberId,
        request: RemoteRequest,
        timeout: Duration,
    ) -> Result<Response, TransportError>;
}

/// What a member exposes to the transport
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request
    async fn handle(&self, request: RemoteRequest) -> Response;
}

/// Typed calls over a transport
#[derive(Clone)]
pub struct RemoteClient {
    local: MemberId,
    transport: Arc<dyn Transport>,
    call_timeout: Duration,
    query_timeout: Duration,
}

impl RemoteClient {
    /// Create a new client
    #[must_use]
    pub fn new(local: MemberId, transport: Arc<dyn Transport>) -> Self {
        Self {
            local,
            transport,
            call_timeout: Duration::from_secs(1),
            query_timeout: Duration::from_secs(1),
        }
    }

    /// Set the timeout of gossip, start and stop calls
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the timeout of child queries
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    async fn call(
        &self,
        target: MemberId,
        body: Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let request = RemoteRequest::new(self.local, body);
        let name = request.body.name();
        let call = self.transport.call(target, request, timeout);
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Call {} to {} timed out", name, target.short());
                Err(TransportError::Timeout {
                    target,
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Exchange state with a peer and return the peer's state
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn gossip(&self, target: MemberId, state: ClusterState) -> Result<ClusterState, TransportError> {
        match self.call(target, Request::Gossip(Box::new(state)), self.call_timeout).await? {
            Response::Gossip(theirs) => Ok(*theirs),
            other => Err(unexpected("gossip", &other)),
        }
    }

    /// Ask a member to start a child
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn start_child(&self, target: MemberId, spec: WorkerSpec) -> Result<StartReply, TransportError> {
        self.start(target, Request::StartChild(spec)).await
    }

    /// Hand a child to a member
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn handoff(&self, target: MemberId, spec: WorkerSpec) -> Result<StartReply, TransportError> {
        self.start(target, Request::Handoff(spec)).await
    }

    async fn start(&self, target: MemberId, body: Request) -> Result<StartReply, TransportError> {
        match self.call(target, body, self.call_timeout).await? {
            Response::Start(reply) => Ok(reply),
            other => Err(unexpected("start", &other)),
        }
    }

    /// Ask a member to stop a child. Returns whether the member knew it.
    ///
    /// The call timeout is extended by the child's shutdown budget by the caller.
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn stop_child(&self, target: MemberId, id: ChildId, timeout: Duration) -> Result<bool, TransportError> {
        match self.call(target, Request::StopChild(id), timeout).await? {
            Response::Stopped { found } => Ok(found),
            other => Err(unexpected("stop", &other)),
        }
    }

    /// Query a member's local children
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn local_children(&self, target: MemberId) -> Result<Vec<ChildReport>, TransportError> {
        match self.call(target, Request::LocalChildren, self.query_timeout).await? {
            Response::Children(reports) => Ok(reports),
            other => Err(unexpected("children", &other)),
        }
    }

    /// Query several members concurrently, skipping the ones that fail
    pub async fn collect_children(&self, targets: &[MemberId]) -> Vec<(MemberId, Vec<ChildReport>)> {
        let queries = targets.iter().map(|target| async move {
            match self.local_children(*target).await {
                Ok(reports) => Some((*target, reports)),
                Err(e) => {
                    debug!("Skipping {} in child query: {}", target.short(), e);
                    None
                }
            }
        });
        join_all(queries).await.into_iter().flatten().collect()
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("local", &self.local)
            .field("call_timeout", &self.call_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

fn unexpected(expected: &str, got: &Response) -> TransportError {
    TransportError::InvalidResponse(format!("expected {} response, got {:?}", expected, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use steward_runtime::StartDescriptor;

    /// Answers from a fixed table, sleeps for members in `slow`
    struct Scripted {
        answers: HashMap<MemberId, Response>,
        slow: Vec<MemberId>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn call(
            &self,
            target: MemberId,
            _request: RemoteRequest,
            _timeout: Duration,
        ) -> Result<Response, TransportError> {
            if self.slow.contains(&target) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.answers
                .get(&target)
                .cloned()
                .ok_or(TransportError::Unreachable(target))
        }
    }

    fn client(answers: HashMap<MemberId, Response>, slow: Vec<MemberId>) -> RemoteClient {
        RemoteClient::new(MemberId::from_name("caller"), Arc::new(Scripted { answers, slow }))
            .with_call_timeout(Duration::from_millis(50))
            .with_query_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_request_envelope() {
        let source = MemberId::from_name("a");
        let request = RemoteRequest::new(source, Request::LocalChildren);
        assert_eq!(request.source, source);
        assert_ne!(request.request_id, RemoteRequest::new(source, Request::LocalChildren).request_id);
    }

    #[test]
    fn test_request_json() {
        let spec = WorkerSpec::new("job", StartDescriptor::new("idle"));
        let request = RemoteRequest::new(MemberId::from_name("a"), Request::Handoff(spec));
        let json = serde_json::to_string(&request).unwrap();
        let back: RemoteRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[tokio::test]
    async fn test_start_reply() {
        let target = MemberId::from_name("b");
        let handle = ChildHandle::new(target, ChildId::from("job"), 1);
        let answers = HashMap::from([(target, Response::Start(StartReply::Started(handle.clone())))]);

        let spec = WorkerSpec::new("job", StartDescriptor::new("idle"));
        let reply = client(answers, vec![]).start_child(target, spec).await.unwrap();
        assert_eq!(reply, StartReply::Started(handle));
    }

    #[tokio::test]
    async fn test_wrong_response_is_invalid() {
        let target = MemberId::from_name("b");
        let answers = HashMap::from([(target, Response::Stopped { found: true })]);

        let err = client(answers, vec![]).local_children(target).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let target = MemberId::from_name("slow");
        let answers = HashMap::from([(target, Response::Children(vec![]))]);

        let err = client(answers, vec![target]).local_children(target).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout { target, after_ms: 50 });
    }

    #[tokio::test]
    async fn test_collect_children_skips_failures() {
        let up = MemberId::from_name("up");
        let slow = MemberId::from_name("slow");
        let down = MemberId::from_name("down");
        let answers = HashMap::from([
            (up, Response::Children(vec![])),
            (slow, Response::Children(vec![])),
        ]);

        let collected = client(answers, vec![slow]).collect_children(&[up, slow, down]).await;
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0, up);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Unreachable(MemberId::from_name("a"));
        assert!(err.to_string().contains("unreachable"));
    }
}
