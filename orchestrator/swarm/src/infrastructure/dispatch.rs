// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP task dispatcher
//!
//! Posts a [`DispatchRequest`] to `http://<address>:<port>/distributed/execute`
//! on the assigned node. Any 2xx answer counts as accepted; the node reports
//! the outcome later through the coordinator's completion endpoint.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::domain::{DispatchError, DispatchRequest, DistributedTask, TaskDispatcher, WorkerNode};

pub const EXECUTE_PATH: &str = "/distributed/execute";
pub const COMPLETE_PATH: &str = "/distributed/tasks/complete";

pub struct HttpTaskDispatcher {
    client: Client,
    reply_to: Option<String>,
}

impl HttpTaskDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("convoy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DispatchError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            reply_to: None,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            reply_to: None,
        }
    }

    /// Ask workers to report outcomes to `base_url`.
    pub fn with_reply_to(mut self, base_url: impl Into<String>) -> Self {
        self.reply_to = Some(base_url.into());
        self
    }
}

#[async_trait]
impl TaskDispatcher for HttpTaskDispatcher {
    async fn dispatch(&self, node: &WorkerNode, task: &DistributedTask) -> Result<(), DispatchError> {
        let url = format!("{}{EXECUTE_PATH}", node.endpoint());
        debug!(task_id = %task.id, node_id = %node.id, url = %url, "Dispatching task");

        let request = DispatchRequest {
            node_id: Some(node.id.clone()),
            reply_to: self.reply_to.clone(),
            ..DispatchRequest::from(task)
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DispatchError::Rejected(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, NodeId};
    use serde_json::json;

    fn node_for(url: &str) -> WorkerNode {
        let authority = url.trim_start_matches("http://");
        let (address, port) = authority.rsplit_once(':').unwrap();
        WorkerNode::new(
            NodeId::new(),
            "worker",
            address,
            port.parse().unwrap(),
            Capability::defaults(),
            5,
        )
    }

    #[tokio::test]
    async fn test_dispatch_posts_task_to_execute() {
        let mut server = mockito::Server::new_async().await;
        let task = DistributedTask::new("research", json!({ "query": "rust" }), None);
        let mock = server
            .mock("POST", EXECUTE_PATH)
            .match_body(mockito::Matcher::PartialJson(json!({
                "task_id": task.id.as_str(),
                "task_type": "research",
                "payload": { "query": "rust" }
            })))
            .with_status(202)
            .create_async()
            .await;

        let dispatcher = HttpTaskDispatcher::new(Duration::from_secs(5)).unwrap();
        dispatcher.dispatch(&node_for(&server.url()), &task).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dispatch_carries_reply_address_and_node() {
        let mut server = mockito::Server::new_async().await;
        let node = node_for(&server.url());
        let mock = server
            .mock("POST", EXECUTE_PATH)
            .match_body(mockito::Matcher::PartialJson(json!({
                "reply_to": "http://10.0.0.1:8765",
                "node_id": node.id.as_str()
            })))
            .with_status(200)
            .create_async()
            .await;

        let dispatcher = HttpTaskDispatcher::new(Duration::from_secs(5))
            .unwrap()
            .with_reply_to("http://10.0.0.1:8765");
        let task = DistributedTask::new("code", json!({}), None);
        dispatcher.dispatch(&node, &task).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", EXECUTE_PATH)
            .with_status(503)
            .create_async()
            .await;

        let dispatcher = HttpTaskDispatcher::new(Duration::from_secs(5)).unwrap();
        let task = DistributedTask::new("code", json!({}), None);
        let err = dispatcher
            .dispatch(&node_for(&server.url()), &task)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(503)));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dispatcher = HttpTaskDispatcher::new(Duration::from_secs(2)).unwrap();
        let node = WorkerNode::new(NodeId::new(), "gone", "127.0.0.1", port, Capability::defaults(), 5);
        let err = dispatcher
            .dispatch(&node, &DistributedTask::new("chat", json!({}), None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable(_)));
    }
}
