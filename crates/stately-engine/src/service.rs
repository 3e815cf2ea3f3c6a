//! Built-in service integrations.
//!
//! A Task whose `Resource` starts with `arn:aws:states:::` is routed here
//! instead of to a user handler. Only `sqs:sendMessage` is provided; the
//! actual delivery is delegated to a [`QueueTransport`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::invoker::TaskError;

/// Resource identifier of the SQS send-message integration.
pub const SQS_SEND_MESSAGE: &str = "arn:aws:states:::sqs:sendMessage";

/// A built-in integration reachable through a service resource.
#[async_trait]
pub trait ServiceIntegration: Send + Sync {
    /// The full resource identifier this integration answers to.
    fn resource(&self) -> &str;

    /// Perform the call with the effective state input.
    async fn call(&self, input: Value) -> Result<Value, TaskError>;
}

/// Integrations by resource identifier.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn ServiceIntegration>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration, replacing any previous one for the same resource.
    pub fn register<S: ServiceIntegration + 'static>(&mut self, service: S) {
        let resource = service.resource().to_string();
        self.services.insert(resource, Arc::new(service));
    }

    pub fn register_arc(&mut self, service: Arc<dyn ServiceIntegration>) {
        let resource = service.resource().to_string();
        self.services.insert(resource, service);
    }

    pub fn get(&self, resource: &str) -> Option<Arc<dyn ServiceIntegration>> {
        self.services.get(resource).cloned()
    }

    /// Registered resources in sorted order.
    pub fn resources(&self) -> Vec<&str> {
        let mut resources: Vec<&str> = self.services.keys().map(String::as_str).collect();
        resources.sort_unstable();
        resources
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQS
// ─────────────────────────────────────────────────────────────────────────────

/// A message ready to be handed to a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendMessageRequest {
    pub queue_url: String,
    /// JSON-serialized `MessageBody` from the state input.
    pub message_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_deduplication_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_attributes: Option<Value>,
}

impl SendMessageRequest {
    /// Build a request from the effective input of a Task state.
    pub fn from_input(input: &Value) -> Result<Self, TaskError> {
        let queue_url = input
            .get("QueueUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TaskError::failed("InvalidParameterValue", "QueueUrl is required")
            })?
            .to_string();

        let body = input.get("MessageBody").cloned().unwrap_or(Value::Null);
        let message_body = serde_json::to_string(&body)
            .map_err(|e| TaskError::failed("InvalidParameterValue", e.to_string()))?;

        let text = |key: &str| -> Option<String> {
            input.get(key).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        };

        Ok(Self {
            queue_url,
            message_body,
            delay_seconds: input.get("DelaySeconds").cloned(),
            message_deduplication_id: text("MessageDeduplicationId"),
            message_group_id: text("MessageGroupId"),
            message_attributes: input.get("MessageAttributes").cloned(),
        })
    }

    /// Query-API form fields for this request.
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("Action".to_string(), "SendMessage".to_string()),
            ("QueueUrl".to_string(), self.queue_url.clone()),
            ("MessageBody".to_string(), self.message_body.clone()),
        ];
        if let Some(delay) = &self.delay_seconds {
            let delay = match delay {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form.push(("DelaySeconds".to_string(), delay));
        }
        if let Some(id) = &self.message_deduplication_id {
            form.push(("MessageDeduplicationId".to_string(), id.clone()));
        }
        if let Some(group) = &self.message_group_id {
            form.push(("MessageGroupId".to_string(), group.clone()));
        }
        if let Some(Value::Object(attributes)) = &self.message_attributes {
            for (index, (name, attribute)) in attributes.iter().enumerate() {
                let prefix = format!("MessageAttribute.{}", index + 1);
                form.push((format!("{prefix}.Name"), name.clone()));
                for field in ["DataType", "StringValue", "BinaryValue"] {
                    if let Some(value) = attribute.get(field).and_then(Value::as_str) {
                        form.push((format!("{prefix}.Value.{field}"), value.to_string()));
                    }
                }
            }
        }
        form
    }
}

/// Delivers messages to a queue.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Send a message and return its id.
    async fn send(&self, request: SendMessageRequest) -> Result<String, TaskError>;
}

/// The `sqs:sendMessage` integration.
pub struct SqsSendMessage {
    transport: Arc<dyn QueueTransport>,
}

impl SqsSendMessage {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ServiceIntegration for SqsSendMessage {
    fn resource(&self) -> &str {
        SQS_SEND_MESSAGE
    }

    async fn call(&self, input: Value) -> Result<Value, TaskError> {
        let request = SendMessageRequest::from_input(&input)?;
        let queue_url = request.queue_url.clone();
        let message_id = self.transport.send(request).await?;
        info!(queue_url = %queue_url, message_id = %message_id, "Sent queue message");
        Ok(serde_json::json!({ "MessageId": message_id }))
    }
}

/// Messages an [`InMemoryQueue`] keeps per queue URL by default.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Records messages in memory, grouped by queue URL.
///
/// Each queue keeps its most recent `capacity` messages; older ones are
/// dropped as new ones arrive.
#[derive(Debug)]
pub struct InMemoryQueue {
    capacity: usize,
    queues: Mutex<HashMap<String, VecDeque<SendMessageRequest>>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` messages per queue. A capacity of 0 is treated as 1.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages sent to `queue_url`, oldest first.
    pub fn messages(&self, queue_url: &str) -> Vec<SendMessageRequest> {
        self.queues
            .lock()
            .get(queue_url)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total messages across all queues.
    pub fn len(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn send(&self, request: SendMessageRequest) -> Result<String, TaskError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        debug!(queue_url = %request.queue_url, %message_id, "Queued message in memory");
        let mut queues = self.queues.lock();
        let queue = queues.entry(request.queue_url.clone()).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!(queue_url = %request.queue_url, capacity = self.capacity, "In-memory queue full, dropped oldest message");
        }
        queue.push_back(request);
        Ok(message_id)
    }
}

/// Posts the SQS query-API form to the queue URL.
///
/// Works against ElasticMQ or LocalStack style endpoints; no request signing
/// is performed.
#[derive(Debug, Clone)]
pub struct HttpQueueTransport {
    client: reqwest::Client,
}

impl HttpQueueTransport {
    pub fn new(timeout: Duration) -> Result<Self, TaskError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaskError::failed("QueueTransportError", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl QueueTransport for HttpQueueTransport {
    async fn send(&self, request: SendMessageRequest) -> Result<String, TaskError> {
        let response = self
            .client
            .post(&request.queue_url)
            .form(&request.to_form())
            .send()
            .await
            .map_err(|e| TaskError::failed("QueueTransportError", e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TaskError::failed("QueueTransportError", e.to_string()))?;

        if !status.is_success() {
            return Err(TaskError::failed(
                "QueueTransportError",
                format!("queue responded with {status}: {}", body.trim()),
            ));
        }

        parse_message_id(&body)
    }
}

/// Pull `<MessageId>` out of a query-API XML response.
fn parse_message_id(body: &str) -> Result<String, TaskError> {
    extract_message_id(body).ok_or_else(|| {
        TaskError::failed(
            "QueueTransportError",
            format!("queue response carried no MessageId: {}", body.trim()),
        )
    })
}

fn extract_message_id(body: &str) -> Option<String> {
    let start = body.find("<MessageId>")? + "<MessageId>".len();
    let end = body[start..].find("</MessageId>")? + start;
    Some(body[start..end].trim().to_string()).filter(|id| !id.is_empty())
}
