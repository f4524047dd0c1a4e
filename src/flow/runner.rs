//! Sequential flow execution.
//!
//! One node at a time: resolve the request descriptor, schema-encode the
//! field dictionary, allocate a seq, frame-encode, send, wait for the
//! correlated reply, decode it, report. The first failing node aborts the
//! flow; a stop cancels the current wait promptly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use prost_reflect::MessageDescriptor;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;

use super::graph::{resolve_order, FlowEdge, FlowNode};
use crate::correlate::Correlator;
use crate::error::{FlowPacketError, Result};
use crate::frame::{self, Packet, SharedFraming};
use crate::schema;

/// Default per-node reply wait.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one executed node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: String,
    pub success: bool,
    /// The request field dictionary as sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Map<String, Value>>,
    /// Decoded reply tree (or `{"_hex": …}` for unmapped routes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time in milliseconds.
    pub duration: u64,
}

/// Single-tenant flow executor.
pub struct Runner {
    correlator: Arc<Correlator>,
    framing: SharedFraming,
    timeout: Duration,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl Runner {
    pub fn new(correlator: Arc<Correlator>, framing: SharedFraming) -> Self {
        Self {
            correlator,
            framing,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            cancel: Mutex::new(None),
        }
    }

    /// Override the per-node reply wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a flow is currently executing.
    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Cancel the running flow; the in-progress wait returns promptly.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            let _ = cancel.send(true);
        }
    }

    /// Execute `nodes` in chain order.
    ///
    /// `resolver` maps a message name to its request descriptor,
    /// `response_resolver` maps a route to the descriptor replies decode
    /// under (hex tree when it yields none), `send` puts one framed buffer
    /// on the wire, `on_node` observes every [`NodeResult`].
    ///
    /// The pending table is cleared on entry; re-entry fails with
    /// [`FlowPacketError::AlreadyRunning`].
    pub async fn execute<R, Q, S, Fut, C>(
        &self,
        nodes: &[FlowNode],
        edges: &[FlowEdge],
        resolver: R,
        response_resolver: Q,
        send: S,
        mut on_node: C,
    ) -> Result<()>
    where
        R: Fn(&str) -> Option<MessageDescriptor>,
        Q: Fn(u32) -> Option<MessageDescriptor>,
        S: Fn(Bytes) -> Fut,
        Fut: Future<Output = Result<()>>,
        C: FnMut(&NodeResult),
    {
        let order = resolve_order(nodes, edges)?;
        let node_map: HashMap<&str, &FlowNode> =
            nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut cancel_rx = {
            let mut cancel = self.cancel.lock();
            if cancel.is_some() {
                return Err(FlowPacketError::AlreadyRunning);
            }
            let (tx, rx) = watch::channel(false);
            *cancel = Some(tx);
            rx
        };

        self.correlator.reset();

        let result = async {
            for id in &order {
                if *cancel_rx.borrow() {
                    return Err(FlowPacketError::Cancelled);
                }
                let Some(node) = node_map.get(id.as_str()) else {
                    continue;
                };

                let result = self
                    .execute_node(node, &resolver, &response_resolver, &send, &mut cancel_rx)
                    .await?;
                let failure = if result.success {
                    None
                } else {
                    Some(result.error.clone().unwrap_or_default())
                };
                on_node(&result);

                if let Some(message) = failure {
                    return Err(FlowPacketError::NodeFailed {
                        node_id: id.clone(),
                        message,
                    });
                }
            }
            Ok(())
        }
        .await;

        *self.cancel.lock() = None;
        result
    }

    async fn execute_node<R, Q, S, Fut>(
        &self,
        node: &FlowNode,
        resolver: &R,
        response_resolver: &Q,
        send: &S,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<NodeResult>
    where
        R: Fn(&str) -> Option<MessageDescriptor>,
        Q: Fn(u32) -> Option<MessageDescriptor>,
        S: Fn(Bytes) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let start = Instant::now();

        let Some(descriptor) = resolver(&node.message_name) else {
            return Ok(failure(
                node,
                start,
                format!("message {:?} not found", node.message_name),
            ));
        };

        let payload = match schema::dynamic_encode(&descriptor, &node.fields) {
            Ok(payload) => payload,
            Err(err) => return Ok(failure(node, start, format!("encode: {err}"))),
        };

        let (seq, slot) = self.correlator.next_seq();
        let pkt = Packet::new(node.route, seq, payload.into());
        let cfg = self.framing.snapshot();
        let frame_bytes = match frame::encode(&pkt, &cfg) {
            Ok(frame) => frame,
            Err(err) => return Ok(failure(node, start, format!("frame encode: {err}"))),
        };

        if let Err(err) = send(frame_bytes).await {
            return Ok(failure(node, start, format!("send: {err}")));
        }

        let reply = tokio::select! {
            reply = slot.wait(self.timeout) => reply,
            _ = cancel_rx.changed() => return Err(FlowPacketError::Cancelled),
        };
        let reply = match reply {
            Ok(data) => data,
            // a reset slot means the flow was torn down, not a node fault
            Err(FlowPacketError::Cancelled) => return Err(FlowPacketError::Cancelled),
            Err(err) => return Ok(failure(node, start, format!("wait response: {err}"))),
        };

        let response_md = response_resolver(node.route);
        let tree = match schema::dynamic_decode(&reply, response_md.as_ref()) {
            Ok(tree) => tree,
            Err(err) => return Ok(failure(node, start, format!("decode response: {err}"))),
        };

        Ok(NodeResult {
            node_id: node.id.clone(),
            success: true,
            request: Some(node.fields.clone()),
            response: Some(Value::Object(tree)),
            error: None,
            duration: start.elapsed().as_millis() as u64,
        })
    }
}

fn failure(node: &FlowNode, start: Instant, error: String) -> NodeResult {
    NodeResult {
        node_id: node.id.clone(),
        success: false,
        request: Some(node.fields.clone()),
        response: None,
        error: Some(error),
        duration: start.elapsed().as_millis() as u64,
    }
}
