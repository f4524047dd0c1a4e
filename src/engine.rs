//! Engine façade.
//!
//! Owns the framing configuration, the TCP transport, the correlator, the
//! flow runner, the route→message table and the catalog slot, and exposes
//! the operations the embedding application drives over its JSON channel:
//! configure/connect/disconnect/send, catalog replacement, route mapping
//! maintenance, and flow execution. Everything the application needs to
//! hear comes back as [`EngineEvent`]s on the subscriber channel handed in
//! at construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::correlate::Correlator;
use crate::error::{FlowPacketError, Result};
use crate::flow::{FlowEdge, FlowNode, NodeResult, Runner};
use crate::frame::{FieldDef, FramingConfig, SharedFraming};
use crate::schema::Catalog;
use crate::transport::{
    ConnState, HeartbeatConfig, ReconnectConfig, TcpClient, TransportEvent,
};

/// Payload of a connect request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Dial timeout in seconds; 0/absent means unbounded.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Re-dial automatically after connection loss.
    #[serde(default)]
    pub reconnect: bool,
    /// Run the keepalive ticker on this connection.
    #[serde(default)]
    pub heartbeat: bool,
    /// Frame layout; empty keeps the current framing configuration.
    #[serde(default)]
    pub frame_fields: Vec<FieldDef>,
}

/// Route → request/response message mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMapping {
    pub route: u32,
    #[serde(default)]
    pub request_msg: String,
    #[serde(default)]
    pub response_msg: String,
}

/// Events published to the engine subscriber.
#[derive(Debug)]
pub enum EngineEvent {
    /// Connection state changed.
    ConnState {
        state: ConnState,
        addr: Option<String>,
    },
    /// A flow began executing.
    FlowStarted,
    /// A node finished successfully.
    NodeResult(NodeResult),
    /// A node failed (the flow stops after this).
    NodeError { node_id: String, error: String },
    /// The flow ran to completion.
    FlowComplete,
    /// The flow aborted.
    FlowError { error: String },
    /// Automatic reconnection gave up.
    ReconnectGaveUp { retries: u32 },
}

/// The packet-engine façade. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    framing: SharedFraming,
    transport: TcpClient,
    runner: Runner,
    routes: RwLock<HashMap<u32, RouteMapping>>,
    catalog: RwLock<Option<Arc<Catalog>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    /// Build an engine publishing to `events`.
    ///
    /// Must run inside a tokio runtime: the engine spawns its transport
    /// event pump here.
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let framing = SharedFraming::default();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = TcpClient::new(framing.clone(), transport_tx);
        let correlator = Arc::new(Correlator::new());
        let runner = Runner::new(correlator.clone(), framing.clone());

        tokio::spawn(pump(transport_rx, correlator, events.clone()));

        Self {
            inner: Arc::new(EngineInner {
                framing,
                transport,
                runner,
                routes: RwLock::new(HashMap::new()),
                catalog: RwLock::new(None),
                events,
            }),
        }
    }

    /// Derive and install a framing configuration from operator-declared
    /// frame fields. An empty list keeps the current configuration.
    ///
    /// A 1-byte field named `header` (case-insensitive) marks the legacy
    /// layout: its route width is the sum of the route-flagged field widths
    /// and its seq width comes from the seq field. Anything else is
    /// field-driven.
    pub fn configure_framing(&self, fields: &[FieldDef]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let legacy = fields
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case("header") && f.bytes == 1);

        let cfg = if legacy {
            let route_bytes = fields.iter().filter(|f| f.is_route).map(|f| f.bytes).sum();
            let seq_bytes = fields
                .iter()
                .find(|f| f.is_seq || f.name.eq_ignore_ascii_case("seq"))
                .map(|f| f.bytes)
                .unwrap_or(0);
            FramingConfig::legacy(route_bytes, seq_bytes)?
        } else {
            FramingConfig::field_driven(fields.to_vec())?
        };

        self.inner.framing.replace(cfg);
        Ok(())
    }

    /// Apply the connect options and dial the target.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        self.configure_framing(&opts.frame_fields)?;

        self.inner.transport.set_reconnect_config(ReconnectConfig {
            enabled: opts.reconnect,
            ..ReconnectConfig::default()
        });
        self.inner.transport.set_heartbeat_config(HeartbeatConfig {
            enabled: opts.heartbeat,
            ..HeartbeatConfig::default()
        });
        self.inner
            .transport
            .set_connect_timeout(opts.timeout.filter(|t| *t > 0).map(Duration::from_secs));

        let addr = format!("{}:{}", opts.host, opts.port);
        self.inner.transport.connect(&addr).await
    }

    /// Stop reconnection and drop the connection.
    pub fn disconnect(&self) {
        self.inner.transport.disconnect();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.inner.transport.state()
    }

    /// Send a pre-framed buffer over the connection.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.inner.transport.send(frame).await
    }

    /// Current framing snapshot.
    pub fn framing(&self) -> Arc<FramingConfig> {
        self.inner.framing.snapshot()
    }

    /// Replace the schema catalog wholesale.
    pub fn set_catalog(&self, catalog: Catalog) {
        *self.inner.catalog.write() = Some(Arc::new(catalog));
    }

    /// Current catalog snapshot, if one has been uploaded.
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.inner.catalog.read().clone()
    }

    /// Insert or replace a route mapping. Route 0 is rejected.
    pub fn set_route(&self, mapping: RouteMapping) -> Result<()> {
        if mapping.route == 0 {
            return Err(FlowPacketError::InvalidRoute);
        }
        self.inner.routes.write().insert(mapping.route, mapping);
        Ok(())
    }

    /// Remove a route mapping, if present.
    pub fn delete_route(&self, route: u32) {
        self.inner.routes.write().remove(&route);
    }

    /// All route mappings, ordered by route.
    pub fn routes(&self) -> Vec<RouteMapping> {
        let mut routes: Vec<_> = self.inner.routes.read().values().cloned().collect();
        routes.sort_by_key(|m| m.route);
        routes
    }

    /// Launch a flow in the background.
    ///
    /// Fails synchronously with [`FlowPacketError::AlreadyRunning`] when a
    /// flow is active; everything else is reported through events
    /// (`FlowStarted`, per-node results, then `FlowComplete`/`FlowError`).
    pub fn execute_flow(&self, nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Result<()> {
        if self.inner.runner.is_running() {
            return Err(FlowPacketError::AlreadyRunning);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = inner.events.send(EngineEvent::FlowStarted);

            // flows run against the catalog and route table as of launch
            let catalog = inner.catalog.read().clone();
            let routes = inner.routes.read().clone();
            let transport = inner.transport.clone();
            let node_events = inner.events.clone();

            let resolver = {
                let catalog = catalog.clone();
                move |name: &str| catalog.as_ref().and_then(|c| c.find_message(name))
            };
            let response_resolver = move |route: u32| {
                let mapping = routes.get(&route)?;
                catalog.as_ref()?.find_message(&mapping.response_msg)
            };
            let send = move |frame: Bytes| {
                let transport = transport.clone();
                async move { transport.send(frame).await }
            };
            let on_node = move |result: &NodeResult| {
                let event = if result.success {
                    EngineEvent::NodeResult(result.clone())
                } else {
                    EngineEvent::NodeError {
                        node_id: result.node_id.clone(),
                        error: result.error.clone().unwrap_or_default(),
                    }
                };
                let _ = node_events.send(event);
            };

            let outcome = inner
                .runner
                .execute(&nodes, &edges, resolver, response_resolver, send, on_node)
                .await;

            let event = match outcome {
                Ok(()) => EngineEvent::FlowComplete,
                Err(err) => EngineEvent::FlowError {
                    error: err.to_string(),
                },
            };
            let _ = inner.events.send(event);
        });

        Ok(())
    }

    /// Cancel the running flow, if any.
    pub fn stop_flow(&self) {
        self.inner.runner.stop();
    }
}

/// Translate transport events: frames feed the correlator, lifecycle
/// changes are forwarded to the subscriber.
async fn pump(
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    correlator: Arc<Correlator>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    while let Some(event) = transport_rx.recv().await {
        match event {
            TransportEvent::Frame(pkt) => {
                if pkt.is_heartbeat() {
                    continue;
                }
                // exact seq match first, then the oldest waiter for servers
                // that reply with seq 0
                if !correlator.resolve(pkt.seq, pkt.data.clone())
                    && !correlator.resolve_first(pkt.data)
                {
                    tracing::debug!(seq = pkt.seq, "reply without a pending request");
                }
            }
            TransportEvent::Connected { peer } => {
                let _ = events.send(EngineEvent::ConnState {
                    state: ConnState::Connected,
                    addr: Some(peer.to_string()),
                });
            }
            TransportEvent::Disconnected { error } => {
                tracing::debug!(error = %error, "transport disconnected");
                let _ = events.send(EngineEvent::ConnState {
                    state: ConnState::Disconnected,
                    addr: None,
                });
            }
            TransportEvent::ReconnectGaveUp { retries } => {
                let _ = events.send(EngineEvent::ReconnectGaveUp { retries });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (Engine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Engine::new(tx), rx)
    }

    fn field(name: &str, bytes: usize, is_route: bool, is_seq: bool) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            bytes,
            is_route,
            is_seq,
        }
    }

    #[tokio::test]
    async fn test_configure_framing_detects_legacy() {
        let (engine, _rx) = engine();

        engine
            .configure_framing(&[
                field("size", 4, false, false),
                field("header", 1, false, false),
                field("route", 2, true, false),
                field("seq", 2, false, true),
            ])
            .unwrap();

        assert_eq!(
            *engine.framing(),
            FramingConfig::Legacy {
                route_bytes: 2,
                seq_bytes: 2
            }
        );
    }

    #[tokio::test]
    async fn test_configure_framing_legacy_sums_route_fields() {
        let (engine, _rx) = engine();

        engine
            .configure_framing(&[
                field("header", 1, false, false),
                field("cmd", 2, true, false),
                field("sub", 2, true, false),
                field("seq", 4, false, true),
            ])
            .unwrap();

        assert_eq!(
            *engine.framing(),
            FramingConfig::Legacy {
                route_bytes: 4,
                seq_bytes: 4
            }
        );
    }

    #[tokio::test]
    async fn test_configure_framing_field_driven() {
        let (engine, _rx) = engine();

        engine
            .configure_framing(&[
                field("len", 2, false, false),
                field("route", 2, true, false),
                field("seq", 2, false, true),
            ])
            .unwrap();

        assert!(engine.framing().is_field_driven());
    }

    #[tokio::test]
    async fn test_configure_framing_empty_keeps_current() {
        let (engine, _rx) = engine();
        let before = engine.framing();
        engine.configure_framing(&[]).unwrap();
        assert_eq!(*engine.framing(), *before);
    }

    #[tokio::test]
    async fn test_configure_framing_rejects_bad_layouts() {
        let (engine, _rx) = engine();

        // legacy with a 3-byte route sum
        let err = engine
            .configure_framing(&[
                field("header", 1, false, false),
                field("route", 3, true, false),
            ])
            .unwrap_err();
        assert!(matches!(err, FlowPacketError::InvalidRouteBytes(3)));

        // field-driven without a size field
        let err = engine
            .configure_framing(&[field("route", 2, true, false)])
            .unwrap_err();
        assert!(matches!(err, FlowPacketError::NoSizeField));
    }

    #[tokio::test]
    async fn test_route_table() {
        let (engine, _rx) = engine();

        let err = engine
            .set_route(RouteMapping {
                route: 0,
                request_msg: String::new(),
                response_msg: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, FlowPacketError::InvalidRoute));

        engine
            .set_route(RouteMapping {
                route: 2,
                request_msg: "t.Req".into(),
                response_msg: "t.Resp".into(),
            })
            .unwrap();
        engine
            .set_route(RouteMapping {
                route: 1,
                request_msg: "t.A".into(),
                response_msg: "t.B".into(),
            })
            .unwrap();

        let routes = engine.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].route, 1);
        assert_eq!(routes[1].route, 2);

        engine.delete_route(1);
        assert_eq!(engine.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_catalog_replacement_is_wholesale() {
        let (engine, _rx) = engine();
        assert!(engine.catalog().is_none());

        engine.set_catalog(
            Catalog::parse_sources([(
                "a.proto",
                "syntax = \"proto3\";\npackage a;\nmessage First { int32 x = 1; }\n",
            )])
            .unwrap(),
        );
        let first = engine.catalog().unwrap();
        assert!(first.find_message("a.First").is_some());

        engine.set_catalog(
            Catalog::parse_sources([(
                "b.proto",
                "syntax = \"proto3\";\npackage b;\nmessage Second { int32 x = 1; }\n",
            )])
            .unwrap(),
        );
        let second = engine.catalog().unwrap();
        assert!(second.find_message("b.Second").is_some());
        assert!(second.find_message("a.First").is_none());

        // the old snapshot still answers for readers that captured it
        assert!(first.find_message("a.First").is_some());
    }

    #[tokio::test]
    async fn test_connect_options_json_shape() {
        let opts: ConnectOptions = serde_json::from_str(
            r#"{
                "host": "127.0.0.1",
                "port": 9000,
                "timeout": 3,
                "reconnect": true,
                "heartbeat": false,
                "frameFields": [
                    {"name": "size", "bytes": 2},
                    {"name": "seq", "bytes": 2, "isSeq": true}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(opts.host, "127.0.0.1");
        assert_eq!(opts.port, 9000);
        assert_eq!(opts.timeout, Some(3));
        assert!(opts.reconnect);
        assert!(!opts.heartbeat);
        assert_eq!(opts.frame_fields.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let (engine, _rx) = engine();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = engine
            .connect(ConnectOptions {
                host: "127.0.0.1".into(),
                port,
                ..ConnectOptions::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowPacketError::Io(_)));
        assert_eq!(engine.state(), ConnState::Disconnected);
    }
}
