//! # flowpacket
//!
//! Core of an interactive packet-flow testbench: an operator describes a
//! chain of request nodes, each carrying a schema-named message, a route and
//! a field dictionary; the engine serializes every request under a
//! configurable binary framing, sends it over a persistent TCP connection,
//! correlates the reply by sequence number and decodes it against a schema
//! catalog compiled at runtime.
//!
//! ## Architecture
//!
//! - **Framing** ([`frame`]): dual-mode packet codec — a legacy fixed layout
//!   (`size | header | route | seq | body`, big-endian) and a fully
//!   field-driven layout described at runtime (little-endian).
//! - **Schema** ([`schema`]): `.proto` sources compiled into a descriptor
//!   catalog; dynamic encode/decode without generated stubs.
//! - **Correlation** ([`correlate`]): monotonic sequence numbers with a
//!   pending-reply table.
//! - **Transport** ([`transport`]): TCP client with split read/write loops,
//!   exponential-backoff reconnection and a keepalive watchdog.
//! - **Flows** ([`flow`]): linear-chain resolution and sequential execution.
//! - **Engine** ([`engine`]): the façade tying everything together and
//!   publishing events to the embedding application.
//!
//! ## Example
//!
//! ```ignore
//! use flowpacket::{ConnectOptions, Engine};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> flowpacket::Result<()> {
//!     let (events, mut rx) = mpsc::unbounded_channel();
//!     let engine = Engine::new(events);
//!     engine
//!         .connect(ConnectOptions {
//!             host: "127.0.0.1".into(),
//!             port: 9000,
//!             ..Default::default()
//!         })
//!         .await?;
//!     // upload a catalog, register routes, run flows...
//!     Ok(())
//! }
//! ```

pub mod correlate;
pub mod engine;
pub mod error;
pub mod flow;
pub mod frame;
pub mod schema;
pub mod transport;

pub use engine::{ConnectOptions, Engine, EngineEvent, RouteMapping};
pub use error::{FlowPacketError, Result};
pub use frame::{FieldDef, FramingConfig, Packet};
