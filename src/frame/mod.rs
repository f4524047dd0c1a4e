//! Dual-mode binary framing.
//!
//! Two wire layouts are supported, selected by [`FramingConfig`]:
//!
//! ```text
//! Legacy (big-endian):
//! ┌───────────┬────────────┬───────────────┬─────────────────┬──────┐
//! │ size (4B) │ header (1B)│ route (1/2/4B)│ seq (0/1/2/4B)  │ body │
//! └───────────┴────────────┴───────────────┴─────────────────┴──────┘
//! header bit 7 = heartbeat flag, bits 0..6 = ext code
//!
//! Field-driven (little-endian):
//! ┌─────────┬─────────┬─────┬───────────────┬──────┐
//! │ field 0 │ field 1 │ ... │ field k-1     │ body │
//! └─────────┴─────────┴─────┴───────────────┴──────┘
//! declaration order is wire order; one field carries the body length
//! ```

mod codec;
mod config;
mod packet;
mod reader;

pub use codec::{decode_bytes, encode};
pub use config::{FieldDef, FieldSchema, FramingConfig, SharedFraming};
pub use packet::Packet;
pub use reader::read_packet;
