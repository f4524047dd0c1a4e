//! Framing configuration.
//!
//! [`FramingConfig`] selects between the legacy fixed layout and the
//! field-driven layout. [`SharedFraming`] holds the active configuration as
//! an atomically replaceable snapshot: the connect handler may swap it at
//! any time, and every reader (encode sites, the stream decoder) works off
//! the `Arc` it captured, so a partially updated configuration is never
//! observed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{FlowPacketError, Result};

/// One header field of the field-driven layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name. `size`/`len` (case-insensitive) designates the size field.
    pub name: String,
    /// Field width in bytes.
    pub bytes: usize,
    /// Participates in route composition.
    #[serde(default)]
    pub is_route: bool,
    /// Carries the sequence number.
    #[serde(default)]
    pub is_seq: bool,
}

/// Compiled field-driven layout: field list plus pre-resolved roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    fields: Vec<FieldDef>,
    size_index: usize,
    seq_index: Option<usize>,
    route_fields: Vec<usize>,
    header_size: usize,
}

impl FieldSchema {
    /// Build a schema from field definitions, detecting the size, seq and
    /// route fields.
    ///
    /// Fails with [`FlowPacketError::NoSizeField`] when no field is named
    /// `size` or `len`.
    pub fn new(fields: Vec<FieldDef>) -> Result<Self> {
        let mut size_index = None;
        let mut seq_index = None;
        let mut route_fields = Vec::new();
        let mut header_size = 0;

        for (i, f) in fields.iter().enumerate() {
            if f.name.eq_ignore_ascii_case("size") || f.name.eq_ignore_ascii_case("len") {
                size_index = Some(i);
            }
            if f.is_seq {
                seq_index = Some(i);
            }
            if f.is_route {
                route_fields.push(i);
            }
            header_size += f.bytes;
        }

        let size_index = size_index.ok_or(FlowPacketError::NoSizeField)?;

        Ok(Self {
            fields,
            size_index,
            seq_index,
            route_fields,
            header_size,
        })
    }

    /// Header fields in declaration (wire) order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Total width of all header fields, body excluded.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Index of the size field.
    pub fn size_index(&self) -> usize {
        self.size_index
    }

    /// Index of the seq field, if one was declared.
    pub fn seq_index(&self) -> Option<usize> {
        self.seq_index
    }

    /// Indices of the route fields, in declaration order.
    pub fn route_fields(&self) -> &[usize] {
        &self.route_fields
    }

    /// Split a combined route value into per-field values, keyed by field
    /// index.
    ///
    /// The first declared route field is the most significant: splitting
    /// walks the route fields back-to-front, each taking the low
    /// `width * 8` bits.
    pub fn split_route(&self, route: u32) -> HashMap<usize, u32> {
        let mut out = HashMap::new();
        let mut value = route;
        for &idx in self.route_fields.iter().rev() {
            let bits = self.fields[idx].bytes * 8;
            out.insert(idx, value & width_mask(bits));
            value = if bits >= 32 { 0 } else { value >> bits };
        }
        out
    }

    /// Recompose a route value from per-field values (inverse of
    /// [`split_route`](Self::split_route)).
    pub fn combine_route(&self, values: &HashMap<usize, u32>) -> u32 {
        let mut out = 0u32;
        for &idx in &self.route_fields {
            let bits = self.fields[idx].bytes * 8;
            let val = values.get(&idx).copied().unwrap_or(0);
            out = if bits >= 32 { 0 } else { out << bits };
            out |= val & width_mask(bits);
        }
        out
    }
}

fn width_mask(bits: usize) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Packet framing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingConfig {
    /// Fixed layout `size(4) | header(1) | route | seq | body`, big-endian.
    Legacy { route_bytes: usize, seq_bytes: usize },
    /// Runtime-declared header fields, little-endian.
    FieldDriven(FieldSchema),
}

impl FramingConfig {
    /// Legacy configuration with validated widths.
    pub fn legacy(route_bytes: usize, seq_bytes: usize) -> Result<Self> {
        if !matches!(route_bytes, 1 | 2 | 4) {
            return Err(FlowPacketError::InvalidRouteBytes(route_bytes));
        }
        if !matches!(seq_bytes, 0 | 1 | 2 | 4) {
            return Err(FlowPacketError::InvalidSeqBytes(seq_bytes));
        }
        Ok(Self::Legacy {
            route_bytes,
            seq_bytes,
        })
    }

    /// Field-driven configuration from field definitions.
    pub fn field_driven(fields: Vec<FieldDef>) -> Result<Self> {
        Ok(Self::FieldDriven(FieldSchema::new(fields)?))
    }

    /// Check whether the field-driven mode is active.
    pub fn is_field_driven(&self) -> bool {
        matches!(self, Self::FieldDriven(_))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Self::Legacy {
            route_bytes,
            seq_bytes,
        } = self
        {
            if !matches!(route_bytes, 1 | 2 | 4) {
                return Err(FlowPacketError::InvalidRouteBytes(*route_bytes));
            }
            if !matches!(seq_bytes, 0 | 1 | 2 | 4) {
                return Err(FlowPacketError::InvalidSeqBytes(*seq_bytes));
            }
        }
        Ok(())
    }
}

impl Default for FramingConfig {
    /// Legacy mode with 2-byte route and 2-byte seq.
    fn default() -> Self {
        Self::Legacy {
            route_bytes: 2,
            seq_bytes: 2,
        }
    }
}

/// Shared, hot-swappable framing snapshot.
///
/// Cheap to clone; every reader takes a consistent `Arc<FramingConfig>` via
/// [`snapshot`](Self::snapshot) and keeps using it for as long as the
/// operation at hand needs (one frame decode, one keepalive session).
#[derive(Debug, Clone)]
pub struct SharedFraming {
    inner: Arc<RwLock<Arc<FramingConfig>>>,
}

impl SharedFraming {
    /// Wrap an initial configuration.
    pub fn new(cfg: FramingConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
        }
    }

    /// Current configuration snapshot.
    pub fn snapshot(&self) -> Arc<FramingConfig> {
        self.inner.read().clone()
    }

    /// Replace the configuration. Snapshots already taken are unaffected.
    pub fn replace(&self, cfg: FramingConfig) {
        *self.inner.write() = Arc::new(cfg);
    }
}

impl Default for SharedFraming {
    fn default() -> Self {
        Self::new(FramingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, bytes: usize, is_route: bool, is_seq: bool) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            bytes,
            is_route,
            is_seq,
        }
    }

    #[test]
    fn test_legacy_width_validation() {
        assert!(FramingConfig::legacy(1, 0).is_ok());
        assert!(FramingConfig::legacy(2, 2).is_ok());
        assert!(FramingConfig::legacy(4, 4).is_ok());

        assert!(matches!(
            FramingConfig::legacy(3, 2),
            Err(FlowPacketError::InvalidRouteBytes(3))
        ));
        assert!(matches!(
            FramingConfig::legacy(2, 3),
            Err(FlowPacketError::InvalidSeqBytes(3))
        ));
    }

    #[test]
    fn test_schema_role_detection() {
        let schema = FieldSchema::new(vec![
            field("magic", 2, false, false),
            field("LEN", 2, false, false),
            field("route", 2, true, false),
            field("seq", 4, false, true),
        ])
        .unwrap();

        assert_eq!(schema.size_index(), 1);
        assert_eq!(schema.seq_index(), Some(3));
        assert_eq!(schema.route_fields(), &[2]);
        assert_eq!(schema.header_size(), 10);
    }

    #[test]
    fn test_schema_requires_size_field() {
        let err = FieldSchema::new(vec![field("route", 2, true, false)]).unwrap_err();
        assert!(matches!(err, FlowPacketError::NoSizeField));
    }

    #[test]
    fn test_route_split_combine_single_field() {
        let schema = FieldSchema::new(vec![
            field("size", 2, false, false),
            field("route", 2, true, false),
        ])
        .unwrap();

        let parts = schema.split_route(0x1234);
        assert_eq!(parts.get(&1), Some(&0x1234));
        assert_eq!(schema.combine_route(&parts), 0x1234);
    }

    #[test]
    fn test_route_split_combine_multi_field() {
        // route = cmd(1B, most significant) | sub(2B)
        let schema = FieldSchema::new(vec![
            field("size", 2, false, false),
            field("cmd", 1, true, false),
            field("sub", 2, true, false),
        ])
        .unwrap();

        let parts = schema.split_route(0x00AB_CDEF);
        assert_eq!(parts.get(&1), Some(&0xAB));
        assert_eq!(parts.get(&2), Some(&0xCDEF));
        assert_eq!(schema.combine_route(&parts), 0x00AB_CDEF);
    }

    #[test]
    fn test_route_combine_is_split_inverse() {
        let schema = FieldSchema::new(vec![
            field("size", 2, false, false),
            field("a", 1, true, false),
            field("b", 1, true, false),
            field("c", 2, true, false),
        ])
        .unwrap();

        for route in [0u32, 1, 0xFF, 0x0102_0304, 0xFFFF_FFFF] {
            let parts = schema.split_route(route);
            assert_eq!(schema.combine_route(&parts), route, "route {route:#x}");
        }
    }

    #[test]
    fn test_shared_framing_snapshot_isolation() {
        let shared = SharedFraming::default();
        let before = shared.snapshot();

        shared.replace(FramingConfig::legacy(4, 4).unwrap());

        // The old snapshot is untouched, the next one sees the swap.
        assert_eq!(
            *before,
            FramingConfig::Legacy {
                route_bytes: 2,
                seq_bytes: 2
            }
        );
        assert_eq!(
            *shared.snapshot(),
            FramingConfig::Legacy {
                route_bytes: 4,
                seq_bytes: 4
            }
        );
    }

    #[test]
    fn test_field_def_json_shape() {
        let def: FieldDef =
            serde_json::from_str(r#"{"name":"size","bytes":2,"isRoute":false,"isSeq":false}"#)
                .unwrap();
        assert_eq!(def.name, "size");
        assert_eq!(def.bytes, 2);

        // role flags default to false
        let def: FieldDef = serde_json::from_str(r#"{"name":"len","bytes":4}"#).unwrap();
        assert!(!def.is_route);
        assert!(!def.is_seq);
    }
}
