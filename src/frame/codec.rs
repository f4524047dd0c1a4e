//! Packet encode/decode against a framing configuration.
//!
//! Legacy mode writes big-endian with a 4-byte size prefix counting every
//! byte after itself; field-driven mode writes the declared header fields
//! little-endian with the size field counting only the body.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::config::{FieldSchema, FramingConfig};
use super::packet::Packet;
use crate::error::{FlowPacketError, Result};

/// Encode a packet into a complete frame.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use flowpacket::frame::{encode, FramingConfig, Packet};
///
/// let cfg = FramingConfig::legacy(2, 2).unwrap();
/// let pkt = Packet::new(1001, 1, Bytes::from_static(&[0x0A, 0x0B, 0x0C]));
/// let frame = encode(&pkt, &cfg).unwrap();
/// assert_eq!(frame.len(), 12);
/// ```
pub fn encode(pkt: &Packet, cfg: &FramingConfig) -> Result<Bytes> {
    match cfg {
        FramingConfig::FieldDriven(schema) => Ok(field_driven_encode(pkt, schema)),
        FramingConfig::Legacy {
            route_bytes,
            seq_bytes,
        } => {
            if pkt.heartbeat {
                Ok(encode_heartbeat(pkt))
            } else {
                cfg.validate()?;
                Ok(encode_data(pkt, *route_bytes, *seq_bytes))
            }
        }
    }
}

/// Decode one packet from a complete buffer.
pub fn decode_bytes(data: &[u8], cfg: &FramingConfig) -> Result<Packet> {
    match cfg {
        FramingConfig::FieldDriven(schema) => field_driven_decode_bytes(data, schema),
        FramingConfig::Legacy {
            route_bytes,
            seq_bytes,
        } => legacy_decode_bytes(data, *route_bytes, *seq_bytes),
    }
}

fn encode_heartbeat(pkt: &Packet) -> Bytes {
    let payload_size = 1 + pkt.data.len();
    let mut buf = BytesMut::with_capacity(4 + payload_size);
    buf.put_u32(payload_size as u32);
    buf.put_u8(0x80 | (pkt.ext_code & 0x7F));
    buf.put_slice(&pkt.data);
    buf.freeze()
}

fn encode_data(pkt: &Packet, route_bytes: usize, seq_bytes: usize) -> Bytes {
    let payload_size = 1 + route_bytes + seq_bytes + pkt.data.len();
    let mut buf = BytesMut::with_capacity(4 + payload_size);
    buf.put_u32(payload_size as u32);
    buf.put_u8(pkt.ext_code & 0x7F);
    put_uint_be(&mut buf, pkt.route, route_bytes);
    put_uint_be(&mut buf, pkt.seq, seq_bytes);
    buf.put_slice(&pkt.data);
    buf.freeze()
}

fn legacy_decode_bytes(data: &[u8], route_bytes: usize, seq_bytes: usize) -> Result<Packet> {
    const FIXED: usize = 5; // size(4) + header(1)
    if data.len() < FIXED {
        return Err(FlowPacketError::ShortHeader {
            have: data.len(),
            need: FIXED,
        });
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if size == 0 {
        return Err(FlowPacketError::ZeroSize);
    }
    if size + 4 > data.len() {
        return Err(FlowPacketError::Incomplete {
            need: size + 4,
            have: data.len(),
        });
    }

    parse_legacy_payload(&data[4..4 + size], route_bytes, seq_bytes)
}

/// Parse a legacy payload (everything after the size prefix).
pub(crate) fn parse_legacy_payload(
    payload: &[u8],
    route_bytes: usize,
    seq_bytes: usize,
) -> Result<Packet> {
    let header = payload[0];
    let heartbeat = header & 0x80 != 0;
    let ext_code = header & 0x7F;

    if heartbeat {
        return Ok(Packet {
            heartbeat: true,
            ext_code,
            route: 0,
            seq: 0,
            data: Bytes::copy_from_slice(&payload[1..]),
        });
    }

    let min = 1 + route_bytes + seq_bytes;
    if payload.len() < min {
        return Err(FlowPacketError::InvalidDataPacket {
            size: payload.len(),
            min,
        });
    }

    let mut offset = 1;
    let route = read_uint_be(&payload[offset..], route_bytes);
    offset += route_bytes;
    let seq = if seq_bytes > 0 {
        let seq = read_uint_be(&payload[offset..], seq_bytes);
        offset += seq_bytes;
        seq
    } else {
        0
    };

    Ok(Packet {
        heartbeat: false,
        ext_code,
        route,
        seq,
        data: Bytes::copy_from_slice(&payload[offset..]),
    })
}

fn field_driven_encode(pkt: &Packet, schema: &FieldSchema) -> Bytes {
    let mut buf = BytesMut::with_capacity(schema.header_size() + pkt.data.len());
    let route_values = schema.split_route(pkt.route);

    for (i, f) in schema.fields().iter().enumerate() {
        let val = if i == schema.size_index() {
            pkt.data.len() as u32
        } else if f.is_route {
            route_values.get(&i).copied().unwrap_or(0)
        } else if f.is_seq {
            pkt.seq
        } else {
            0
        };
        put_uint_le(&mut buf, val, f.bytes);
    }

    buf.put_slice(&pkt.data);
    buf.freeze()
}

fn field_driven_decode_bytes(data: &[u8], schema: &FieldSchema) -> Result<Packet> {
    if data.len() < schema.header_size() {
        return Err(FlowPacketError::ShortHeader {
            have: data.len(),
            need: schema.header_size(),
        });
    }

    let (size, seq, route_values) = parse_field_header(data, schema);
    let end = schema.header_size() + size;
    if end > data.len() {
        return Err(FlowPacketError::Incomplete {
            need: end,
            have: data.len(),
        });
    }

    Ok(Packet {
        heartbeat: false,
        ext_code: 0,
        route: schema.combine_route(&route_values),
        seq,
        data: Bytes::copy_from_slice(&data[schema.header_size()..end]),
    })
}

/// Extract the size, seq and per-field route values from a complete header.
///
/// Unrecognized header fields (protocol magics and the like) are read and
/// ignored.
pub(crate) fn parse_field_header(
    buf: &[u8],
    schema: &FieldSchema,
) -> (usize, u32, HashMap<usize, u32>) {
    let mut route_values = HashMap::new();
    let mut seq = 0u32;
    let mut size = 0usize;

    let mut offset = 0;
    for (i, f) in schema.fields().iter().enumerate() {
        let val = read_uint_le(&buf[offset..], f.bytes);
        if i == schema.size_index() {
            size = val as usize;
        } else if f.is_route {
            route_values.insert(i, val);
        } else if f.is_seq {
            seq = val;
        }
        offset += f.bytes;
    }

    (size, seq, route_values)
}

fn put_uint_be(buf: &mut BytesMut, val: u32, n: usize) {
    match n {
        1 => buf.put_u8(val as u8),
        2 => buf.put_u16(val as u16),
        4 => buf.put_u32(val),
        _ => {}
    }
}

fn read_uint_be(buf: &[u8], n: usize) -> u32 {
    match n {
        1 => buf[0] as u32,
        2 => u16::from_be_bytes([buf[0], buf[1]]) as u32,
        4 => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        _ => 0,
    }
}

fn put_uint_le(buf: &mut BytesMut, val: u32, n: usize) {
    for i in 0..n {
        let byte = if i < 4 { (val >> (8 * i)) as u8 } else { 0 };
        buf.put_u8(byte);
    }
}

fn read_uint_le(buf: &[u8], n: usize) -> u32 {
    let mut val = 0u32;
    for (i, b) in buf.iter().take(n.min(4)).enumerate() {
        val |= (*b as u32) << (8 * i);
    }
    val
}
