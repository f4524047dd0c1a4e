//! Dynamic message encode/decode.
//!
//! Requests arrive as JSON value trees keyed by field name; replies leave as
//! JSON value trees again. Scalar coercion is deliberately widening on the
//! way in (integers accept floats truncated toward zero, bytes accept hex
//! strings) and canonical on the way out (bytes become lowercase hex, enums
//! become numbers, only present fields are emitted).

use std::collections::HashMap;

use prost::Message;
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MapKey, MessageDescriptor, ReflectMessage,
    Value as ProtoValue,
};
use serde_json::{Map, Value};

use crate::error::{FlowPacketError, Result};

/// Encode a field dictionary as the protobuf message described by `md`.
///
/// Keys not declared on the message fail with
/// [`FlowPacketError::UnknownField`]; undeclared values simply stay at their
/// defaults.
pub fn dynamic_encode(md: &MessageDescriptor, fields: &Map<String, Value>) -> Result<Vec<u8>> {
    let msg = build_message(md, fields)?;
    Ok(msg.encode_to_vec())
}

/// Decode protobuf bytes into a JSON object tree.
///
/// Without a descriptor the payload is presented as
/// `{"_hex": "<lowercase hex>"}` so the operator still sees the raw reply.
pub fn dynamic_decode(data: &[u8], md: Option<&MessageDescriptor>) -> Result<Map<String, Value>> {
    let Some(md) = md else {
        let mut out = Map::new();
        out.insert("_hex".to_string(), Value::String(hex::encode(data)));
        return Ok(out);
    };

    let msg = DynamicMessage::decode(md.clone(), data)?;
    Ok(message_to_map(&msg))
}

fn build_message(md: &MessageDescriptor, fields: &Map<String, Value>) -> Result<DynamicMessage> {
    let mut msg = DynamicMessage::new(md.clone());
    for (name, val) in fields {
        let fd = md
            .get_field_by_name(name)
            .ok_or_else(|| FlowPacketError::UnknownField {
                field: name.clone(),
                message: md.full_name().to_string(),
            })?;
        let value = to_proto_value(&fd, name, val)?;
        msg.set_field(&fd, value);
    }
    Ok(msg)
}

fn to_proto_value(fd: &FieldDescriptor, field: &str, val: &Value) -> Result<ProtoValue> {
    if fd.is_map() {
        let Some(obj) = val.as_object() else {
            return Err(mismatch(field, "map", val));
        };
        let Kind::Message(entry) = fd.kind() else {
            return Err(mismatch(field, "map", val));
        };
        let key_fd = entry.map_entry_key_field();
        let value_fd = entry.map_entry_value_field();

        let mut map = HashMap::with_capacity(obj.len());
        for (k, v) in obj {
            let key = to_map_key(&key_fd, field, k)?;
            let value = to_singular(&value_fd, field, v)?;
            map.insert(key, value);
        }
        return Ok(ProtoValue::Map(map));
    }

    if fd.is_list() {
        let Some(items) = val.as_array() else {
            return Err(mismatch(field, "array", val));
        };
        let mut list = Vec::with_capacity(items.len());
        for item in items {
            list.push(to_singular(fd, field, item)?);
        }
        return Ok(ProtoValue::List(list));
    }

    to_singular(fd, field, val)
}

fn to_singular(fd: &FieldDescriptor, field: &str, val: &Value) -> Result<ProtoValue> {
    match fd.kind() {
        Kind::Message(md) => {
            let Some(obj) = val.as_object() else {
                return Err(mismatch(field, "message", val));
            };
            Ok(ProtoValue::Message(build_message(&md, obj)?))
        }
        kind => to_scalar(&kind, field, val),
    }
}

fn to_scalar(kind: &Kind, field: &str, val: &Value) -> Result<ProtoValue> {
    match kind {
        Kind::Bool => val
            .as_bool()
            .map(ProtoValue::Bool)
            .ok_or_else(|| mismatch(field, "bool", val)),

        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => to_i64(val)
            .map(|n| ProtoValue::I32(n as i32))
            .ok_or_else(|| mismatch(field, "int32", val)),

        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => to_i64(val)
            .map(ProtoValue::I64)
            .ok_or_else(|| mismatch(field, "int64", val)),

        Kind::Uint32 | Kind::Fixed32 => to_u64(val)
            .map(|n| ProtoValue::U32(n as u32))
            .ok_or_else(|| mismatch(field, "uint32", val)),

        Kind::Uint64 | Kind::Fixed64 => to_u64(val)
            .map(ProtoValue::U64)
            .ok_or_else(|| mismatch(field, "uint64", val)),

        Kind::Float => to_f64(val)
            .map(|f| ProtoValue::F32(f as f32))
            .ok_or_else(|| mismatch(field, "float", val)),

        Kind::Double => to_f64(val)
            .map(ProtoValue::F64)
            .ok_or_else(|| mismatch(field, "double", val)),

        Kind::String => val
            .as_str()
            .map(|s| ProtoValue::String(s.to_string()))
            .ok_or_else(|| mismatch(field, "string", val)),

        Kind::Bytes => {
            let Some(s) = val.as_str() else {
                return Err(mismatch(field, "bytes", val));
            };
            let bytes = hex::decode(s).map_err(|_| FlowPacketError::InvalidHex {
                field: field.to_string(),
            })?;
            Ok(ProtoValue::Bytes(bytes.into()))
        }

        Kind::Enum(_) => to_i64(val)
            .map(|n| ProtoValue::EnumNumber(n as i32))
            .ok_or_else(|| mismatch(field, "enum", val)),

        Kind::Message(_) => Err(mismatch(field, "message", val)),
    }
}

fn to_map_key(fd: &FieldDescriptor, field: &str, key: &str) -> Result<MapKey> {
    let err = || FlowPacketError::TypeMismatch {
        field: field.to_string(),
        expected: "map key",
        got: format!("{key:?}"),
    };
    match fd.kind() {
        Kind::Bool => key.parse().map(MapKey::Bool).map_err(|_| err()),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            key.parse().map(MapKey::I32).map_err(|_| err())
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            key.parse().map(MapKey::I64).map_err(|_| err())
        }
        Kind::Uint32 | Kind::Fixed32 => key.parse().map(MapKey::U32).map_err(|_| err()),
        Kind::Uint64 | Kind::Fixed64 => key.parse().map(MapKey::U64).map_err(|_| err()),
        Kind::String => Ok(MapKey::String(key.to_string())),
        _ => Err(err()),
    }
}

fn to_i64(val: &Value) -> Option<i64> {
    if let Some(n) = val.as_i64() {
        return Some(n);
    }
    if let Some(n) = val.as_u64() {
        return Some(n as i64);
    }
    // floats truncate toward zero
    val.as_f64().map(|f| f as i64)
}

fn to_u64(val: &Value) -> Option<u64> {
    if let Some(n) = val.as_u64() {
        return Some(n);
    }
    if let Some(n) = val.as_i64() {
        return Some(n as u64);
    }
    val.as_f64().map(|f| f as u64)
}

fn to_f64(val: &Value) -> Option<f64> {
    val.as_f64()
}

fn mismatch(field: &str, expected: &'static str, val: &Value) -> FlowPacketError {
    FlowPacketError::TypeMismatch {
        field: field.to_string(),
        expected,
        got: json_type_name(val).to_string(),
    }
}

fn json_type_name(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn message_to_map(msg: &DynamicMessage) -> Map<String, Value> {
    let mut out = Map::new();
    for fd in msg.descriptor().fields() {
        if !msg.has_field(&fd) {
            continue;
        }
        let val = msg.get_field(&fd);
        out.insert(fd.name().to_string(), proto_value_to_json(&fd, &val));
    }
    out
}

fn proto_value_to_json(fd: &FieldDescriptor, val: &ProtoValue) -> Value {
    if fd.is_map() {
        if let ProtoValue::Map(entries) = val {
            return map_to_json(fd, entries);
        }
    }
    if fd.is_list() {
        if let ProtoValue::List(items) = val {
            return Value::Array(items.iter().map(|v| scalar_to_json(fd, v)).collect());
        }
    }
    scalar_to_json(fd, val)
}

fn map_to_json(fd: &FieldDescriptor, entries: &HashMap<MapKey, ProtoValue>) -> Value {
    let Kind::Message(entry) = fd.kind() else {
        return Value::Null;
    };
    let value_fd = entry.map_entry_value_field();

    let mut out = Map::new();
    for (k, v) in entries {
        out.insert(map_key_to_string(k), scalar_to_json(&value_fd, v));
    }
    Value::Object(out)
}

fn map_key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

fn scalar_to_json(fd: &FieldDescriptor, val: &ProtoValue) -> Value {
    match val {
        ProtoValue::Message(m) => Value::Object(message_to_map(m)),
        ProtoValue::EnumNumber(n) => Value::from(*n),
        ProtoValue::Bool(b) => Value::from(*b),
        ProtoValue::Bytes(b) => Value::String(hex::encode(b)),
        ProtoValue::String(s) => Value::from(s.as_str()),
        ProtoValue::I32(n) => Value::from(*n),
        ProtoValue::I64(n) => Value::from(*n),
        ProtoValue::U32(n) => Value::from(*n),
        ProtoValue::U64(n) => Value::from(*n),
        ProtoValue::F32(f) => Value::from(*f),
        ProtoValue::F64(f) => Value::from(*f),
        _ => {
            tracing::warn!(field = fd.name(), "unexpected composite value in scalar slot");
            Value::Null
        }
    }
}
