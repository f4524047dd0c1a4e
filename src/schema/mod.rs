//! Dynamic schema codec.
//!
//! `.proto` source text is compiled at runtime into a [`Catalog`] of message
//! descriptors ([`protox`] front end, [`prost_reflect`] descriptor pool);
//! requests and replies are then encoded and decoded through
//! [`prost_reflect::DynamicMessage`] with no generated stubs anywhere.

mod catalog;
mod dynamic;

pub use catalog::{
    Catalog, EnumInfo, EnumValueInfo, FieldInfo, FileInfo, MessageInfo, OneofInfo,
};
pub use dynamic::{dynamic_decode, dynamic_encode};
