//! Schema catalog: compile `.proto` sources and introspect descriptors.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use prost_reflect::{
    DescriptorPool, EnumDescriptor, FieldDescriptor, FileDescriptor, Kind, MessageDescriptor,
    OneofDescriptor,
};
use prost_types::field_descriptor_proto::Label;
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{FlowPacketError, Result};

/// File-level schema summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub package: String,
    pub messages: Vec<MessageInfo>,
    pub enums: Vec<EnumInfo>,
}

/// One message type, with nested types included.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    /// Fully-qualified name (`package.Message` or `package.Outer.Inner`).
    pub name: String,
    pub short_name: String,
    pub fields: Vec<FieldInfo>,
    pub oneofs: Vec<OneofInfo>,
    pub nested_messages: Vec<MessageInfo>,
    pub nested_enums: Vec<EnumInfo>,
}

/// One message field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    /// Scalar kind name, or the full name of the message/enum type.
    #[serde(rename = "type")]
    pub type_name: String,
    /// One of `scalar`, `message`, `enum`.
    pub kind: String,
    pub is_repeated: bool,
    pub is_optional: bool,
    pub is_map: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oneof_name: Option<String>,
}

/// A non-synthetic oneof group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneofInfo {
    pub name: String,
    pub fields: Vec<String>,
}

/// An enum type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumInfo {
    pub name: String,
    pub values: Vec<EnumValueInfo>,
}

/// One enum value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumValueInfo {
    pub name: String,
    pub number: i32,
}

/// A compiled descriptor catalog.
///
/// Holds the descriptor pool of one parse, plus the pre-extracted
/// introspection tree for the files that were explicitly compiled (imports
/// resolve but are not listed).
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: DescriptorPool,
    files: Vec<FileInfo>,
}

impl Catalog {
    /// An empty catalog (no messages).
    pub fn empty() -> Self {
        Self {
            pool: DescriptorPool::new(),
            files: Vec::new(),
        }
    }

    /// Compile every `.proto` file under `root`.
    ///
    /// Import paths are `root` plus every directory that contains at least
    /// one schema file, so `import "sub/x.proto"` resolves against the root
    /// while a sub-selected subtree still resolves its local imports.
    /// Well-known `google.protobuf` imports are always available.
    pub fn parse_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;

        let mut rel_paths: Vec<String> = Vec::new();
        let mut parent_dirs: HashSet<PathBuf> = HashSet::new();
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(|e| {
                FlowPacketError::Io(std::io::Error::other(e.to_string()))
            })?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some("proto")
            {
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| FlowPacketError::Io(std::io::Error::other(e.to_string())))?;
                rel_paths.push(path_to_proto_name(rel));
                if let Some(parent) = entry.path().parent() {
                    parent_dirs.insert(parent.to_path_buf());
                }
            }
        }

        if rel_paths.is_empty() {
            return Ok(Self::empty());
        }

        let mut includes = vec![root.clone()];
        includes.extend(parent_dirs.into_iter().filter(|d| *d != root));

        let mut compiler = protox::Compiler::new(includes)?;
        compiler.include_imports(true);
        compiler.open_files(rel_paths.iter())?;

        Self::from_compiler(&compiler, rel_paths.into_iter().collect())
    }

    /// Compile in-memory `(file name, source text)` pairs.
    ///
    /// Sources may import each other by the given names; well-known
    /// `google.protobuf` imports resolve as usual.
    pub fn parse_sources<I, N, S>(sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut files = HashMap::new();
        for (name, source) in sources {
            let name = name.into();
            names.push(name.clone());
            files.insert(name, source.into());
        }

        if names.is_empty() {
            return Ok(Self::empty());
        }

        let mut resolver = ChainFileResolver::new();
        resolver.add(SourceSet { files });
        resolver.add(GoogleFileResolver::new());

        let mut compiler = protox::Compiler::with_file_resolver(resolver);
        compiler.include_imports(true);
        compiler.open_files(names.iter())?;

        Self::from_compiler(&compiler, names.into_iter().collect())
    }

    fn from_compiler(compiler: &protox::Compiler, compiled: HashSet<String>) -> Result<Self> {
        let pool = DescriptorPool::from_file_descriptor_set(compiler.file_descriptor_set())?;
        let files = pool
            .files()
            .filter(|f| compiled.contains(f.name()))
            .map(|f| file_info(&f))
            .collect();
        Ok(Self { pool, files })
    }

    /// Per-file introspection of the compiled schema files.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    /// Every compiled message, nested messages included and map-entry
    /// synthetics excluded, flattened in declaration order.
    pub fn all_messages(&self) -> Vec<MessageInfo> {
        let mut out = Vec::new();
        for file in &self.files {
            flatten_messages(&file.messages, &mut out);
        }
        out
    }

    /// Look up a message descriptor by fully-qualified name, descending
    /// into nested messages.
    pub fn find_message(&self, full_name: &str) -> Option<MessageDescriptor> {
        self.pool.get_message_by_name(full_name)
    }
}

fn flatten_messages(messages: &[MessageInfo], out: &mut Vec<MessageInfo>) {
    for m in messages {
        out.push(m.clone());
        flatten_messages(&m.nested_messages, out);
    }
}

fn path_to_proto_name(path: &Path) -> String {
    let parts: Vec<_> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// In-memory source resolver for [`Catalog::parse_sources`].
#[derive(Debug)]
struct SourceSet {
    files: HashMap<String, String>,
}

impl FileResolver for SourceSet {
    fn open_file(&self, name: &str) -> std::result::Result<File, protox::Error> {
        match self.files.get(name) {
            Some(source) => File::from_source(name, source),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}

fn file_info(fd: &FileDescriptor) -> FileInfo {
    FileInfo {
        path: fd.name().to_string(),
        package: fd.package_name().to_string(),
        messages: fd.messages().map(|m| message_info(&m)).collect(),
        enums: fd.enums().map(|e| enum_info(&e)).collect(),
    }
}

fn message_info(md: &MessageDescriptor) -> MessageInfo {
    MessageInfo {
        name: md.full_name().to_string(),
        short_name: md.name().to_string(),
        fields: md.fields().map(|f| field_info(&f)).collect(),
        oneofs: md
            .oneofs()
            .filter(|o| !oneof_is_synthetic(o))
            .map(|o| OneofInfo {
                name: o.name().to_string(),
                fields: o.fields().map(|f| f.name().to_string()).collect(),
            })
            .collect(),
        nested_messages: md
            .child_messages()
            .filter(|m| !m.is_map_entry())
            .map(|m| message_info(&m))
            .collect(),
        nested_enums: md.child_enums().map(|e| enum_info(&e)).collect(),
    }
}

fn field_info(fd: &FieldDescriptor) -> FieldInfo {
    let (kind, type_name) = match fd.kind() {
        Kind::Message(m) => ("message", m.full_name().to_string()),
        Kind::Enum(e) => ("enum", e.full_name().to_string()),
        k => ("scalar", scalar_kind_name(&k).to_string()),
    };

    let (map_key, map_value) = if fd.is_map() {
        map_entry_types(fd)
    } else {
        (None, None)
    };

    FieldInfo {
        name: fd.name().to_string(),
        number: fd.number(),
        type_name,
        kind: kind.to_string(),
        is_repeated: fd.is_list(),
        is_optional: field_is_optional(fd),
        is_map: fd.is_map(),
        map_key,
        map_value,
        oneof_name: fd
            .containing_oneof()
            .filter(|o| !oneof_is_synthetic(o))
            .map(|o| o.name().to_string()),
    }
}

fn map_entry_types(fd: &FieldDescriptor) -> (Option<String>, Option<String>) {
    let Kind::Message(entry) = fd.kind() else {
        return (None, None);
    };
    let key = entry
        .map_entry_key_field()
        .kind();
    let value = entry.map_entry_value_field().kind();
    let value_name = match value {
        Kind::Message(m) => m.full_name().to_string(),
        Kind::Enum(e) => e.full_name().to_string(),
        k => scalar_kind_name(&k).to_string(),
    };
    (
        Some(scalar_kind_name(&key).to_string()),
        Some(value_name),
    )
}

fn enum_info(ed: &EnumDescriptor) -> EnumInfo {
    EnumInfo {
        name: ed.full_name().to_string(),
        values: ed
            .values()
            .map(|v| EnumValueInfo {
                name: v.name().to_string(),
                number: v.number(),
            })
            .collect(),
    }
}

/// proto3 `optional` generates a single-field synthetic oneof; those are
/// hidden from introspection.
fn oneof_is_synthetic(oneof: &OneofDescriptor) -> bool {
    let mut fields = oneof.fields();
    match (fields.next(), fields.next()) {
        (Some(f), None) => f.field_descriptor_proto().proto3_optional(),
        _ => false,
    }
}

fn field_is_optional(fd: &FieldDescriptor) -> bool {
    let proto = fd.field_descriptor_proto();
    if proto.proto3_optional() {
        return true;
    }
    // proto2 `optional` keyword (empty syntax string means proto2)
    let parent_file = fd.parent_message().parent_file();
    let file_proto = parent_file.file_descriptor_proto();
    let syntax = file_proto.syntax.as_deref().unwrap_or("proto2");
    syntax == "proto2" && proto.label() == Label::Optional && fd.containing_oneof().is_none()
}

fn scalar_kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int32 => "int32",
        Kind::Int64 => "int64",
        Kind::Uint32 => "uint32",
        Kind::Uint64 => "uint64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Fixed32 => "fixed32",
        Kind::Fixed64 => "fixed64",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Message(_) => "message",
        Kind::Enum(_) => "enum",
    }
}
