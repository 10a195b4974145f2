//! Module format
//!
//! A [`Module`] owns arenas of type, field, method and property definitions
//! addressed by stable ids. Definitions are never removed, so ids handed out
//! while a module is being rewritten stay valid.

use crate::body::MethodBody;
use crate::encoder::{DecodeError, ImageReader, ImageWriter};
use crate::types::{
    MethodSignature, ResolutionScope, TypeDefId, TypeDefOrRef, TypeReference, TypeSignature,
};
use crate::verify::{verify_tables, VerifyError};
use thiserror::Error;

/// Magic number for veil images: "VEIL"
pub const MAGIC: [u8; 4] = *b"VEIL";

/// Current image version
pub const VERSION: u32 = 1;

/// Name of the global type holding module-level methods
pub const MODULE_TYPE_NAME: &str = "<Module>";

/// Module encoding/decoding errors
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Decode error
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected VEIL, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Tables refer to definitions the image does not contain
    #[error("Malformed image: {0}")]
    Malformed(#[from] VerifyError),
}

/// Type attribute flags (ECMA-335 II.23.1.15)
pub mod type_attributes {
    pub const VISIBILITY_MASK: u32 = 0x0000_0007;
    pub const NOT_PUBLIC: u32 = 0x0000_0000;
    pub const PUBLIC: u32 = 0x0000_0001;
    pub const NESTED_PUBLIC: u32 = 0x0000_0002;
    pub const NESTED_PRIVATE: u32 = 0x0000_0003;
    pub const LAYOUT_MASK: u32 = 0x0000_0018;
    pub const SEQUENTIAL_LAYOUT: u32 = 0x0000_0008;
    pub const INTERFACE: u32 = 0x0000_0020;
    pub const ABSTRACT: u32 = 0x0000_0080;
    pub const SEALED: u32 = 0x0000_0100;
    pub const SPECIAL_NAME: u32 = 0x0000_0400;
    pub const SERIALIZABLE: u32 = 0x0000_2000;
    pub const BEFORE_FIELD_INIT: u32 = 0x0010_0000;
}

/// Field attribute flags (ECMA-335 II.23.1.5)
pub mod field_attributes {
    pub const ACCESS_MASK: u32 = 0x0007;
    pub const PRIVATE: u32 = 0x0001;
    pub const PUBLIC: u32 = 0x0006;
    pub const STATIC: u32 = 0x0010;
    pub const INIT_ONLY: u32 = 0x0020;
    pub const LITERAL: u32 = 0x0040;
}

/// Method attribute flags (ECMA-335 II.23.1.10)
pub mod method_attributes {
    pub const ACCESS_MASK: u32 = 0x0007;
    pub const PRIVATE: u32 = 0x0001;
    pub const PUBLIC: u32 = 0x0006;
    pub const STATIC: u32 = 0x0010;
    pub const FINAL: u32 = 0x0020;
    pub const VIRTUAL: u32 = 0x0040;
    pub const HIDE_BY_SIG: u32 = 0x0080;
    pub const ABSTRACT: u32 = 0x0400;
    pub const SPECIAL_NAME: u32 = 0x0800;
    pub const RT_SPECIAL_NAME: u32 = 0x1000;
}

/// Manifest resource attribute flags
pub mod resource_attributes {
    pub const PUBLIC: u32 = 0x0001;
    pub const PRIVATE: u32 = 0x0002;
}

/// Opaque id of a field definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// Opaque id of a method definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// Opaque id of a property definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub u32);

/// Method referenced by name through its declaring type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberReference {
    pub parent: TypeSignature,
    pub name: String,
    pub signature: MethodSignature,
}

/// Method operand: a local definition or an external member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodRef {
    Def(MethodId),
    Member(MemberReference),
}

impl MethodRef {
    /// Reference a method through its declaring type
    pub fn member(parent: TypeSignature, name: &str, signature: MethodSignature) -> Self {
        Self::Member(MemberReference {
            parent,
            name: name.to_string(),
            signature,
        })
    }

    pub(crate) fn encode(&self, writer: &mut ImageWriter) {
        match self {
            Self::Def(id) => {
                writer.emit_u8(0);
                writer.emit_u32(id.0);
            }
            Self::Member(m) => {
                writer.emit_u8(1);
                m.parent.encode(writer);
                writer.emit_string(&m.name);
                m.signature.encode(writer);
            }
        }
    }

    pub(crate) fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        match reader.read_tag("method reference", 2)? {
            0 => Ok(Self::Def(MethodId(reader.read_u32()?))),
            _ => Ok(Self::Member(MemberReference {
                parent: TypeSignature::decode(reader)?,
                name: reader.read_string()?,
                signature: MethodSignature::decode(reader)?,
            })),
        }
    }
}

/// Field operand: a local definition or an external member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRef {
    Def(FieldId),
    Member {
        parent: TypeSignature,
        name: String,
        field_type: TypeSignature,
    },
}

impl FieldRef {
    pub(crate) fn encode(&self, writer: &mut ImageWriter) {
        match self {
            Self::Def(id) => {
                writer.emit_u8(0);
                writer.emit_u32(id.0);
            }
            Self::Member {
                parent,
                name,
                field_type,
            } => {
                writer.emit_u8(1);
                parent.encode(writer);
                writer.emit_string(name);
                field_type.encode(writer);
            }
        }
    }

    pub(crate) fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        match reader.read_tag("field reference", 2)? {
            0 => Ok(Self::Def(FieldId(reader.read_u32()?))),
            _ => Ok(Self::Member {
                parent: TypeSignature::decode(reader)?,
                name: reader.read_string()?,
                field_type: TypeSignature::decode(reader)?,
            }),
        }
    }
}

/// Fixed argument value of a custom attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Boolean(bool),
    /// 32-bit integer; also the underlying value of enum arguments
    I4(i32),
    String(Option<String>),
    Type(TypeSignature),
}

/// Typed fixed argument of a custom attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeArgument {
    pub ty: TypeSignature,
    pub value: AttributeValue,
}

/// Custom attribute instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAttribute {
    pub constructor: MethodRef,
    pub args: Vec<AttributeArgument>,
}

impl CustomAttribute {
    /// Declaring type of the attribute constructor, when referenced by member
    pub fn attribute_type(&self) -> Option<&TypeSignature> {
        match &self.constructor {
            MethodRef::Member(m) => Some(&m.parent),
            MethodRef::Def(_) => None,
        }
    }

    fn encode(&self, writer: &mut ImageWriter) {
        self.constructor.encode(writer);
        writer.emit_u32(self.args.len() as u32);
        for arg in &self.args {
            arg.ty.encode(writer);
            match &arg.value {
                AttributeValue::Boolean(b) => {
                    writer.emit_u8(0);
                    writer.emit_bool(*b);
                }
                AttributeValue::I4(v) => {
                    writer.emit_u8(1);
                    writer.emit_i32(*v);
                }
                AttributeValue::String(s) => {
                    writer.emit_u8(2);
                    writer.emit_opt_string(s.as_deref());
                }
                AttributeValue::Type(t) => {
                    writer.emit_u8(3);
                    t.encode(writer);
                }
            }
        }
    }

    fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let constructor = MethodRef::decode(reader)?;
        let count = reader.read_count()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let ty = TypeSignature::decode(reader)?;
            let value = match reader.read_tag("attribute value", 4)? {
                0 => AttributeValue::Boolean(reader.read_bool()?),
                1 => AttributeValue::I4(reader.read_i32()?),
                2 => AttributeValue::String(reader.read_opt_string()?),
                _ => AttributeValue::Type(TypeSignature::decode(reader)?),
            };
            args.push(AttributeArgument { ty, value });
        }
        Ok(Self { constructor, args })
    }
}

fn encode_attributes(attrs: &[CustomAttribute], writer: &mut ImageWriter) {
    writer.emit_u32(attrs.len() as u32);
    for attr in attrs {
        attr.encode(writer);
    }
}

fn decode_attributes(reader: &mut ImageReader<'_>) -> Result<Vec<CustomAttribute>, DecodeError> {
    let count = reader.read_count()?;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        attrs.push(CustomAttribute::decode(reader)?);
    }
    Ok(attrs)
}

fn encode_ids(ids: impl ExactSizeIterator<Item = u32>, writer: &mut ImageWriter) {
    writer.emit_u32(ids.len() as u32);
    for id in ids {
        writer.emit_u32(id);
    }
}

fn decode_ids<T>(reader: &mut ImageReader<'_>, wrap: fn(u32) -> T) -> Result<Vec<T>, DecodeError> {
    let count = reader.read_count()?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(wrap(reader.read_u32()?));
    }
    Ok(ids)
}

/// Type definition
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub attributes: u32,
    pub base_type: Option<TypeSignature>,
    pub fields: Vec<FieldId>,
    pub methods: Vec<MethodId>,
    pub properties: Vec<PropertyId>,
    pub nested_types: Vec<TypeDefId>,
    pub enclosing_type: Option<TypeDefId>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl TypeDef {
    /// Create an empty type definition
    pub fn new(namespace: &str, name: &str, attributes: u32, base_type: Option<TypeSignature>) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            attributes,
            base_type,
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            nested_types: Vec::new(),
            enclosing_type: None,
            custom_attributes: Vec::new(),
        }
    }

    /// Declared with value semantics (derives from `System.ValueType` or `System.Enum`)
    pub fn is_value_type(&self) -> bool {
        self.base_type.as_ref().is_some_and(|base| {
            base.is_corlib_type("System", "ValueType") || base.is_corlib_type("System", "Enum")
        })
    }

    /// Abstract and sealed, the encoding of a static class
    pub fn is_static(&self) -> bool {
        let both = type_attributes::ABSTRACT | type_attributes::SEALED;
        self.attributes & both == both
    }

    pub fn is_interface(&self) -> bool {
        self.attributes & type_attributes::INTERFACE != 0
    }

    fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_string(&self.namespace);
        writer.emit_string(&self.name);
        writer.emit_u32(self.attributes);
        match &self.base_type {
            Some(base) => {
                writer.emit_u8(1);
                base.encode(writer);
            }
            None => writer.emit_u8(0),
        }
        encode_ids(self.fields.iter().map(|id| id.0), writer);
        encode_ids(self.methods.iter().map(|id| id.0), writer);
        encode_ids(self.properties.iter().map(|id| id.0), writer);
        encode_ids(self.nested_types.iter().map(|id| id.0), writer);
        match self.enclosing_type {
            Some(id) => {
                writer.emit_u8(1);
                writer.emit_u32(id.0);
            }
            None => writer.emit_u8(0),
        }
        encode_attributes(&self.custom_attributes, writer);
    }

    fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let namespace = reader.read_string()?;
        let name = reader.read_string()?;
        let attributes = reader.read_u32()?;
        let base_type = if reader.read_bool()? {
            Some(TypeSignature::decode(reader)?)
        } else {
            None
        };
        let fields = decode_ids(reader, FieldId)?;
        let methods = decode_ids(reader, MethodId)?;
        let properties = decode_ids(reader, PropertyId)?;
        let nested_types = decode_ids(reader, TypeDefId)?;
        let enclosing_type = if reader.read_bool()? {
            Some(TypeDefId(reader.read_u32()?))
        } else {
            None
        };
        let custom_attributes = decode_attributes(reader)?;
        Ok(Self {
            namespace,
            name,
            attributes,
            base_type,
            fields,
            methods,
            properties,
            nested_types,
            enclosing_type,
            custom_attributes,
        })
    }
}

/// Field definition
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub declaring_type: TypeDefId,
    pub name: String,
    pub attributes: u32,
    pub field_type: TypeSignature,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl FieldDef {
    pub fn new(name: &str, attributes: u32, field_type: TypeSignature) -> Self {
        Self {
            declaring_type: TypeDefId(0),
            name: name.to_string(),
            attributes,
            field_type,
            custom_attributes: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.attributes & field_attributes::STATIC != 0
    }

    pub fn is_public(&self) -> bool {
        self.attributes & field_attributes::ACCESS_MASK == field_attributes::PUBLIC
    }

    pub fn is_literal(&self) -> bool {
        self.attributes & field_attributes::LITERAL != 0
    }

    fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u32(self.declaring_type.0);
        writer.emit_string(&self.name);
        writer.emit_u32(self.attributes);
        self.field_type.encode(writer);
        encode_attributes(&self.custom_attributes, writer);
    }

    fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            declaring_type: TypeDefId(reader.read_u32()?),
            name: reader.read_string()?,
            attributes: reader.read_u32()?,
            field_type: TypeSignature::decode(reader)?,
            custom_attributes: decode_attributes(reader)?,
        })
    }
}

/// Method definition
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub declaring_type: TypeDefId,
    pub name: String,
    pub attributes: u32,
    pub signature: MethodSignature,
    pub body: Option<MethodBody>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl MethodDef {
    pub fn new(name: &str, attributes: u32, signature: MethodSignature) -> Self {
        Self {
            declaring_type: TypeDefId(0),
            name: name.to_string(),
            attributes,
            signature,
            body: None,
            custom_attributes: Vec::new(),
        }
    }

    /// Attach a body
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_static(&self) -> bool {
        self.attributes & method_attributes::STATIC != 0
    }

    pub fn is_public(&self) -> bool {
        self.attributes & method_attributes::ACCESS_MASK == method_attributes::PUBLIC
    }

    /// Instance constructor (`.ctor`)
    pub fn is_instance_constructor(&self) -> bool {
        !self.is_static() && self.name == ".ctor"
    }

    fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u32(self.declaring_type.0);
        writer.emit_string(&self.name);
        writer.emit_u32(self.attributes);
        self.signature.encode(writer);
        match &self.body {
            Some(body) => {
                writer.emit_u8(1);
                body.encode(writer);
            }
            None => writer.emit_u8(0),
        }
        encode_attributes(&self.custom_attributes, writer);
    }

    fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let declaring_type = TypeDefId(reader.read_u32()?);
        let name = reader.read_string()?;
        let attributes = reader.read_u32()?;
        let signature = MethodSignature::decode(reader)?;
        let body = if reader.read_bool()? {
            Some(MethodBody::decode(reader)?)
        } else {
            None
        };
        Ok(Self {
            declaring_type,
            name,
            attributes,
            signature,
            body,
            custom_attributes: decode_attributes(reader)?,
        })
    }
}

/// Property definition
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub declaring_type: TypeDefId,
    pub name: String,
    pub property_type: TypeSignature,
    pub getter: Option<MethodId>,
    pub setter: Option<MethodId>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl PropertyDef {
    pub fn new(name: &str, property_type: TypeSignature) -> Self {
        Self {
            declaring_type: TypeDefId(0),
            name: name.to_string(),
            property_type,
            getter: None,
            setter: None,
            custom_attributes: Vec::new(),
        }
    }

    fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u32(self.declaring_type.0);
        writer.emit_string(&self.name);
        self.property_type.encode(writer);
        for accessor in [self.getter, self.setter] {
            match accessor {
                Some(id) => {
                    writer.emit_u8(1);
                    writer.emit_u32(id.0);
                }
                None => writer.emit_u8(0),
            }
        }
        encode_attributes(&self.custom_attributes, writer);
    }

    fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let declaring_type = TypeDefId(reader.read_u32()?);
        let name = reader.read_string()?;
        let property_type = TypeSignature::decode(reader)?;
        let mut accessors = [None, None];
        for slot in &mut accessors {
            if reader.read_bool()? {
                *slot = Some(MethodId(reader.read_u32()?));
            }
        }
        let [getter, setter] = accessors;
        Ok(Self {
            declaring_type,
            name,
            property_type,
            getter,
            setter,
            custom_attributes: decode_attributes(reader)?,
        })
    }
}

/// Named blob embedded in the module manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestResource {
    pub name: String,
    pub attributes: u32,
    pub data: Vec<u8>,
}

/// Anything that can carry custom attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasCustomAttribute {
    Type(TypeDefId),
    Field(FieldId),
    Method(MethodId),
    Property(PropertyId),
}

/// A managed module
#[derive(Debug, Clone)]
pub struct Module {
    /// Module (and assembly) name
    pub name: String,
    /// Name of the core library this module references
    pub corlib_name: String,
    types: Vec<TypeDef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    properties: Vec<PropertyDef>,
    top_level: Vec<TypeDefId>,
    pub resources: Vec<ManifestResource>,
}

impl Module {
    /// Create a new empty module
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            corlib_name: "mscorlib".to_string(),
            types: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            top_level: Vec::new(),
            resources: Vec::new(),
        }
    }

    // ===== Arenas =====

    /// Register a type. Types with an enclosing type become nested types of
    /// it; all others are appended to the top-level list.
    pub fn add_type(&mut self, def: TypeDef) -> TypeDefId {
        let id = TypeDefId(self.types.len() as u32);
        let enclosing = def.enclosing_type;
        self.types.push(def);
        match enclosing {
            Some(outer) => self.types[outer.index()].nested_types.push(id),
            None => self.top_level.push(id),
        }
        id
    }

    /// Add a field to a type
    pub fn add_field(&mut self, owner: TypeDefId, mut def: FieldDef) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        def.declaring_type = owner;
        self.fields.push(def);
        self.types[owner.index()].fields.push(id);
        id
    }

    /// Add a method to a type
    pub fn add_method(&mut self, owner: TypeDefId, mut def: MethodDef) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        def.declaring_type = owner;
        self.methods.push(def);
        self.types[owner.index()].methods.push(id);
        id
    }

    /// Add a property to a type
    pub fn add_property(&mut self, owner: TypeDefId, mut def: PropertyDef) -> PropertyId {
        let id = PropertyId(self.properties.len() as u32);
        def.declaring_type = owner;
        self.properties.push(def);
        self.types[owner.index()].properties.push(id);
        id
    }

    pub fn type_def(&self, id: TypeDefId) -> &TypeDef {
        &self.types[id.index()]
    }

    pub fn type_def_mut(&mut self, id: TypeDefId) -> &mut TypeDef {
        &mut self.types[id.index()]
    }

    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut FieldDef {
        &mut self.fields[id.0 as usize]
    }

    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut MethodDef {
        &mut self.methods[id.0 as usize]
    }

    pub fn property(&self, id: PropertyId) -> &PropertyDef {
        &self.properties[id.0 as usize]
    }

    pub fn property_mut(&mut self, id: PropertyId) -> &mut PropertyDef {
        &mut self.properties[id.0 as usize]
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Snapshot of every declared type id, nested types included
    pub fn all_type_ids(&self) -> Vec<TypeDefId> {
        (0..self.types.len() as u32).map(TypeDefId).collect()
    }

    /// Top-level types in declaration order
    pub fn top_level_types(&self) -> &[TypeDefId] {
        &self.top_level
    }

    /// Check if a type id belongs to this module
    pub fn contains_type(&self, id: TypeDefId) -> bool {
        id.index() < self.types.len()
    }

    /// Custom attribute list of a definition
    pub fn custom_attributes_mut(&mut self, owner: HasCustomAttribute) -> &mut Vec<CustomAttribute> {
        match owner {
            HasCustomAttribute::Type(id) => &mut self.type_def_mut(id).custom_attributes,
            HasCustomAttribute::Field(id) => &mut self.field_mut(id).custom_attributes,
            HasCustomAttribute::Method(id) => &mut self.method_mut(id).custom_attributes,
            HasCustomAttribute::Property(id) => &mut self.property_mut(id).custom_attributes,
        }
    }

    // ===== Names and lookup =====

    /// Name of a type including enclosing types (`Outer/Inner`), without namespace
    pub fn type_name(&self, id: TypeDefId) -> String {
        let def = self.type_def(id);
        match def.enclosing_type {
            Some(outer) => format!("{}/{}", self.type_name(outer), def.name),
            None => def.name.clone(),
        }
    }

    /// Namespace of a type; nested types report the namespace of their outermost type
    pub fn type_namespace(&self, id: TypeDefId) -> &str {
        let def = self.type_def(id);
        match def.enclosing_type {
            Some(outer) => self.type_namespace(outer),
            None => &def.namespace,
        }
    }

    /// Namespace-qualified type name
    pub fn type_full_name(&self, id: TypeDefId) -> String {
        let ns = self.type_namespace(id);
        if ns.is_empty() {
            self.type_name(id)
        } else {
            format!("{}.{}", ns, self.type_name(id))
        }
    }

    /// Find a declared type by namespace and (possibly nested) name
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<TypeDefId> {
        self.all_type_ids()
            .into_iter()
            .find(|&id| self.type_namespace(id) == namespace && self.type_name(id) == name)
    }

    /// Find a method of a type by name and signature
    pub fn find_method(
        &self,
        owner: TypeDefId,
        name: &str,
        signature: &MethodSignature,
    ) -> Option<MethodId> {
        self.type_def(owner)
            .methods
            .iter()
            .copied()
            .find(|&m| self.method(m).name == name && &self.method(m).signature == signature)
    }

    /// Find a method of a type by name only
    pub fn find_method_by_name(&self, owner: TypeDefId, name: &str) -> Option<MethodId> {
        self.type_def(owner)
            .methods
            .iter()
            .copied()
            .find(|&m| self.method(m).name == name)
    }

    /// Find a field of a type by name
    pub fn find_field(&self, owner: TypeDefId, name: &str) -> Option<FieldId> {
        self.type_def(owner)
            .fields
            .iter()
            .copied()
            .find(|&f| self.field(f).name == name)
    }

    /// Get or create the global `<Module>` type
    pub fn module_type_id(&mut self) -> TypeDefId {
        if let Some(id) = self.find_type("", MODULE_TYPE_NAME) {
            return id;
        }
        self.add_type(TypeDef::new("", MODULE_TYPE_NAME, type_attributes::NOT_PUBLIC, None))
    }

    /// Signature referring to a type declared in this module
    pub fn signature_of(&self, id: TypeDefId) -> TypeSignature {
        if self.type_def(id).is_value_type() {
            TypeSignature::ValueType(TypeDefOrRef::Def(id))
        } else {
            TypeSignature::Class(TypeDefOrRef::Def(id))
        }
    }

    /// Resolve a type reference to its declaration in this module
    pub fn resolve(&self, tdr: &TypeDefOrRef) -> Option<TypeDefId> {
        match tdr {
            TypeDefOrRef::Def(id) => self.contains_type(*id).then_some(*id),
            TypeDefOrRef::Ref(r) => {
                let local = match &r.scope {
                    ResolutionScope::Module => true,
                    ResolutionScope::Assembly(name) => name == &self.name,
                    ResolutionScope::CorLib => self.name == self.corlib_name,
                };
                if !local {
                    return None;
                }
                self.find_type(r.namespace.as_deref().unwrap_or(""), &r.name)
            }
        }
    }

    /// Resolve the named type behind a signature
    pub fn resolve_signature(&self, sig: &TypeSignature) -> Option<TypeDefId> {
        sig.type_def_or_ref().and_then(|tdr| self.resolve(tdr))
    }

    /// Namespace and name of the type a signature denotes, if it has one.
    ///
    /// Generic instantiations carry their arguments, e.g. ``List`1<System.Int32>``.
    pub fn signature_name(&self, sig: &TypeSignature) -> Option<(String, String)> {
        if let Some((ns, name)) = sig.primitive_name() {
            return Some((ns.to_string(), name.to_string()));
        }
        if let TypeSignature::GenericInst { generic, args } = sig.strip_modifiers() {
            let (ns, name) = self.signature_name(generic)?;
            let args: Vec<String> = args.iter().map(|arg| self.signature_full_name(arg)).collect();
            return Some((ns, format!("{}<{}>", name, args.join(","))));
        }
        match sig.type_def_or_ref()? {
            TypeDefOrRef::Def(id) if self.contains_type(*id) => {
                Some((self.type_namespace(*id).to_string(), self.type_name(*id)))
            }
            TypeDefOrRef::Def(_) => None,
            TypeDefOrRef::Ref(r) => Some((r.namespace.clone().unwrap_or_default(), r.name.clone())),
        }
    }

    /// Namespace-qualified name of a signature, falling back to its display form
    pub fn signature_full_name(&self, sig: &TypeSignature) -> String {
        match self.signature_name(sig) {
            Some((ns, name)) if ns.is_empty() => name,
            Some((ns, name)) => format!("{}.{}", ns, name),
            None => sig.to_string(),
        }
    }

    /// Reference to a type of this module as seen from another module
    pub fn external_reference(&self, id: TypeDefId) -> TypeReference {
        TypeReference {
            scope: ResolutionScope::Assembly(self.name.clone()),
            namespace: Some(self.type_namespace(id).to_string()),
            name: self.type_name(id),
        }
    }

    // ===== Resources =====

    /// Add a manifest resource
    pub fn add_resource(&mut self, name: &str, attributes: u32, data: Vec<u8>) {
        self.resources.push(ManifestResource {
            name: name.to_string(),
            attributes,
            data,
        });
    }

    /// Find a manifest resource by name
    pub fn find_resource(&self, name: &str) -> Option<&ManifestResource> {
        self.resources.iter().find(|r| r.name == name)
    }

    // ===== Encoding =====

    /// Encode module to binary format
    ///
    /// Format:
    /// - Header: magic (4 bytes) + version (u32) + reserved (u32) + checksum (u32)
    /// - Names
    /// - Type, field, method and property tables
    /// - Top-level type list
    /// - Manifest resources
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ImageWriter::new();

        let header_start = writer.offset();
        writer.buffer.extend_from_slice(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(0);
        let checksum_offset = writer.offset();
        writer.emit_u32(0); // Placeholder for checksum

        writer.emit_string(&self.name);
        writer.emit_string(&self.corlib_name);

        writer.emit_u32(self.types.len() as u32);
        for def in &self.types {
            def.encode(&mut writer);
        }
        writer.emit_u32(self.fields.len() as u32);
        for def in &self.fields {
            def.encode(&mut writer);
        }
        writer.emit_u32(self.methods.len() as u32);
        for def in &self.methods {
            def.encode(&mut writer);
        }
        writer.emit_u32(self.properties.len() as u32);
        for def in &self.properties {
            def.encode(&mut writer);
        }
        encode_ids(self.top_level.iter().map(|id| id.0), &mut writer);

        writer.emit_u32(self.resources.len() as u32);
        for resource in &self.resources {
            writer.emit_string(&resource.name);
            writer.emit_u32(resource.attributes);
            writer.emit_blob(&resource.data);
        }

        // CRC32 of everything after the header
        let payload = &writer.buffer[header_start + 16..];
        let checksum = crc32fast::hash(payload);
        writer.patch_u32(checksum_offset, checksum);

        writer.into_bytes()
    }

    /// Decode a module from binary format
    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut reader = ImageReader::new(data);

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&reader.read_bytes(4)?);
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }

        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }

        let _reserved = reader.read_u32()?;
        let stored_checksum = reader.read_u32()?;

        let payload = &data[16..];
        let calculated_checksum = crc32fast::hash(payload);
        if stored_checksum != calculated_checksum {
            return Err(ModuleError::ChecksumMismatch {
                expected: stored_checksum,
                actual: calculated_checksum,
            });
        }

        let name = reader.read_string()?;
        let corlib_name = reader.read_string()?;

        let count = reader.read_count()?;
        let mut types = Vec::with_capacity(count);
        for _ in 0..count {
            types.push(TypeDef::decode(&mut reader)?);
        }
        let count = reader.read_count()?;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldDef::decode(&mut reader)?);
        }
        let count = reader.read_count()?;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodDef::decode(&mut reader)?);
        }
        let count = reader.read_count()?;
        let mut properties = Vec::with_capacity(count);
        for _ in 0..count {
            properties.push(PropertyDef::decode(&mut reader)?);
        }
        let top_level = decode_ids(&mut reader, TypeDefId)?;

        let count = reader.read_count()?;
        let mut resources = Vec::with_capacity(count);
        for _ in 0..count {
            resources.push(ManifestResource {
                name: reader.read_string()?,
                attributes: reader.read_u32()?,
                data: reader.read_blob()?,
            });
        }

        let module = Self {
            name,
            corlib_name,
            types,
            fields,
            methods,
            properties,
            top_level,
            resources,
        };
        verify_tables(&module)?;
        Ok(module)
    }
}
