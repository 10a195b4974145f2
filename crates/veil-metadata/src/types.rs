//! Type signatures
//!
//! A [`TypeSignature`] is the identity of a type as it is referenced from a
//! method body, a field or a local variable table. Signatures are immutable
//! values compared structurally; two signatures naming the same type through
//! the same reference are equal.

use crate::encoder::{DecodeError, ImageReader, ImageWriter};
use std::fmt;

/// ECMA-335 element type codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
    String = 0x0e,
    Ptr = 0x0f,
    ByRef = 0x10,
    ValueType = 0x11,
    Class = 0x12,
    Var = 0x13,
    Array = 0x14,
    GenericInst = 0x15,
    TypedByRef = 0x16,
    I = 0x18,
    U = 0x19,
    FnPtr = 0x1b,
    Object = 0x1c,
    SzArray = 0x1d,
    MVar = 0x1e,
    CModReqD = 0x1f,
    CModOpt = 0x20,
    Pinned = 0x45,
}

impl ElementType {
    const ALL: &'static [ElementType] = &[
        Self::Void,
        Self::Boolean,
        Self::Char,
        Self::I1,
        Self::U1,
        Self::I2,
        Self::U2,
        Self::I4,
        Self::U4,
        Self::I8,
        Self::U8,
        Self::R4,
        Self::R8,
        Self::String,
        Self::Ptr,
        Self::ByRef,
        Self::ValueType,
        Self::Class,
        Self::Var,
        Self::Array,
        Self::GenericInst,
        Self::TypedByRef,
        Self::I,
        Self::U,
        Self::FnPtr,
        Self::Object,
        Self::SzArray,
        Self::MVar,
        Self::CModReqD,
        Self::CModOpt,
        Self::Pinned,
    ];

    /// Convert a raw code to an element type
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| *e as u8 == value)
    }

    /// Check if the element type is a primitive with a fixed core library name
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            Self::Void
                | Self::Boolean
                | Self::Char
                | Self::I1
                | Self::U1
                | Self::I2
                | Self::U2
                | Self::I4
                | Self::U4
                | Self::I8
                | Self::U8
                | Self::R4
                | Self::R8
                | Self::String
                | Self::Object
                | Self::I
                | Self::U
                | Self::TypedByRef
        )
    }
}

/// Opaque id of a type declared in a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeDefId(pub u32);

impl TypeDefId {
    /// Position in the owning module's type arena
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a referenced type is declared
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolutionScope {
    /// The core library
    CorLib,
    /// Another assembly, by name
    Assembly(String),
    /// The referencing module itself
    Module,
}

/// Reference to a type by name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeReference {
    pub scope: ResolutionScope,
    pub namespace: Option<String>,
    /// Simple name; nested types use `Outer/Inner`
    pub name: String,
}

impl TypeReference {
    /// Reference to a core library type
    pub fn corlib(namespace: &str, name: &str) -> Self {
        Self {
            scope: ResolutionScope::CorLib,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Namespace-qualified name
    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, self.name),
            _ => self.name.clone(),
        }
    }
}

/// A type either declared in the current module or referenced by name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDefOrRef {
    Def(TypeDefId),
    Ref(TypeReference),
}

/// Signature of a method: calling convention, return type and parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub has_this: bool,
    pub return_type: TypeSignature,
    pub params: Vec<TypeSignature>,
}

impl MethodSignature {
    /// Static method signature
    pub fn new_static(return_type: TypeSignature, params: Vec<TypeSignature>) -> Self {
        Self {
            has_this: false,
            return_type,
            params,
        }
    }

    /// Instance method signature
    pub fn new_instance(return_type: TypeSignature, params: Vec<TypeSignature>) -> Self {
        Self {
            has_this: true,
            return_type,
            params,
        }
    }

    /// Number of argument slots, including `this`
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    pub(crate) fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_bool(self.has_this);
        self.return_type.encode(writer);
        writer.emit_u32(self.params.len() as u32);
        for param in &self.params {
            param.encode(writer);
        }
    }

    pub(crate) fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let has_this = reader.read_bool()?;
        let return_type = TypeSignature::decode(reader)?;
        let count = reader.read_count()?;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            params.push(TypeSignature::decode(reader)?);
        }
        Ok(Self {
            has_this,
            return_type,
            params,
        })
    }
}

/// Type signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSignature {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    Object,
    I,
    U,
    TypedByRef,
    /// Value type declared or referenced by name
    ValueType(TypeDefOrRef),
    /// Reference type declared or referenced by name
    Class(TypeDefOrRef),
    /// Single-dimensional zero-based array
    SzArray(Box<TypeSignature>),
    /// Multi-dimensional array
    Array { element: Box<TypeSignature>, rank: u32 },
    /// Unmanaged pointer
    Ptr(Box<TypeSignature>),
    /// Managed reference
    ByRef(Box<TypeSignature>),
    /// Pinned local
    Pinned(Box<TypeSignature>),
    /// Required custom modifier
    ModReq {
        modifier: TypeDefOrRef,
        base: Box<TypeSignature>,
    },
    /// Optional custom modifier
    ModOpt {
        modifier: TypeDefOrRef,
        base: Box<TypeSignature>,
    },
    /// Generic instantiation
    GenericInst {
        generic: Box<TypeSignature>,
        args: Vec<TypeSignature>,
    },
    /// Generic type parameter
    Var(u32),
    /// Generic method parameter
    MVar(u32),
    /// Function pointer
    FnPtr(Box<MethodSignature>),
}

impl TypeSignature {
    /// Reference type from the core library
    pub fn corlib_class(namespace: &str, name: &str) -> Self {
        Self::Class(TypeDefOrRef::Ref(TypeReference::corlib(namespace, name)))
    }

    /// Value type from the core library
    pub fn corlib_value_type(namespace: &str, name: &str) -> Self {
        Self::ValueType(TypeDefOrRef::Ref(TypeReference::corlib(namespace, name)))
    }

    /// ECMA-335 element type of the outermost constructor
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Void => ElementType::Void,
            Self::Boolean => ElementType::Boolean,
            Self::Char => ElementType::Char,
            Self::I1 => ElementType::I1,
            Self::U1 => ElementType::U1,
            Self::I2 => ElementType::I2,
            Self::U2 => ElementType::U2,
            Self::I4 => ElementType::I4,
            Self::U4 => ElementType::U4,
            Self::I8 => ElementType::I8,
            Self::U8 => ElementType::U8,
            Self::R4 => ElementType::R4,
            Self::R8 => ElementType::R8,
            Self::String => ElementType::String,
            Self::Object => ElementType::Object,
            Self::I => ElementType::I,
            Self::U => ElementType::U,
            Self::TypedByRef => ElementType::TypedByRef,
            Self::ValueType(_) => ElementType::ValueType,
            Self::Class(_) => ElementType::Class,
            Self::SzArray(_) => ElementType::SzArray,
            Self::Array { .. } => ElementType::Array,
            Self::Ptr(_) => ElementType::Ptr,
            Self::ByRef(_) => ElementType::ByRef,
            Self::Pinned(_) => ElementType::Pinned,
            Self::ModReq { .. } => ElementType::CModReqD,
            Self::ModOpt { .. } => ElementType::CModOpt,
            Self::GenericInst { .. } => ElementType::GenericInst,
            Self::Var(_) => ElementType::Var,
            Self::MVar(_) => ElementType::MVar,
            Self::FnPtr(_) => ElementType::FnPtr,
        }
    }

    /// Check if values of this type have value semantics
    pub fn is_value_type(&self) -> bool {
        match self {
            Self::Boolean
            | Self::Char
            | Self::I1
            | Self::U1
            | Self::I2
            | Self::U2
            | Self::I4
            | Self::U4
            | Self::I8
            | Self::U8
            | Self::R4
            | Self::R8
            | Self::I
            | Self::U
            | Self::TypedByRef
            | Self::ValueType(_) => true,
            Self::GenericInst { generic, .. } => generic.is_value_type(),
            Self::ModReq { base, .. } | Self::ModOpt { base, .. } | Self::Pinned(base) => {
                base.is_value_type()
            }
            _ => false,
        }
    }

    /// Check if this is one of the built-in primitive element types
    pub fn is_primitive(&self) -> bool {
        self.element_type().is_primitive()
    }

    /// Remove custom modifiers and pinned wrappers
    pub fn strip_modifiers(&self) -> &TypeSignature {
        let mut current = self;
        loop {
            match current {
                Self::ModReq { base, .. } | Self::ModOpt { base, .. } | Self::Pinned(base) => {
                    current = base
                }
                _ => return current,
            }
        }
    }

    /// The named type behind a value type, class or generic instantiation
    pub fn type_def_or_ref(&self) -> Option<&TypeDefOrRef> {
        match self.strip_modifiers() {
            Self::ValueType(tdr) | Self::Class(tdr) => Some(tdr),
            Self::GenericInst { generic, .. } => generic.type_def_or_ref(),
            _ => None,
        }
    }

    /// Core library namespace and name of a primitive
    pub fn primitive_name(&self) -> Option<(&'static str, &'static str)> {
        let name = match self {
            Self::Void => "Void",
            Self::Boolean => "Boolean",
            Self::Char => "Char",
            Self::I1 => "SByte",
            Self::U1 => "Byte",
            Self::I2 => "Int16",
            Self::U2 => "UInt16",
            Self::I4 => "Int32",
            Self::U4 => "UInt32",
            Self::I8 => "Int64",
            Self::U8 => "UInt64",
            Self::R4 => "Single",
            Self::R8 => "Double",
            Self::String => "String",
            Self::Object => "Object",
            Self::I => "IntPtr",
            Self::U => "UIntPtr",
            Self::TypedByRef => "TypedReference",
            _ => return None,
        };
        Some(("System", name))
    }

    /// Check if this signature names the given core library type
    pub fn is_corlib_type(&self, namespace: &str, name: &str) -> bool {
        if let Some((ns, n)) = self.primitive_name() {
            return ns == namespace && n == name;
        }
        match self.type_def_or_ref() {
            Some(TypeDefOrRef::Ref(r)) => {
                r.scope == ResolutionScope::CorLib
                    && r.namespace.as_deref().unwrap_or("") == namespace
                    && r.name == name
            }
            _ => false,
        }
    }

    /// Encode the signature
    pub fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u8(self.element_type() as u8);
        match self {
            Self::ValueType(tdr) | Self::Class(tdr) => tdr.encode(writer),
            Self::SzArray(inner) | Self::Ptr(inner) | Self::ByRef(inner) | Self::Pinned(inner) => {
                inner.encode(writer)
            }
            Self::Array { element, rank } => {
                element.encode(writer);
                writer.emit_u32(*rank);
            }
            Self::ModReq { modifier, base } | Self::ModOpt { modifier, base } => {
                modifier.encode(writer);
                base.encode(writer);
            }
            Self::GenericInst { generic, args } => {
                generic.encode(writer);
                writer.emit_u32(args.len() as u32);
                for arg in args {
                    arg.encode(writer);
                }
            }
            Self::Var(n) | Self::MVar(n) => writer.emit_u32(*n),
            Self::FnPtr(sig) => sig.encode(writer),
            _ => {}
        }
    }

    /// Decode a signature
    pub fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let code = reader.read_u8()?;
        let element =
            ElementType::from_u8(code).ok_or(DecodeError::InvalidElementType(code, offset))?;
        let boxed = |reader: &mut ImageReader<'_>| TypeSignature::decode(reader).map(Box::new);

        Ok(match element {
            ElementType::Void => Self::Void,
            ElementType::Boolean => Self::Boolean,
            ElementType::Char => Self::Char,
            ElementType::I1 => Self::I1,
            ElementType::U1 => Self::U1,
            ElementType::I2 => Self::I2,
            ElementType::U2 => Self::U2,
            ElementType::I4 => Self::I4,
            ElementType::U4 => Self::U4,
            ElementType::I8 => Self::I8,
            ElementType::U8 => Self::U8,
            ElementType::R4 => Self::R4,
            ElementType::R8 => Self::R8,
            ElementType::String => Self::String,
            ElementType::Object => Self::Object,
            ElementType::I => Self::I,
            ElementType::U => Self::U,
            ElementType::TypedByRef => Self::TypedByRef,
            ElementType::ValueType => Self::ValueType(TypeDefOrRef::decode(reader)?),
            ElementType::Class => Self::Class(TypeDefOrRef::decode(reader)?),
            ElementType::SzArray => Self::SzArray(boxed(reader)?),
            ElementType::Ptr => Self::Ptr(boxed(reader)?),
            ElementType::ByRef => Self::ByRef(boxed(reader)?),
            ElementType::Pinned => Self::Pinned(boxed(reader)?),
            ElementType::Array => {
                let element = boxed(reader)?;
                let rank = reader.read_u32()?;
                Self::Array { element, rank }
            }
            ElementType::CModReqD => {
                let modifier = TypeDefOrRef::decode(reader)?;
                Self::ModReq {
                    modifier,
                    base: boxed(reader)?,
                }
            }
            ElementType::CModOpt => {
                let modifier = TypeDefOrRef::decode(reader)?;
                Self::ModOpt {
                    modifier,
                    base: boxed(reader)?,
                }
            }
            ElementType::GenericInst => {
                let generic = boxed(reader)?;
                let count = reader.read_count()?;
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(TypeSignature::decode(reader)?);
                }
                Self::GenericInst { generic, args }
            }
            ElementType::Var => Self::Var(reader.read_u32()?),
            ElementType::MVar => Self::MVar(reader.read_u32()?),
            ElementType::FnPtr => Self::FnPtr(Box::new(MethodSignature::decode(reader)?)),
        })
    }
}

impl TypeDefOrRef {
    pub(crate) fn encode(&self, writer: &mut ImageWriter) {
        match self {
            Self::Def(id) => {
                writer.emit_u8(0);
                writer.emit_u32(id.0);
            }
            Self::Ref(r) => {
                writer.emit_u8(1);
                match &r.scope {
                    ResolutionScope::CorLib => writer.emit_u8(0),
                    ResolutionScope::Assembly(name) => {
                        writer.emit_u8(1);
                        writer.emit_string(name);
                    }
                    ResolutionScope::Module => writer.emit_u8(2),
                }
                writer.emit_opt_string(r.namespace.as_deref());
                writer.emit_string(&r.name);
            }
        }
    }

    pub(crate) fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        match reader.read_tag("type reference", 2)? {
            0 => Ok(Self::Def(TypeDefId(reader.read_u32()?))),
            _ => {
                let scope = match reader.read_tag("resolution scope", 3)? {
                    0 => ResolutionScope::CorLib,
                    1 => ResolutionScope::Assembly(reader.read_string()?),
                    _ => ResolutionScope::Module,
                };
                let namespace = reader.read_opt_string()?;
                let name = reader.read_string()?;
                Ok(Self::Ref(TypeReference {
                    scope,
                    namespace,
                    name,
                }))
            }
        }
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((ns, name)) = self.primitive_name() {
            return write!(f, "{}.{}", ns, name);
        }
        match self {
            Self::ValueType(TypeDefOrRef::Def(id)) | Self::Class(TypeDefOrRef::Def(id)) => {
                write!(f, "typedef#{}", id.0)
            }
            Self::ValueType(TypeDefOrRef::Ref(r)) | Self::Class(TypeDefOrRef::Ref(r)) => {
                f.write_str(&r.full_name())
            }
            Self::SzArray(inner) => write!(f, "{}[]", inner),
            Self::Array { element, rank } => {
                write!(f, "{}[{}]", element, ",".repeat(rank.saturating_sub(1) as usize))
            }
            Self::Ptr(inner) => write!(f, "{}*", inner),
            Self::ByRef(inner) => write!(f, "{}&", inner),
            Self::Pinned(inner) => write!(f, "{} pinned", inner),
            Self::ModReq { base, .. } => write!(f, "{} modreq", base),
            Self::ModOpt { base, .. } => write!(f, "{} modopt", base),
            Self::GenericInst { generic, args } => {
                write!(f, "{}<", generic)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(">")
            }
            Self::Var(n) => write!(f, "!{}", n),
            Self::MVar(n) => write!(f, "!!{}", n),
            Self::FnPtr(_) => f.write_str("method*"),
            _ => f.write_str("?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(sig: &TypeSignature) -> TypeSignature {
        let mut writer = ImageWriter::new();
        sig.encode(&mut writer);
        let mut reader = ImageReader::new(writer.buffer());
        let decoded = TypeSignature::decode(&mut reader).unwrap();
        assert!(!reader.has_more());
        decoded
    }

    #[test]
    fn test_element_type_codes() {
        assert_eq!(TypeSignature::I4.element_type() as u8, 0x08);
        assert_eq!(TypeSignature::String.element_type() as u8, 0x0e);
        assert_eq!(
            TypeSignature::SzArray(Box::new(TypeSignature::I4)).element_type() as u8,
            0x1d
        );
        assert_eq!(ElementType::from_u8(0x45), Some(ElementType::Pinned));
        assert_eq!(ElementType::from_u8(0x17), None);
    }

    #[test]
    fn test_value_type_rules() {
        assert!(TypeSignature::I4.is_value_type());
        assert!(TypeSignature::corlib_value_type("System", "DateTime").is_value_type());
        assert!(!TypeSignature::String.is_value_type());
        assert!(!TypeSignature::Object.is_value_type());
        assert!(!TypeSignature::SzArray(Box::new(TypeSignature::I4)).is_value_type());

        let modified = TypeSignature::ModReq {
            modifier: TypeDefOrRef::Ref(TypeReference::corlib(
                "System.Runtime.CompilerServices",
                "IsVolatile",
            )),
            base: Box::new(TypeSignature::I8),
        };
        assert!(modified.is_value_type());
        assert_eq!(modified.strip_modifiers(), &TypeSignature::I8);
    }

    #[test]
    fn test_structural_equality() {
        let a = TypeSignature::Class(TypeDefOrRef::Def(TypeDefId(3)));
        let b = TypeSignature::Class(TypeDefOrRef::Def(TypeDefId(3)));
        let c = TypeSignature::ValueType(TypeDefOrRef::Def(TypeDefId(3)));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_corlib_identity() {
        assert!(TypeSignature::I4.is_corlib_type("System", "Int32"));
        assert!(TypeSignature::corlib_class("System", "Exception")
            .is_corlib_type("System", "Exception"));
        assert!(!TypeSignature::corlib_class("System", "Exception")
            .is_corlib_type("System", "Object"));
    }

    #[test]
    fn test_signature_encoding() {
        let sigs = vec![
            TypeSignature::Boolean,
            TypeSignature::Class(TypeDefOrRef::Def(TypeDefId(7))),
            TypeSignature::Array {
                element: Box::new(TypeSignature::R8),
                rank: 2,
            },
            TypeSignature::GenericInst {
                generic: Box::new(TypeSignature::Class(TypeDefOrRef::Ref(TypeReference {
                    scope: ResolutionScope::Assembly("System.Collections".to_string()),
                    namespace: Some("System.Collections.Generic".to_string()),
                    name: "List`1".to_string(),
                }))),
                args: vec![TypeSignature::String],
            },
            TypeSignature::FnPtr(Box::new(MethodSignature::new_static(
                TypeSignature::Void,
                vec![TypeSignature::MVar(0)],
            ))),
        ];
        for sig in &sigs {
            assert_eq!(&roundtrip(sig), sig);
        }
    }

    #[test]
    fn test_invalid_element_type() {
        let bytes = [0x17u8];
        let mut reader = ImageReader::new(&bytes);
        assert!(matches!(
            TypeSignature::decode(&mut reader),
            Err(DecodeError::InvalidElementType(0x17, 0))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeSignature::I4.to_string(), "System.Int32");
        assert_eq!(
            TypeSignature::SzArray(Box::new(TypeSignature::String)).to_string(),
            "System.String[]"
        );
    }
}
