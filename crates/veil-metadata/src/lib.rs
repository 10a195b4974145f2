//! Veil Module Metadata
//!
//! This crate provides the in-memory model of a managed module that veil
//! rewrites: type signatures, type/field/method/property definitions, custom
//! attributes, CIL instruction streams with symbolic branch labels, the binary
//! image format, a structural verifier and a reference evaluator.

#![warn(rust_2018_idioms)]

pub mod body;
pub mod encoder;
pub mod eval;
pub mod module;
pub mod opcode;
pub mod types;
pub mod verify;

pub use body::{InstrId, Instruction, InstructionList, LocalVariable, MethodBody, Operand};
pub use encoder::{DecodeError, ImageReader, ImageWriter};
pub use eval::{EvalError, Evaluator, Value};
pub use module::{
    AttributeArgument, AttributeValue, CustomAttribute, FieldDef, FieldId, FieldRef,
    HasCustomAttribute, ManifestResource, MemberReference, MethodDef, MethodId, MethodRef, Module,
    ModuleError, PropertyDef, PropertyId, TypeDef,
};
pub use opcode::Opcode;
pub use types::{
    ElementType, MethodSignature, ResolutionScope, TypeDefId, TypeDefOrRef, TypeReference,
    TypeSignature,
};
pub use verify::{verify_module, verify_tables, VerifyError};
