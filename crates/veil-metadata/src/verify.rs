//! Structural verification
//!
//! Checks that every id, slot and label in a module refers to something that
//! exists and that each instruction carries the operand its opcode expects.
//! No stack typing is performed.

use crate::body::{MethodBody, Operand};
use crate::module::{CustomAttribute, FieldId, FieldRef, MethodId, MethodRef, Module, PropertyId};
use crate::opcode::OperandKind;
use crate::types::{TypeDefOrRef, TypeSignature};
use rustc_hash::FxHashSet;

/// Verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Reference to a type that is not declared in the module
    #[error("{context}: invalid type reference typedef#{id}")]
    InvalidTypeRef { context: String, id: u32 },

    /// Reference to a method that is not declared in the module
    #[error("{context}: invalid method reference {id}")]
    InvalidMethodRef { context: String, id: u32 },

    /// Reference to a field that is not declared in the module
    #[error("{context}: invalid field reference {id}")]
    InvalidFieldRef { context: String, id: u32 },

    /// Reference to a property that is not declared in the module
    #[error("{context}: invalid property reference {id}")]
    InvalidPropertyRef { context: String, id: u32 },

    /// A type is its own enclosing type, directly or transitively
    #[error("typedef#{0}: cyclic nesting")]
    CyclicNesting(u32),

    /// Invalid local variable reference
    #[error("{method}: invalid local variable reference {index} (max {max}) at instruction {offset}")]
    InvalidLocalRef {
        method: String,
        index: u16,
        max: usize,
        offset: usize,
    },

    /// Invalid argument reference
    #[error("{method}: invalid argument reference {index} (max {max}) at instruction {offset}")]
    InvalidArgRef {
        method: String,
        index: u16,
        max: usize,
        offset: usize,
    },

    /// Short-form operand does not fit in one byte
    #[error("{method}: short operand out of range at instruction {offset}")]
    ShortOperandOutOfRange { method: String, offset: usize },

    /// Branch to a label that does not exist
    #[error("{method}: invalid branch target at instruction {offset}")]
    InvalidBranchTarget { method: String, offset: usize },

    /// Operand does not match the opcode
    #[error("{method}: operand does not match opcode {opcode} at instruction {offset}")]
    OperandMismatch {
        method: String,
        opcode: String,
        offset: usize,
    },

    /// Two instructions share an id
    #[error("{method}: duplicate instruction id at instruction {offset}")]
    DuplicateInstrId { method: String, offset: usize },

    /// Execution falls off end
    #[error("{0}: execution falls off end of method")]
    FallOffEnd(String),
}

/// Check that every id stored in the definition tables is in range and that
/// nesting is acyclic.
///
/// Modules passing this check can be walked through the [`Module`] accessors
/// without going out of bounds.
pub fn verify_tables(module: &Module) -> Result<(), VerifyError> {
    for &id in module.top_level_types() {
        check_type_id(module, id.0, "top-level types")?;
    }

    for id in module.all_type_ids() {
        let def = module.type_def(id);
        let context = format!("typedef#{}", id.0);
        if let Some(outer) = def.enclosing_type {
            check_type_id(module, outer.0, &context)?;
        }
        for nested in &def.nested_types {
            check_type_id(module, nested.0, &context)?;
        }
        for field in &def.fields {
            check_field_id(module, field.0, &context)?;
        }
        for method in &def.methods {
            check_method_id(module, method.0, &context)?;
        }
        for property in &def.properties {
            check_property_id(module, property.0, &context)?;
        }
        check_attribute_constructors(module, &def.custom_attributes, &context)?;
    }

    // Each enclosing chain must reach a top-level type within `type_count` steps
    for id in module.all_type_ids() {
        let mut current = module.type_def(id).enclosing_type;
        let mut steps = 0;
        while let Some(outer) = current {
            steps += 1;
            if steps > module.type_count() {
                return Err(VerifyError::CyclicNesting(id.0));
            }
            current = module.type_def(outer).enclosing_type;
        }
    }

    for index in 0..module.field_count() {
        let field = module.field(FieldId(index as u32));
        let context = format!("field {}", index);
        check_type_id(module, field.declaring_type.0, &context)?;
        check_attribute_constructors(module, &field.custom_attributes, &context)?;
    }
    for index in 0..module.method_count() {
        let method = module.method(MethodId(index as u32));
        let context = format!("method {}", index);
        check_type_id(module, method.declaring_type.0, &context)?;
        check_attribute_constructors(module, &method.custom_attributes, &context)?;
    }
    for index in 0..module.property_count() {
        let property = module.property(PropertyId(index as u32));
        let context = format!("property {}", index);
        check_type_id(module, property.declaring_type.0, &context)?;
        for accessor in [property.getter, property.setter].into_iter().flatten() {
            check_method_id(module, accessor.0, &context)?;
        }
        check_attribute_constructors(module, &property.custom_attributes, &context)?;
    }

    Ok(())
}

fn check_attribute_constructors(
    module: &Module,
    attributes: &[CustomAttribute],
    context: &str,
) -> Result<(), VerifyError> {
    for attribute in attributes {
        verify_method_ref(module, &attribute.constructor, context)?;
    }
    Ok(())
}

/// Verify every definition and body of a module
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    verify_tables(module)?;

    for id in module.all_type_ids() {
        let def = module.type_def(id);
        let context = module.type_full_name(id);
        if let Some(base) = &def.base_type {
            verify_signature(module, base, &context)?;
        }
        for &field in &def.fields {
            check_field_id(module, field.0, &context)?;
            verify_signature(module, &module.field(field).field_type, &context)?;
        }
        for &method in &def.methods {
            check_method_id(module, method.0, &context)?;
        }
        for &property in &def.properties {
            let prop = module.property(property);
            for accessor in [prop.getter, prop.setter].into_iter().flatten() {
                check_method_id(module, accessor.0, &context)?;
            }
            verify_signature(module, &prop.property_type, &context)?;
        }
        for &nested in &def.nested_types {
            check_type_id(module, nested.0, &context)?;
        }
    }

    for index in 0..module.method_count() {
        verify_method(module, MethodId(index as u32))?;
    }

    Ok(())
}

/// Verify a single method's signature and body
pub fn verify_method(module: &Module, id: MethodId) -> Result<(), VerifyError> {
    let method = module.method(id);
    let name = format!(
        "{}::{}",
        module.type_full_name(method.declaring_type),
        method.name
    );

    verify_signature(module, &method.signature.return_type, &name)?;
    for param in &method.signature.params {
        verify_signature(module, param, &name)?;
    }

    match &method.body {
        Some(body) => verify_body(module, body, method.signature.arg_count(), &name),
        None => Ok(()),
    }
}

fn verify_body(
    module: &Module,
    body: &MethodBody,
    arg_count: usize,
    name: &str,
) -> Result<(), VerifyError> {
    for local in &body.locals {
        verify_signature(module, &local.ty, name)?;
    }

    // Empty bodies are allowed
    if body.instructions.is_empty() {
        return Ok(());
    }

    let mut ids = FxHashSet::default();
    for (offset, instr) in body.instructions.iter().enumerate() {
        if !ids.insert(instr.id) {
            return Err(VerifyError::DuplicateInstrId {
                method: name.to_string(),
                offset,
            });
        }
    }

    for (offset, instr) in body.instructions.iter().enumerate() {
        let mismatch = || VerifyError::OperandMismatch {
            method: name.to_string(),
            opcode: instr.opcode.to_string(),
            offset,
        };
        let kind = instr.opcode.operand_kind();

        let matches = match (&instr.operand, kind) {
            (Operand::None, OperandKind::None) => true,
            (Operand::Local(_), OperandKind::Local | OperandKind::ShortLocal) => true,
            (Operand::Arg(_), OperandKind::Arg | OperandKind::ShortArg) => true,
            (Operand::I32(_), OperandKind::I4 | OperandKind::ShortI4) => true,
            (Operand::I64(_), OperandKind::I8) => true,
            (Operand::F32(_), OperandKind::R4) => true,
            (Operand::F64(_), OperandKind::R8) => true,
            (Operand::String(_), OperandKind::String) => true,
            (Operand::Method(_), OperandKind::Method) => true,
            (Operand::Field(_), OperandKind::Field) => true,
            (Operand::Type(_), OperandKind::Type) => true,
            (Operand::Label(_), OperandKind::Label) => true,
            _ => false,
        };
        if !matches {
            return Err(mismatch());
        }

        let short = matches!(kind, OperandKind::ShortLocal | OperandKind::ShortArg);
        match &instr.operand {
            Operand::Local(index) => {
                if short && *index > u8::MAX as u16 {
                    return Err(VerifyError::ShortOperandOutOfRange {
                        method: name.to_string(),
                        offset,
                    });
                }
                if *index as usize >= body.locals.len() {
                    return Err(VerifyError::InvalidLocalRef {
                        method: name.to_string(),
                        index: *index,
                        max: body.locals.len(),
                        offset,
                    });
                }
            }
            Operand::Arg(index) => {
                if short && *index > u8::MAX as u16 {
                    return Err(VerifyError::ShortOperandOutOfRange {
                        method: name.to_string(),
                        offset,
                    });
                }
                if *index as usize >= arg_count {
                    return Err(VerifyError::InvalidArgRef {
                        method: name.to_string(),
                        index: *index,
                        max: arg_count,
                        offset,
                    });
                }
            }
            Operand::I32(value) if kind == OperandKind::ShortI4 => {
                if i8::try_from(*value).is_err() {
                    return Err(VerifyError::ShortOperandOutOfRange {
                        method: name.to_string(),
                        offset,
                    });
                }
            }
            Operand::Label(target) => {
                if !ids.contains(target) {
                    return Err(VerifyError::InvalidBranchTarget {
                        method: name.to_string(),
                        offset,
                    });
                }
            }
            Operand::Method(m) => verify_method_ref(module, m, name)?,
            Operand::Field(f) => verify_field_ref(module, f, name)?,
            Operand::Type(t) => verify_signature(module, t, name)?,
            _ => {}
        }
        // Implicit slots of macro forms
        if let Some(index) = instr.opcode.implicit_local() {
            if index as usize >= body.locals.len() {
                return Err(VerifyError::InvalidLocalRef {
                    method: name.to_string(),
                    index,
                    max: body.locals.len(),
                    offset,
                });
            }
        }
        if let Some(index) = instr.opcode.implicit_arg() {
            if index as usize >= arg_count {
                return Err(VerifyError::InvalidArgRef {
                    method: name.to_string(),
                    index,
                    max: arg_count,
                    offset,
                });
            }
        }
    }

    match body.instructions.last() {
        Some(last) if last.opcode.is_terminator() => Ok(()),
        _ => Err(VerifyError::FallOffEnd(name.to_string())),
    }
}

fn verify_method_ref(module: &Module, m: &MethodRef, context: &str) -> Result<(), VerifyError> {
    match m {
        MethodRef::Def(id) => check_method_id(module, id.0, context),
        MethodRef::Member(member) => {
            verify_signature(module, &member.parent, context)?;
            verify_signature(module, &member.signature.return_type, context)?;
            for param in &member.signature.params {
                verify_signature(module, param, context)?;
            }
            Ok(())
        }
    }
}

fn verify_field_ref(module: &Module, f: &FieldRef, context: &str) -> Result<(), VerifyError> {
    match f {
        FieldRef::Def(id) => check_field_id(module, id.0, context),
        FieldRef::Member {
            parent, field_type, ..
        } => {
            verify_signature(module, parent, context)?;
            verify_signature(module, field_type, context)
        }
    }
}

fn verify_signature(module: &Module, sig: &TypeSignature, context: &str) -> Result<(), VerifyError> {
    match sig {
        TypeSignature::ValueType(tdr) | TypeSignature::Class(tdr) => {
            verify_type_def_or_ref(module, tdr, context)
        }
        TypeSignature::SzArray(inner)
        | TypeSignature::Ptr(inner)
        | TypeSignature::ByRef(inner)
        | TypeSignature::Pinned(inner) => verify_signature(module, inner, context),
        TypeSignature::Array { element, .. } => verify_signature(module, element, context),
        TypeSignature::ModReq { modifier, base } | TypeSignature::ModOpt { modifier, base } => {
            verify_type_def_or_ref(module, modifier, context)?;
            verify_signature(module, base, context)
        }
        TypeSignature::GenericInst { generic, args } => {
            verify_signature(module, generic, context)?;
            for arg in args {
                verify_signature(module, arg, context)?;
            }
            Ok(())
        }
        TypeSignature::FnPtr(sig) => {
            verify_signature(module, &sig.return_type, context)?;
            for param in &sig.params {
                verify_signature(module, param, context)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn verify_type_def_or_ref(
    module: &Module,
    tdr: &TypeDefOrRef,
    context: &str,
) -> Result<(), VerifyError> {
    match tdr {
        TypeDefOrRef::Def(id) => check_type_id(module, id.0, context),
        TypeDefOrRef::Ref(_) => Ok(()),
    }
}

fn check_type_id(module: &Module, id: u32, context: &str) -> Result<(), VerifyError> {
    if id as usize >= module.type_count() {
        return Err(VerifyError::InvalidTypeRef {
            context: context.to_string(),
            id,
        });
    }
    Ok(())
}

fn check_method_id(module: &Module, id: u32, context: &str) -> Result<(), VerifyError> {
    if id as usize >= module.method_count() {
        return Err(VerifyError::InvalidMethodRef {
            context: context.to_string(),
            id,
        });
    }
    Ok(())
}

fn check_property_id(module: &Module, id: u32, context: &str) -> Result<(), VerifyError> {
    if id as usize >= module.property_count() {
        return Err(VerifyError::InvalidPropertyRef {
            context: context.to_string(),
            id,
        });
    }
    Ok(())
}

fn check_field_id(module: &Module, id: u32, context: &str) -> Result<(), VerifyError> {
    if id as usize >= module.field_count() {
        return Err(VerifyError::InvalidFieldRef {
            context: context.to_string(),
            id,
        });
    }
    Ok(())
}
