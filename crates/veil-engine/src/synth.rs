//! Synthetic values shown in place of real data

use rand::Rng;
use veil_metadata::{MethodBody, Module, Opcode, Operand, TypeSignature};

/// Message placed in fabricated strings
pub const PEEPING_MESSAGE: &str = "Hey no peeping in the debugger! (╯°□°)╯︵ ┻━┻";

/// A plausible-looking value of a primitive type
#[derive(Debug, Clone, PartialEq)]
pub enum SyntheticValue {
    Bool(bool),
    Char(char),
    I4(i32),
    I8(i64),
    R4(f32),
    R8(f64),
    String(String),
}

/// Pick a random value that looks typical for `ty`.
///
/// Only the outermost element type is considered; anything that is not a
/// boolean, character, integer, float or string yields `None`.
pub fn typical_value<R: Rng>(ty: &TypeSignature, rng: &mut R) -> Option<SyntheticValue> {
    let value = match ty {
        TypeSignature::Boolean => SyntheticValue::Bool(rng.gen()),
        TypeSignature::Char => SyntheticValue::Char(rng.gen_range('a'..='z')),
        TypeSignature::I1
        | TypeSignature::I2
        | TypeSignature::I4
        | TypeSignature::U1
        | TypeSignature::U2
        | TypeSignature::U4 => SyntheticValue::I4(rng.gen_range(0..100)),
        TypeSignature::I8 | TypeSignature::U8 => SyntheticValue::I8(rng.gen_range(0..100_000)),
        TypeSignature::R4 => SyntheticValue::R4(rng.gen()),
        TypeSignature::R8 => SyntheticValue::R8(rng.gen()),
        TypeSignature::String => SyntheticValue::String(PEEPING_MESSAGE.to_string()),
        _ => return None,
    };
    Some(value)
}

/// Render a value the way the debugger would show it for `ty`.
///
/// Returns `None` for types that need no custom display string.
pub fn format_display(module: &Module, ty: &TypeSignature, value: Option<&SyntheticValue>) -> Option<String> {
    match ty {
        TypeSignature::Boolean => match value? {
            SyntheticValue::Bool(b) => Some(b.to_string()),
            _ => None,
        },
        TypeSignature::Char => match value {
            Some(SyntheticValue::Char(c)) => Some(format!("'{}'", c)),
            _ => Some("''".to_string()),
        },
        TypeSignature::I1
        | TypeSignature::U1
        | TypeSignature::I2
        | TypeSignature::U2
        | TypeSignature::I4
        | TypeSignature::U4
        | TypeSignature::I8
        | TypeSignature::U8
        | TypeSignature::I
        | TypeSignature::U
        | TypeSignature::R4
        | TypeSignature::R8 => match value? {
            SyntheticValue::I4(v) => Some(v.to_string()),
            SyntheticValue::I8(v) => Some(v.to_string()),
            SyntheticValue::R4(v) => Some(v.to_string()),
            SyntheticValue::R8(v) => Some(v.to_string()),
            _ => None,
        },
        TypeSignature::String => match value {
            Some(SyntheticValue::String(s)) => Some(format!("\"{}\"", s)),
            _ => Some("null".to_string()),
        },
        TypeSignature::SzArray(element) | TypeSignature::Array { element, .. } => {
            Some(format!("\\{{{}[0]\\}}", module.signature_full_name(element)))
        }
        TypeSignature::ModReq { base, .. }
        | TypeSignature::ModOpt { base, .. }
        | TypeSignature::ByRef(base)
        | TypeSignature::Pinned(base) => format_display(module, base, value),
        _ => None,
    }
}

/// The instruction that loads `value` as a `ty`.
///
/// Integer-like types without a value load zero and reference types load
/// `null`. Value types, native integers, pointers and by-refs have no single
/// load-constant form and yield `None`.
pub fn typical_instruction(ty: &TypeSignature, value: Option<&SyntheticValue>) -> Option<(Opcode, Operand)> {
    let instruction = match ty.strip_modifiers() {
        TypeSignature::Boolean
        | TypeSignature::Char
        | TypeSignature::I1
        | TypeSignature::I2
        | TypeSignature::I4
        | TypeSignature::U1
        | TypeSignature::U2
        | TypeSignature::U4 => {
            let v = match value {
                Some(SyntheticValue::Bool(b)) => i32::from(*b),
                Some(SyntheticValue::Char(c)) => *c as i32,
                Some(SyntheticValue::I4(v)) => *v,
                _ => 0,
            };
            (Opcode::LdcI4, Operand::I32(v))
        }
        TypeSignature::I8 | TypeSignature::U8 => {
            let v = match value {
                Some(SyntheticValue::I8(v)) => *v,
                _ => 0,
            };
            (Opcode::LdcI8, Operand::I64(v))
        }
        TypeSignature::R4 => {
            let v = match value {
                Some(SyntheticValue::R4(v)) => *v,
                _ => 0.0,
            };
            (Opcode::LdcR4, Operand::F32(v))
        }
        TypeSignature::R8 => {
            let v = match value {
                Some(SyntheticValue::R8(v)) => *v,
                _ => 0.0,
            };
            (Opcode::LdcR8, Operand::F64(v))
        }
        TypeSignature::String => match value {
            Some(SyntheticValue::String(s)) => (Opcode::Ldstr, Operand::String(s.clone())),
            _ => (Opcode::Ldnull, Operand::None),
        },
        TypeSignature::Object
        | TypeSignature::Class(_)
        | TypeSignature::SzArray(_)
        | TypeSignature::Array { .. } => (Opcode::Ldnull, Operand::None),
        TypeSignature::GenericInst { generic, .. } if !generic.is_value_type() => {
            (Opcode::Ldnull, Operand::None)
        }
        _ => return None,
    };
    Some(instruction)
}

/// Append the load of a typical `ty` to `body`.
///
/// Native integers load a 64-bit zero and convert it. Returns `false`, leaving
/// `body` untouched, when `ty` has no constant form.
pub fn emit_typical(body: &mut MethodBody, ty: &TypeSignature, value: Option<&SyntheticValue>) -> bool {
    let conversion = match ty.strip_modifiers() {
        TypeSignature::I => Some(Opcode::ConvI),
        TypeSignature::U => Some(Opcode::ConvU),
        _ => None,
    };
    if let Some(conversion) = conversion {
        body.emit(Opcode::LdcI8, Operand::I64(0));
        body.emit_op(conversion);
        return true;
    }
    match typical_instruction(ty, value) {
        Some((opcode, operand)) => {
            body.emit(opcode, operand);
            true
        }
        None => false,
    }
}

/// Whether a proxy of `ty` gets a `Display` property instead of a literal display string
pub fn has_display_property(ty: &TypeSignature) -> bool {
    matches!(
        ty,
        TypeSignature::Void
            | TypeSignature::Boolean
            | TypeSignature::Char
            | TypeSignature::I1
            | TypeSignature::U1
            | TypeSignature::I2
            | TypeSignature::U2
            | TypeSignature::I4
            | TypeSignature::U4
            | TypeSignature::I8
            | TypeSignature::U8
            | TypeSignature::R4
            | TypeSignature::R8
            | TypeSignature::String
            | TypeSignature::I
            | TypeSignature::U
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use veil_metadata::TypeDefOrRef;

    #[test]
    fn test_typical_value_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            match typical_value(&TypeSignature::I4, &mut rng) {
                Some(SyntheticValue::I4(v)) => assert!((0..100).contains(&v)),
                other => panic!("unexpected {:?}", other),
            }
            match typical_value(&TypeSignature::U8, &mut rng) {
                Some(SyntheticValue::I8(v)) => assert!((0..100_000).contains(&v)),
                other => panic!("unexpected {:?}", other),
            }
            match typical_value(&TypeSignature::R8, &mut rng) {
                Some(SyntheticValue::R8(v)) => assert!((0.0..1.0).contains(&v)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            typical_value(&TypeSignature::String, &mut rng),
            Some(SyntheticValue::String(PEEPING_MESSAGE.to_string()))
        );
        assert_eq!(typical_value(&TypeSignature::Object, &mut rng), None);
        assert_eq!(typical_value(&TypeSignature::I, &mut rng), None);
    }

    #[test]
    fn test_same_seed_same_values() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for ty in [TypeSignature::I4, TypeSignature::Boolean, TypeSignature::R4] {
            assert_eq!(typical_value(&ty, &mut a), typical_value(&ty, &mut b));
        }
    }

    #[test]
    fn test_format_display() {
        let module = Module::new("App");
        assert_eq!(
            format_display(&module, &TypeSignature::Boolean, Some(&SyntheticValue::Bool(true))),
            Some("true".to_string())
        );
        assert_eq!(
            format_display(&module, &TypeSignature::I4, Some(&SyntheticValue::I4(42))),
            Some("42".to_string())
        );
        assert_eq!(
            format_display(&module, &TypeSignature::String, None),
            Some("null".to_string())
        );
        assert_eq!(
            format_display(&module, &TypeSignature::String, Some(&SyntheticValue::String("x".into()))),
            Some("\"x\"".to_string())
        );
        assert_eq!(
            format_display(&module, &TypeSignature::SzArray(Box::new(TypeSignature::I4)), None),
            Some("\\{System.Int32[0]\\}".to_string())
        );
        let wrapped = TypeSignature::ModReq {
            modifier: TypeDefOrRef::Ref(veil_metadata::TypeReference::corlib(
                "System.Runtime.CompilerServices",
                "IsVolatile",
            )),
            base: Box::new(TypeSignature::I4),
        };
        assert_eq!(
            format_display(&module, &wrapped, Some(&SyntheticValue::I4(3))),
            Some("3".to_string())
        );
        assert_eq!(format_display(&module, &TypeSignature::Object, None), None);
        assert_eq!(
            format_display(&module, &TypeSignature::corlib_class("System", "Uri"), None),
            None
        );
    }

    #[test]
    fn test_typical_instruction() {
        assert_eq!(
            typical_instruction(&TypeSignature::Boolean, Some(&SyntheticValue::Bool(true))),
            Some((Opcode::LdcI4, Operand::I32(1)))
        );
        assert_eq!(
            typical_instruction(&TypeSignature::I8, Some(&SyntheticValue::I8(5))),
            Some((Opcode::LdcI8, Operand::I64(5)))
        );
        assert_eq!(
            typical_instruction(&TypeSignature::String, Some(&SyntheticValue::String("s".into()))),
            Some((Opcode::Ldstr, Operand::String("s".into())))
        );
        assert_eq!(
            typical_instruction(&TypeSignature::Object, None),
            Some((Opcode::Ldnull, Operand::None))
        );
        assert_eq!(
            typical_instruction(&TypeSignature::I4, None),
            Some((Opcode::LdcI4, Operand::I32(0)))
        );
    }

    #[test]
    fn test_value_types_have_no_constant_form() {
        let date = TypeSignature::corlib_value_type("System", "DateTime");
        let nullable = TypeSignature::GenericInst {
            generic: Box::new(TypeSignature::corlib_value_type("System", "Nullable`1")),
            args: vec![TypeSignature::I4],
        };
        let list = TypeSignature::GenericInst {
            generic: Box::new(TypeSignature::corlib_class("System.Collections.Generic", "List`1")),
            args: vec![TypeSignature::I4],
        };

        assert_eq!(typical_instruction(&date, None), None);
        assert_eq!(typical_instruction(&nullable, None), None);
        assert_eq!(typical_instruction(&TypeSignature::I, None), None);
        assert_eq!(typical_instruction(&TypeSignature::Ptr(Box::new(TypeSignature::I4)), None), None);
        assert_eq!(typical_instruction(&list, None), Some((Opcode::Ldnull, Operand::None)));

        let mut body = MethodBody::new();
        assert!(!emit_typical(&mut body, &date, None));
        assert_eq!(body.instructions.len(), 0);
    }

    #[test]
    fn test_native_integers_load_converted_zero() {
        let mut body = MethodBody::new();
        assert!(emit_typical(&mut body, &TypeSignature::U, None));
        let ops: Vec<Opcode> = body.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::LdcI8, Opcode::ConvU]);
    }
}
