use super::DisplayStrategy;
use crate::factory::{ProxyContext, DISPLAY_PROPERTY_NAME};
use veil_metadata::module::method_attributes;
use veil_metadata::{
    FieldRef, HasCustomAttribute, MethodBody, MethodRef, Opcode, Operand, TypeDefId,
    TypeSignature,
};

/// Display property whose evaluation overwrites the wrapped value's public
/// state with synthetic data
pub struct StateMutatorStrategy;

impl DisplayStrategy for StateMutatorStrategy {
    fn name(&self) -> &'static str {
        "statechanger"
    }

    fn post_process(&self, cx: &mut ProxyContext<'_>, original: &TypeSignature, proxy: TypeDefId) {
        let Some(definition) = cx.resolve_original(original) else {
            return;
        };
        let Some(value_field) = cx.wrapped_field(proxy) else {
            return;
        };

        let (fields, setters) = mutable_members(cx, definition);

        // Value types are mutated in place through the field's address
        let by_address = original.is_value_type();
        let (load, invoke) = if by_address {
            (Opcode::Ldflda, Opcode::Call)
        } else {
            (Opcode::Ldfld, Opcode::Callvirt)
        };

        // Members without a constant form are left alone
        let mut body = MethodBody::new();
        for (field, field_type) in fields {
            let mut value = MethodBody::new();
            if !cx.emit_typical(&mut value, &field_type) {
                continue;
            }
            body.emit_op(Opcode::Ldarg0);
            body.emit(load, Operand::Field(FieldRef::Def(value_field)));
            append(&mut body, &value);
            body.emit(Opcode::Stfld, Operand::Field(field));
        }
        for (setter, value_type) in setters {
            let mut value = MethodBody::new();
            if !cx.emit_typical(&mut value, &value_type) {
                continue;
            }
            body.emit_op(Opcode::Ldarg0);
            body.emit(load, Operand::Field(FieldRef::Def(value_field)));
            append(&mut body, &value);
            body.emit(invoke, Operand::Method(setter));
        }
        body.emit_op(Opcode::Ldnull);
        body.emit_op(Opcode::Ret);

        let (property, getter) = cx.add_getter_property(
            proxy,
            DISPLAY_PROPERTY_NAME,
            TypeSignature::String,
            method_attributes::PUBLIC,
        );
        cx.home.method_mut(getter).body = Some(body);

        cx.mark_never_browsable(HasCustomAttribute::Property(property));
        cx.add_display_string(proxy, Some(&format!("{{{}}}", DISPLAY_PROPERTY_NAME)));
    }
}

fn append(body: &mut MethodBody, tail: &MethodBody) {
    for instr in tail.instructions.iter() {
        body.emit(instr.opcode, instr.operand.clone());
    }
}

type Members = (Vec<(FieldRef, TypeSignature)>, Vec<(MethodRef, TypeSignature)>);

/// Public instance fields, and public single-argument instance setters, of a definition
fn mutable_members(cx: &ProxyContext<'_>, definition: TypeDefId) -> Members {
    let source = cx.source();
    let def = source.type_def(definition);

    let fields = def
        .fields
        .iter()
        .copied()
        .filter(|&f| {
            let field = source.field(f);
            field.is_public() && !field.is_static() && !field.is_literal()
        })
        .map(|f| (cx.field_ref(f), cx.import(&source.field(f).field_type)))
        .collect();

    let setters = def
        .properties
        .iter()
        .filter_map(|&p| source.property(p).setter)
        .filter(|&m| {
            let setter = source.method(m);
            setter.is_public() && !setter.is_static() && setter.signature.params.len() == 1
        })
        .map(|m| (cx.method_ref(m), cx.import(&source.method(m).signature.params[0])))
        .collect();

    (fields, setters)
}
