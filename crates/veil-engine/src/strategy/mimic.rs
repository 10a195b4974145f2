use super::DisplayStrategy;
use crate::factory::ProxyContext;
use veil_metadata::module::{field_attributes, method_attributes};
use veil_metadata::{
    FieldDef, FieldRef, MethodBody, Opcode, Operand, TypeDefId, TypeSignature,
};

/// Fabricated display string plus a copy of the original's fields and
/// properties, all holding synthetic values
pub struct MimicStrategy;

impl DisplayStrategy for MimicStrategy {
    fn name(&self) -> &'static str {
        "mimic"
    }

    fn post_process(&self, cx: &mut ProxyContext<'_>, original: &TypeSignature, proxy: TypeDefId) {
        cx.add_random_display_string(original, proxy);

        let Some(definition) = cx.resolve_original(original) else {
            return;
        };
        mimic_fields(cx, proxy, definition);
        mimic_properties(cx, proxy, definition);
    }
}

fn mimic_fields(cx: &mut ProxyContext<'_>, proxy: TypeDefId, definition: TypeDefId) {
    let Some(ctor) = cx.instance_constructor(proxy) else {
        return;
    };

    let source = cx.source();
    let fields: Vec<(String, TypeSignature)> = source
        .type_def(definition)
        .fields
        .iter()
        .map(|&f| source.field(f))
        .filter(|f| !f.is_static())
        .map(|f| (f.name.clone(), cx.import(&f.field_type)))
        .collect();

    for (name, field_type) in fields {
        let mut load = MethodBody::new();
        let initialized = cx.emit_typical(&mut load, &field_type);
        let field = cx
            .home
            .add_field(proxy, FieldDef::new(&name, field_attributes::PUBLIC, field_type));
        if !initialized {
            // Keeps its default value
            continue;
        }

        // Initialized in the constructor, right before its final `ret`
        let Some(body) = cx.home.method_mut(ctor).body.as_mut() else {
            continue;
        };
        let instructions = &mut body.instructions;
        let Some(mut at) = instructions.len().checked_sub(1) else {
            continue;
        };
        instructions.insert(at, Opcode::Ldarg0, Operand::None);
        for instr in load.instructions.iter() {
            at += 1;
            instructions.insert(at, instr.opcode, instr.operand.clone());
        }
        instructions.insert(at + 1, Opcode::Stfld, Operand::Field(FieldRef::Def(field)));
    }
}

fn mimic_properties(cx: &mut ProxyContext<'_>, proxy: TypeDefId, definition: TypeDefId) {
    let source = cx.source();
    let properties: Vec<(String, TypeSignature)> = source
        .type_def(definition)
        .properties
        .iter()
        .map(|&p| source.property(p))
        .map(|p| (p.name.clone(), cx.import(&p.property_type)))
        .collect();

    for (name, property_type) in properties {
        let mut body = MethodBody::new();
        if !cx.emit_typical(&mut body, &property_type) {
            continue;
        }
        body.emit_op(Opcode::Ret);
        let (_, getter) = cx.add_getter_property(
            proxy,
            &name,
            property_type,
            method_attributes::PUBLIC | method_attributes::SPECIAL_NAME | method_attributes::HIDE_BY_SIG,
        );
        cx.home.method_mut(getter).body = Some(body);
    }
}
