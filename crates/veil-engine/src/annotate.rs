//! Annotate-types pass
//!
//! Attaches `[DebuggerTypeProxy(typeof(Proxy))]` to the types a module
//! declares, so the debugger shows the proxy for every instance regardless of
//! where it is stored. Locals of annotated types are left alone by the
//! rewriter.

use crate::factory::ProxyFactory;
use tracing::debug;
use veil_metadata::{Module, TypeDefId, TypeDefOrRef, TypeSignature};

/// Whether a declared type can carry a type proxy: it is not static, does not
/// derive from `System.Attribute` and has an instance constructor
pub fn is_annotatable(module: &Module, id: TypeDefId) -> bool {
    let def = module.type_def(id);
    if def.is_static() || def.is_interface() {
        return false;
    }
    if def
        .base_type
        .as_ref()
        .is_some_and(|base| base.is_corlib_type("System", "Attribute"))
    {
        return false;
    }
    def.methods
        .iter()
        .any(|&m| module.method(m).is_instance_constructor())
}

/// Whether locals of `ty` are already covered by the annotate-types pass
pub fn covers_local(module: &Module, ty: &TypeSignature, annotate_types: bool) -> bool {
    if !annotate_types {
        return false;
    }
    match ty.type_def_or_ref() {
        Some(TypeDefOrRef::Def(id)) => module.contains_type(*id) && is_annotatable(module, *id),
        _ => false,
    }
}

/// Point the debugger at the proxy of `id`. Returns `false` when the type
/// cannot be annotated.
pub fn annotate_type(factory: &mut ProxyFactory, module: &mut Module, id: TypeDefId) -> bool {
    if !is_annotatable(module, id) {
        return false;
    }

    let original = module.signature_of(id);
    let proxy = factory.proxy_info(module, &original).signature.clone();
    let attribute = factory.known().type_proxy(proxy);
    module.type_def_mut(id).custom_attributes.push(attribute);

    debug!("Annotated {} with a type proxy", module.type_full_name(id));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Placement;
    use crate::known::is_attribute;
    use crate::strategy::StrategyKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use veil_metadata::module::{method_attributes, type_attributes};
    use veil_metadata::{MethodBody, MethodDef, MethodSignature, Opcode, TypeDef};

    fn add_class(module: &mut Module, name: &str, attributes: u32, base: TypeSignature, with_ctor: bool) -> TypeDefId {
        let id = module.add_type(TypeDef::new("App", name, attributes, Some(base)));
        if with_ctor {
            let mut body = MethodBody::new();
            body.emit_op(Opcode::Ret);
            module.add_method(
                id,
                MethodDef::new(
                    ".ctor",
                    method_attributes::PUBLIC | method_attributes::SPECIAL_NAME | method_attributes::RT_SPECIAL_NAME,
                    MethodSignature::new_instance(TypeSignature::Void, vec![]),
                )
                .with_body(body),
            );
        }
        id
    }

    #[test]
    fn test_annotatable_rules() {
        let mut module = Module::new("App");
        let plain = add_class(&mut module, "Plain", type_attributes::PUBLIC, TypeSignature::Object, true);
        let no_ctor = add_class(&mut module, "NoCtor", type_attributes::PUBLIC, TypeSignature::Object, false);
        let statik = add_class(
            &mut module,
            "Helpers",
            type_attributes::PUBLIC | type_attributes::ABSTRACT | type_attributes::SEALED,
            TypeSignature::Object,
            true,
        );
        let attribute = add_class(
            &mut module,
            "MarkerAttribute",
            type_attributes::PUBLIC,
            TypeSignature::corlib_class("System", "Attribute"),
            true,
        );

        assert!(is_annotatable(&module, plain));
        assert!(!is_annotatable(&module, no_ctor));
        assert!(!is_annotatable(&module, statik));
        assert!(!is_annotatable(&module, attribute));
    }

    #[test]
    fn test_covers_local_only_when_enabled() {
        let mut module = Module::new("App");
        let plain = add_class(&mut module, "Plain", type_attributes::PUBLIC, TypeSignature::Object, true);
        let sig = module.signature_of(plain);

        assert!(covers_local(&module, &sig, true));
        assert!(!covers_local(&module, &sig, false));
        assert!(!covers_local(&module, &TypeSignature::I4, true));
        assert!(!covers_local(&module, &TypeSignature::corlib_class("System", "Uri"), true));
    }

    #[test]
    fn test_annotate_attaches_type_proxy() {
        let mut module = Module::new("App");
        let plain = add_class(&mut module, "Plain", type_attributes::PUBLIC, TypeSignature::Object, true);
        let no_ctor = add_class(&mut module, "NoCtor", type_attributes::PUBLIC, TypeSignature::Object, false);
        let mut factory = crate::ProxyFactory::new(
            StrategyKind::Empty.create(),
            Placement::Target,
            StdRng::seed_from_u64(2),
        );

        assert!(annotate_type(&mut factory, &mut module, plain));
        assert!(!annotate_type(&mut factory, &mut module, no_ctor));
        assert_eq!(factory.cache().len(), 1);

        let proxy = factory.cache().get(&module.signature_of(plain)).unwrap().signature.clone();
        let attribute = module
            .type_def(plain)
            .custom_attributes
            .iter()
            .find(|a| is_attribute(a, "System.Diagnostics", "DebuggerTypeProxyAttribute"))
            .unwrap();
        assert_eq!(attribute.args[0].value, veil_metadata::AttributeValue::Type(proxy));
    }
}
