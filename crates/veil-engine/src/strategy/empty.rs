use super::DisplayStrategy;
use crate::factory::ProxyContext;
use veil_metadata::module::{method_attributes, type_attributes};
use veil_metadata::{MethodBody, MethodDef, MethodSignature, Opcode, TypeDef, TypeDefId, TypeSignature};

/// Name of the nested type the debugger is redirected to
pub const DISPLAY_TYPE_NAME: &str = "DisplayType";

/// Fabricated display string plus an empty type proxy, so expanding the
/// variable shows no members at all
pub struct EmptyStrategy;

impl DisplayStrategy for EmptyStrategy {
    fn name(&self) -> &'static str {
        "empty"
    }

    fn post_process(&self, cx: &mut ProxyContext<'_>, original: &TypeSignature, proxy: TypeDefId) {
        cx.add_random_display_string(original, proxy);

        let display_type = add_display_type(cx, proxy);
        let attribute = cx.known.type_proxy(cx.home.signature_of(display_type));
        cx.home.type_def_mut(proxy).custom_attributes.push(attribute);
    }
}

/// `private class DisplayType { public DisplayType(Proxy proxy) { } }` nested in the proxy
fn add_display_type(cx: &mut ProxyContext<'_>, proxy: TypeDefId) -> TypeDefId {
    let proxy_sig = cx.home.signature_of(proxy);

    let mut def = TypeDef::new(
        "",
        DISPLAY_TYPE_NAME,
        type_attributes::NESTED_PRIVATE,
        Some(cx.known.object_type.clone()),
    );
    def.enclosing_type = Some(proxy);
    let display_type = cx.home.add_type(def);

    let mut body = MethodBody::new();
    body.emit_op(Opcode::Ret);
    cx.home.add_method(
        display_type,
        MethodDef::new(
            ".ctor",
            method_attributes::PUBLIC
                | method_attributes::HIDE_BY_SIG
                | method_attributes::SPECIAL_NAME
                | method_attributes::RT_SPECIAL_NAME,
            MethodSignature::new_instance(TypeSignature::Void, vec![proxy_sig]),
        )
        .with_body(body),
    );
    display_type
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{Placement, ProxyFactory};
    use crate::known::is_attribute;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use veil_metadata::{AttributeValue, Module};

    #[test]
    fn test_nested_display_type_attached() {
        let mut module = Module::new("App");
        let mut factory = ProxyFactory::new(Box::new(EmptyStrategy), Placement::Target, StdRng::seed_from_u64(0));
        let proxy = factory.proxy_info(&mut module, &TypeSignature::I4).ty;

        let def = module.type_def(proxy);
        assert_eq!(def.nested_types.len(), 1);
        let nested = def.nested_types[0];
        assert_eq!(module.type_name(nested), "Int32/DisplayType");
        assert_eq!(
            module.type_def(nested).attributes & type_attributes::VISIBILITY_MASK,
            type_attributes::NESTED_PRIVATE
        );
        assert_eq!(module.type_def(nested).methods.len(), 1);

        let type_proxy = def
            .custom_attributes
            .iter()
            .find(|a| is_attribute(a, "System.Diagnostics", "DebuggerTypeProxyAttribute"))
            .unwrap();
        assert_eq!(
            type_proxy.args[0].value,
            AttributeValue::Type(module.signature_of(nested))
        );
    }

    #[test]
    fn test_unsupported_display_string_skipped() {
        let mut module = Module::new("App");
        let mut factory = ProxyFactory::new(Box::new(EmptyStrategy), Placement::Target, StdRng::seed_from_u64(0));
        let original = TypeSignature::corlib_class("System", "Uri");
        let proxy = factory.proxy_info(&mut module, &original).ty;

        let def = module.type_def(proxy);
        assert!(!def
            .custom_attributes
            .iter()
            .any(|a| is_attribute(a, "System.Diagnostics", "DebuggerDisplayAttribute")));
        assert!(def.properties.is_empty());
    }

    #[test]
    fn test_reference_type_display_shows_no_members() {
        let mut module = Module::new("App");
        let mut factory = ProxyFactory::new(Box::new(EmptyStrategy), Placement::Target, StdRng::seed_from_u64(0));
        let proxy = factory.proxy_info(&mut module, &TypeSignature::String).ty;

        let def = module.type_def(proxy);
        let type_proxies = def
            .custom_attributes
            .iter()
            .filter(|a| is_attribute(a, "System.Diagnostics", "DebuggerTypeProxyAttribute"))
            .count();
        assert_eq!(type_proxies, 1);

        assert_eq!(def.nested_types.len(), 1);
        let display_type = module.type_def(def.nested_types[0]);
        assert_eq!(display_type.name, DISPLAY_TYPE_NAME);
        assert!(display_type.fields.is_empty());
        assert!(display_type.properties.is_empty());
    }
}
