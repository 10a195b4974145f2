use super::DisplayStrategy;
use crate::factory::{ProxyContext, DISPLAY_PROPERTY_NAME};
use veil_metadata::module::method_attributes;
use veil_metadata::{HasCustomAttribute, MethodBody, MethodRef, Opcode, Operand, TypeDefId, TypeSignature};

/// Display property whose getter calls itself until the stack overflows
pub struct InfiniteRecursionStrategy;

impl DisplayStrategy for InfiniteRecursionStrategy {
    fn name(&self) -> &'static str {
        "stackoverflow"
    }

    fn post_process(&self, cx: &mut ProxyContext<'_>, _original: &TypeSignature, proxy: TypeDefId) {
        let (property, getter) = cx.add_getter_property(
            proxy,
            DISPLAY_PROPERTY_NAME,
            TypeSignature::String,
            method_attributes::PUBLIC,
        );

        let mut body = MethodBody::new();
        body.emit_op(Opcode::Ldarg0);
        body.emit(Opcode::Call, Operand::Method(MethodRef::Def(getter)));
        body.emit_op(Opcode::Ret);
        cx.home.method_mut(getter).body = Some(body);

        cx.mark_never_browsable(HasCustomAttribute::Property(property));
        cx.add_display_string(proxy, Some(&format!("{{{}}}", DISPLAY_PROPERTY_NAME)));
    }
}
