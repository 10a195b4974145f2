use super::DisplayStrategy;
use crate::factory::{ProxyContext, DISPLAY_PROPERTY_NAME};
use veil_metadata::module::method_attributes;
use veil_metadata::{HasCustomAttribute, MethodBody, Opcode, Operand, TypeDefId, TypeSignature};

/// Message passed to `Environment.FailFast`
pub const CRASH_MESSAGE: &str = "The CLR encountered an internal limitation.";

/// Display property whose evaluation terminates the debuggee
pub struct CrashStrategy;

impl DisplayStrategy for CrashStrategy {
    fn name(&self) -> &'static str {
        "failfast"
    }

    fn post_process(&self, cx: &mut ProxyContext<'_>, _original: &TypeSignature, proxy: TypeDefId) {
        let (property, getter) = cx.add_getter_property(
            proxy,
            DISPLAY_PROPERTY_NAME,
            TypeSignature::String,
            method_attributes::PUBLIC,
        );

        let mut body = MethodBody::new();
        body.emit(Opcode::Ldstr, Operand::String(CRASH_MESSAGE.to_string()));
        body.emit(Opcode::Call, Operand::Method(cx.known.fail_fast.clone()));
        body.emit_op(Opcode::Ldnull);
        body.emit_op(Opcode::Ret);
        cx.home.method_mut(getter).body = Some(body);

        cx.mark_never_browsable(HasCustomAttribute::Property(property));
        cx.add_display_string(proxy, Some(&format!("{{{}}}", DISPLAY_PROPERTY_NAME)));
    }
}
