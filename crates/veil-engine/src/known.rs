//! Core library members referenced by synthesized code

use veil_metadata::{
    AttributeArgument, AttributeValue, CustomAttribute, MethodRef, MethodSignature, TypeSignature,
};

/// `DebuggerBrowsableState.Never`
pub const BROWSABLE_NEVER: i32 = 0;

fn ctor(parent: TypeSignature, params: Vec<TypeSignature>) -> MethodRef {
    MethodRef::member(parent, ".ctor", MethodSignature::new_instance(TypeSignature::Void, params))
}

/// References into the core library, built once per factory
#[derive(Debug, Clone)]
pub struct KnownMembers {
    pub object_type: TypeSignature,
    pub value_type: TypeSignature,
    pub type_type: TypeSignature,
    pub browsable_state_type: TypeSignature,
    /// `System.ValueType::.ctor()`
    pub value_type_ctor: MethodRef,
    pub compiler_generated_ctor: MethodRef,
    pub display_ctor: MethodRef,
    pub browsable_ctor: MethodRef,
    pub type_proxy_ctor: MethodRef,
    /// `System.Environment::FailFast(string)`
    pub fail_fast: MethodRef,
}

impl KnownMembers {
    pub fn new() -> Self {
        let type_type = TypeSignature::corlib_class("System", "Type");
        let browsable_state_type =
            TypeSignature::corlib_value_type("System.Diagnostics", "DebuggerBrowsableState");
        let value_type = TypeSignature::corlib_class("System", "ValueType");

        Self {
            object_type: TypeSignature::Object,
            value_type_ctor: ctor(value_type.clone(), vec![]),
            value_type,
            compiler_generated_ctor: ctor(
                TypeSignature::corlib_class(
                    "System.Runtime.CompilerServices",
                    "CompilerGeneratedAttribute",
                ),
                vec![],
            ),
            display_ctor: ctor(
                TypeSignature::corlib_class("System.Diagnostics", "DebuggerDisplayAttribute"),
                vec![TypeSignature::String],
            ),
            browsable_ctor: ctor(
                TypeSignature::corlib_class("System.Diagnostics", "DebuggerBrowsableAttribute"),
                vec![browsable_state_type.clone()],
            ),
            type_proxy_ctor: ctor(
                TypeSignature::corlib_class("System.Diagnostics", "DebuggerTypeProxyAttribute"),
                vec![type_type.clone()],
            ),
            fail_fast: MethodRef::member(
                TypeSignature::corlib_class("System", "Environment"),
                "FailFast",
                MethodSignature::new_static(TypeSignature::Void, vec![TypeSignature::String]),
            ),
            type_type,
            browsable_state_type,
        }
    }

    /// `[CompilerGenerated]`
    pub fn compiler_generated(&self) -> CustomAttribute {
        CustomAttribute {
            constructor: self.compiler_generated_ctor.clone(),
            args: Vec::new(),
        }
    }

    /// `[DebuggerBrowsable(DebuggerBrowsableState.Never)]`
    pub fn never_browsable(&self) -> CustomAttribute {
        CustomAttribute {
            constructor: self.browsable_ctor.clone(),
            args: vec![AttributeArgument {
                ty: self.browsable_state_type.clone(),
                value: AttributeValue::I4(BROWSABLE_NEVER),
            }],
        }
    }

    /// `[DebuggerDisplay(value)]`
    pub fn display(&self, value: &str) -> CustomAttribute {
        CustomAttribute {
            constructor: self.display_ctor.clone(),
            args: vec![AttributeArgument {
                ty: TypeSignature::String,
                value: AttributeValue::String(Some(value.to_string())),
            }],
        }
    }

    /// `[DebuggerTypeProxy(typeof(proxy))]`
    pub fn type_proxy(&self, proxy: TypeSignature) -> CustomAttribute {
        CustomAttribute {
            constructor: self.type_proxy_ctor.clone(),
            args: vec![AttributeArgument {
                ty: self.type_type.clone(),
                value: AttributeValue::Type(proxy),
            }],
        }
    }
}

impl Default for KnownMembers {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an attribute is an instance of the named core library attribute
pub fn is_attribute(attribute: &CustomAttribute, namespace: &str, name: &str) -> bool {
    attribute
        .attribute_type()
        .is_some_and(|ty| ty.is_corlib_type(namespace, name))
}

/// Display string of a `[DebuggerDisplay]` attribute
pub fn display_string(attribute: &CustomAttribute) -> Option<&str> {
    if !is_attribute(attribute, "System.Diagnostics", "DebuggerDisplayAttribute") {
        return None;
    }
    match attribute.args.first().map(|arg| &arg.value) {
        Some(AttributeValue::String(Some(value))) => Some(value),
        _ => None,
    }
}
