//! Proxy type factory
//!
//! Synthesizes, for an original type signature, a proxy type that wraps one
//! value of that type:
//!
//! ```text
//! [DebuggerDisplay(...)]                       // strategy
//! public sealed class <Name> {
//!     [CompilerGenerated, DebuggerBrowsable(Never)]
//!     private readonly T <0this>k__BackingField;
//!     public .ctor(T value);
//!     public static implicit operator <Name>(T value);   // box
//!     public static implicit operator T(<Name> proxy);   // unbox
//!     ...                                        // strategy
//! }
//! ```
//!
//! Proxies of value types are value types themselves. Proxies are placed
//! either in the rewritten module or in a separate module that is later
//! embedded into it; [`ProxyContext`] hides the difference from strategies.

use crate::cache::{ProxyTypeCache, ProxyTypeInfo};
use crate::homoglyph::apply_homoglyphs;
use crate::known::KnownMembers;
use crate::strategy::DisplayStrategy;
use crate::synth::{self, SyntheticValue};
use rand::rngs::StdRng;
use tracing::debug;
use veil_metadata::module::{field_attributes, method_attributes, type_attributes};
use veil_metadata::{
    FieldDef, FieldId, FieldRef, HasCustomAttribute, MethodBody, MethodDef, MethodId, MethodRef,
    MethodSignature, Module, Opcode, Operand, PropertyDef, PropertyId, TypeDef, TypeDefId,
    TypeDefOrRef, TypeSignature,
};

/// Name of the field holding the wrapped value
pub const WRAPPED_FIELD_NAME: &str = "<0this>k__BackingField";

/// Name of both conversion operators
pub const CONVERSION_OPERATOR_NAME: &str = "op_Implicit";

/// Name of the synthetic property strategies show through `{Display}`
pub const DISPLAY_PROPERTY_NAME: &str = "Display";

const CONSTRUCTOR_ATTRIBUTES: u32 = method_attributes::PUBLIC
    | method_attributes::HIDE_BY_SIG
    | method_attributes::SPECIAL_NAME
    | method_attributes::RT_SPECIAL_NAME;

const OPERATOR_ATTRIBUTES: u32 = method_attributes::PUBLIC
    | method_attributes::STATIC
    | method_attributes::HIDE_BY_SIG
    | method_attributes::SPECIAL_NAME;

/// Where synthesized proxies are placed
#[derive(Debug)]
pub enum Placement {
    /// Next to the code that uses them
    Target,
    /// In a separate module, referenced by name from the target
    Embedded(Module),
}

/// Everything a strategy may touch while decorating one proxy
pub struct ProxyContext<'a> {
    /// Module the proxy is declared in
    pub home: &'a mut Module,
    /// Module declaring the original types, when it is not `home`
    source: Option<&'a Module>,
    pub known: &'a KnownMembers,
    pub rng: &'a mut StdRng,
}

impl<'a> ProxyContext<'a> {
    /// Context for proxies placed in the module they serve
    pub fn in_place(home: &'a mut Module, known: &'a KnownMembers, rng: &'a mut StdRng) -> Self {
        Self {
            home,
            source: None,
            known,
            rng,
        }
    }

    /// Context for proxies placed in `home`, serving `source`
    pub fn embedded(
        home: &'a mut Module,
        source: &'a Module,
        known: &'a KnownMembers,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            home,
            source: Some(source),
            known,
            rng,
        }
    }

    /// Module that declares the original types
    pub fn source(&self) -> &Module {
        self.source.unwrap_or(&*self.home)
    }

    pub fn is_embedded(&self) -> bool {
        self.source.is_some()
    }

    /// Express a signature of the source module in terms of the home module
    pub fn import(&self, ty: &TypeSignature) -> TypeSignature {
        match self.source {
            Some(source) => import_signature(source, ty),
            None => ty.clone(),
        }
    }

    pub fn import_method_signature(&self, signature: &MethodSignature) -> MethodSignature {
        match self.source {
            Some(source) => import_method_signature(source, signature),
            None => signature.clone(),
        }
    }

    /// Reference from the home module to a field of the source module
    pub fn field_ref(&self, id: FieldId) -> FieldRef {
        match self.source {
            Some(source) => {
                let def = source.field(id);
                FieldRef::Member {
                    parent: import_signature(source, &source.signature_of(def.declaring_type)),
                    name: def.name.clone(),
                    field_type: import_signature(source, &def.field_type),
                }
            }
            None => FieldRef::Def(id),
        }
    }

    /// Reference from the home module to a method of the source module
    pub fn method_ref(&self, id: MethodId) -> MethodRef {
        match self.source {
            Some(source) => {
                let def = source.method(id);
                MethodRef::member(
                    import_signature(source, &source.signature_of(def.declaring_type)),
                    &def.name,
                    import_method_signature(source, &def.signature),
                )
            }
            None => MethodRef::Def(id),
        }
    }

    /// Declaration of a named value or class type behind `original`, ignoring
    /// custom modifiers
    pub fn resolve_original(&self, original: &TypeSignature) -> Option<TypeDefId> {
        let mut ty = original;
        while let TypeSignature::ModReq { base, .. } | TypeSignature::ModOpt { base, .. } = ty {
            ty = &**base;
        }
        match ty {
            TypeSignature::ValueType(_) | TypeSignature::Class(_) => {
                self.source().resolve_signature(ty)
            }
            _ => None,
        }
    }

    pub fn typical_value(&mut self, ty: &TypeSignature) -> Option<SyntheticValue> {
        synth::typical_value(ty, &mut *self.rng)
    }

    /// Append the load of a fresh typical value of `ty`; `false` when it has no constant form
    pub fn emit_typical(&mut self, body: &mut MethodBody, ty: &TypeSignature) -> bool {
        let value = self.typical_value(ty);
        synth::emit_typical(body, ty, value.as_ref())
    }

    /// The field holding the wrapped value
    pub fn wrapped_field(&self, proxy: TypeDefId) -> Option<FieldId> {
        self.home.find_field(proxy, WRAPPED_FIELD_NAME)
    }

    pub fn instance_constructor(&self, ty: TypeDefId) -> Option<MethodId> {
        self.home
            .type_def(ty)
            .methods
            .iter()
            .copied()
            .find(|&m| self.home.method(m).is_instance_constructor())
    }

    /// Attach `[DebuggerDisplay(value)]`; `None` leaves the type alone
    pub fn add_display_string(&mut self, ty: TypeDefId, value: Option<&str>) {
        if let Some(value) = value {
            let attribute = self.known.display(value);
            self.home.type_def_mut(ty).custom_attributes.push(attribute);
        }
    }

    pub fn mark_never_browsable(&mut self, owner: HasCustomAttribute) {
        let attribute = self.known.never_browsable();
        self.home.custom_attributes_mut(owner).push(attribute);
    }

    pub fn mark_compiler_generated(&mut self, owner: HasCustomAttribute) {
        let attribute = self.known.compiler_generated();
        self.home.custom_attributes_mut(owner).push(attribute);
    }

    /// Add a read-only instance property with a bodiless `get_<name>` getter
    pub fn add_getter_property(
        &mut self,
        owner: TypeDefId,
        name: &str,
        property_type: TypeSignature,
        getter_attributes: u32,
    ) -> (PropertyId, MethodId) {
        let getter = self.home.add_method(
            owner,
            MethodDef::new(
                &format!("get_{}", name),
                getter_attributes,
                MethodSignature::new_instance(property_type.clone(), vec![]),
            ),
        );
        let mut property = PropertyDef::new(name, property_type);
        property.getter = Some(getter);
        let property = self.home.add_property(owner, property);
        (property, getter)
    }

    /// Show a fabricated value for `original`.
    ///
    /// Primitive kinds get a hidden `Display` property returning a synthetic
    /// value, shown through `{Display}`; other types get a literal display
    /// string when one can be formatted.
    pub fn add_random_display_string(&mut self, original: &TypeSignature, proxy: TypeDefId) {
        let value = self.typical_value(original);
        if synth::has_display_property(original) {
            let mut body = MethodBody::new();
            if synth::emit_typical(&mut body, original, value.as_ref()) {
                body.emit_op(Opcode::Ret);
                let (property, getter) = self.add_getter_property(
                    proxy,
                    DISPLAY_PROPERTY_NAME,
                    original.clone(),
                    method_attributes::PUBLIC,
                );
                self.home.method_mut(getter).body = Some(body);

                self.mark_never_browsable(HasCustomAttribute::Property(property));
                self.add_display_string(proxy, Some(&format!("{{{}}}", DISPLAY_PROPERTY_NAME)));
                return;
            }
        }
        let display = synth::format_display(&*self.home, original, value.as_ref());
        self.add_display_string(proxy, display.as_deref());
    }
}

fn import_type_ref(source: &Module, tdr: &TypeDefOrRef) -> TypeDefOrRef {
    match tdr {
        TypeDefOrRef::Def(id) if source.contains_type(*id) => {
            TypeDefOrRef::Ref(source.external_reference(*id))
        }
        TypeDefOrRef::Ref(r) if r.scope == veil_metadata::ResolutionScope::Module => {
            let mut r = r.clone();
            r.scope = veil_metadata::ResolutionScope::Assembly(source.name.clone());
            TypeDefOrRef::Ref(r)
        }
        other => other.clone(),
    }
}

fn import_boxed(source: &Module, inner: &TypeSignature) -> Box<TypeSignature> {
    Box::new(import_signature(source, inner))
}

/// Rewrite definitions of `source` inside a signature into references by name
pub fn import_signature(source: &Module, ty: &TypeSignature) -> TypeSignature {
    match ty {
        TypeSignature::ValueType(tdr) => TypeSignature::ValueType(import_type_ref(source, tdr)),
        TypeSignature::Class(tdr) => TypeSignature::Class(import_type_ref(source, tdr)),
        TypeSignature::SzArray(inner) => TypeSignature::SzArray(import_boxed(source, inner)),
        TypeSignature::Array { element, rank } => TypeSignature::Array {
            element: import_boxed(source, element),
            rank: *rank,
        },
        TypeSignature::Ptr(inner) => TypeSignature::Ptr(import_boxed(source, inner)),
        TypeSignature::ByRef(inner) => TypeSignature::ByRef(import_boxed(source, inner)),
        TypeSignature::Pinned(inner) => TypeSignature::Pinned(import_boxed(source, inner)),
        TypeSignature::ModReq { modifier, base } => TypeSignature::ModReq {
            modifier: import_type_ref(source, modifier),
            base: import_boxed(source, base),
        },
        TypeSignature::ModOpt { modifier, base } => TypeSignature::ModOpt {
            modifier: import_type_ref(source, modifier),
            base: import_boxed(source, base),
        },
        TypeSignature::GenericInst { generic, args } => TypeSignature::GenericInst {
            generic: import_boxed(source, generic),
            args: args.iter().map(|arg| import_signature(source, arg)).collect(),
        },
        TypeSignature::FnPtr(signature) => {
            TypeSignature::FnPtr(Box::new(import_method_signature(source, signature)))
        }
        other => other.clone(),
    }
}

pub fn import_method_signature(source: &Module, signature: &MethodSignature) -> MethodSignature {
    MethodSignature {
        has_this: signature.has_this,
        return_type: import_signature(source, &signature.return_type),
        params: signature
            .params
            .iter()
            .map(|param| import_signature(source, param))
            .collect(),
    }
}

/// Creates proxies on demand and remembers them
pub struct ProxyFactory {
    strategy: Box<dyn DisplayStrategy>,
    cache: ProxyTypeCache,
    rng: StdRng,
    known: KnownMembers,
    embedded: Option<Module>,
}

impl ProxyFactory {
    pub fn new(strategy: Box<dyn DisplayStrategy>, placement: Placement, rng: StdRng) -> Self {
        let embedded = match placement {
            Placement::Target => None,
            Placement::Embedded(module) => Some(module),
        };
        Self {
            strategy,
            cache: ProxyTypeCache::new(),
            rng,
            known: KnownMembers::new(),
            embedded,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn known(&self) -> &KnownMembers {
        &self.known
    }

    pub fn cache(&self) -> &ProxyTypeCache {
        &self.cache
    }

    /// The module receiving proxies in embedded placement
    pub fn embedded_module(&self) -> Option<&Module> {
        self.embedded.as_ref()
    }

    pub fn into_embedded_module(self) -> Option<Module> {
        self.embedded
    }

    /// Proxy of `original`, a signature as seen from `target`.
    ///
    /// The first request synthesizes the proxy; later requests for a
    /// structurally equal signature return the same one.
    pub fn proxy_info(&mut self, target: &mut Module, original: &TypeSignature) -> &ProxyTypeInfo {
        let Self {
            strategy,
            cache,
            rng,
            known,
            embedded,
        } = self;

        cache.get_or_create(original, || {
            let mut cx = match embedded {
                Some(home) => ProxyContext::embedded(home, target, known, rng),
                None => ProxyContext::in_place(target, known, rng),
            };
            synthesize(&mut cx, &**strategy, original)
        })
    }
}

fn proxy_name(cx: &ProxyContext<'_>, original: &TypeSignature) -> (String, String) {
    let source = cx.source();
    let (namespace, full) = source
        .signature_name(original)
        .unwrap_or_else(|| (String::new(), original.to_string()));
    // Nested types keep only their own name; generic arguments stay attached
    let (head, args) = full.split_at(full.find('<').unwrap_or(full.len()));
    let name = format!("{}{}", head.rsplit('/').next().unwrap_or(head), args);

    let declared = source.resolve_signature(original).is_some();
    let name = if namespace.starts_with("System") && !declared {
        name
    } else {
        apply_homoglyphs(&name)
    };
    let name = unique_type_name(cx.home, &namespace, name);
    (namespace, name)
}

/// `name`, or `name` with the first free numeric suffix when the home module
/// already declares a top-level type of that name
fn unique_type_name(home: &Module, namespace: &str, name: String) -> String {
    if home.find_type(namespace, &name).is_none() {
        return name;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{}{}", name, suffix);
        if home.find_type(namespace, &candidate).is_none() {
            return candidate;
        }
        suffix += 1;
    }
}

fn synthesize(
    cx: &mut ProxyContext<'_>,
    strategy: &dyn DisplayStrategy,
    original: &TypeSignature,
) -> ProxyTypeInfo {
    let imported = cx.import(original);
    let is_value_type = imported.is_value_type();
    let (namespace, name) = proxy_name(cx, original);

    let mut attributes =
        type_attributes::PUBLIC | type_attributes::SEALED | type_attributes::BEFORE_FIELD_INIT;
    let base = if is_value_type {
        attributes |= type_attributes::SEQUENTIAL_LAYOUT;
        cx.known.value_type.clone()
    } else {
        cx.known.object_type.clone()
    };

    // Registered before the strategy runs so its members can refer to it
    let proxy = cx
        .home
        .add_type(TypeDef::new(&namespace, &name, attributes, Some(base)));
    let proxy_sig = cx.home.signature_of(proxy);

    let value_field = cx.home.add_field(
        proxy,
        FieldDef::new(
            WRAPPED_FIELD_NAME,
            field_attributes::PRIVATE | field_attributes::INIT_ONLY,
            imported.clone(),
        ),
    );
    cx.mark_compiler_generated(HasCustomAttribute::Field(value_field));
    cx.mark_never_browsable(HasCustomAttribute::Field(value_field));

    let ctor = add_constructor(cx, proxy, &imported, value_field, is_value_type);
    let box_method = add_box_method(cx, proxy, &proxy_sig, &imported, ctor, is_value_type);
    let unbox_method = add_unbox_method(cx, proxy, &proxy_sig, &imported, value_field);

    strategy.post_process(cx, &imported, proxy);

    debug!(
        "Synthesized {} proxy {} for {}",
        strategy.name(),
        cx.home.type_full_name(proxy),
        imported
    );

    if cx.is_embedded() {
        let reference = TypeDefOrRef::Ref(cx.home.external_reference(proxy));
        let signature = if is_value_type {
            TypeSignature::ValueType(reference)
        } else {
            TypeSignature::Class(reference)
        };
        ProxyTypeInfo {
            ty: proxy,
            box_method: MethodRef::member(
                signature.clone(),
                CONVERSION_OPERATOR_NAME,
                MethodSignature::new_static(signature.clone(), vec![original.clone()]),
            ),
            unbox_method: MethodRef::member(
                signature.clone(),
                CONVERSION_OPERATOR_NAME,
                MethodSignature::new_static(original.clone(), vec![signature.clone()]),
            ),
            signature,
        }
    } else {
        ProxyTypeInfo {
            ty: proxy,
            signature: proxy_sig,
            box_method: MethodRef::Def(box_method),
            unbox_method: MethodRef::Def(unbox_method),
        }
    }
}

/// `.ctor(T value) { this.<0this>k__BackingField = value; }`
fn add_constructor(
    cx: &mut ProxyContext<'_>,
    proxy: TypeDefId,
    original: &TypeSignature,
    value_field: FieldId,
    is_value_type: bool,
) -> MethodId {
    let mut body = MethodBody::new();
    if is_value_type {
        body.emit_op(Opcode::Ldarg0);
        body.emit(Opcode::Call, Operand::Method(cx.known.value_type_ctor.clone()));
    }
    body.emit_op(Opcode::Ldarg0);
    body.emit_op(Opcode::Ldarg1);
    body.emit(Opcode::Stfld, Operand::Field(FieldRef::Def(value_field)));
    body.emit_op(Opcode::Ret);

    cx.home.add_method(
        proxy,
        MethodDef::new(
            ".ctor",
            CONSTRUCTOR_ATTRIBUTES,
            MethodSignature::new_instance(TypeSignature::Void, vec![original.clone()]),
        )
        .with_body(body),
    )
}

/// `static implicit operator Proxy(T value) => new Proxy(value);`
fn add_box_method(
    cx: &mut ProxyContext<'_>,
    proxy: TypeDefId,
    proxy_sig: &TypeSignature,
    original: &TypeSignature,
    ctor: MethodId,
    is_value_type: bool,
) -> MethodId {
    let mut body = MethodBody::new();
    if is_value_type {
        // Value types are initialized in place through an explicit call
        let local = body.add_local(proxy_sig.clone());
        body.emit(Opcode::LdlocaS, Operand::Local(local));
        body.emit_op(Opcode::Ldarg0);
        body.emit(Opcode::Call, Operand::Method(MethodRef::Def(ctor)));
        body.emit_op(Opcode::Ldloc0);
    } else {
        body.emit_op(Opcode::Ldarg0);
        body.emit(Opcode::Newobj, Operand::Method(MethodRef::Def(ctor)));
    }
    body.emit_op(Opcode::Ret);

    cx.home.add_method(
        proxy,
        MethodDef::new(
            CONVERSION_OPERATOR_NAME,
            OPERATOR_ATTRIBUTES,
            MethodSignature::new_static(proxy_sig.clone(), vec![original.clone()]),
        )
        .with_body(body),
    )
}

/// `static implicit operator T(Proxy proxy) => proxy.<0this>k__BackingField;`
fn add_unbox_method(
    cx: &mut ProxyContext<'_>,
    proxy: TypeDefId,
    proxy_sig: &TypeSignature,
    original: &TypeSignature,
    value_field: FieldId,
) -> MethodId {
    let mut body = MethodBody::new();
    body.emit_op(Opcode::Ldarg0);
    body.emit(Opcode::Ldfld, Operand::Field(FieldRef::Def(value_field)));
    body.emit_op(Opcode::Ret);

    cx.home.add_method(
        proxy,
        MethodDef::new(
            CONVERSION_OPERATOR_NAME,
            OPERATOR_ATTRIBUTES,
            MethodSignature::new_static(original.clone(), vec![proxy_sig.clone()]),
        )
        .with_body(body),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::known::display_string;
    use crate::strategy::StrategyKind;
    use rand::SeedableRng;
    use veil_metadata::{verify_module, Evaluator, Value};

    fn factory(kind: StrategyKind) -> ProxyFactory {
        ProxyFactory::new(kind.create(), Placement::Target, StdRng::seed_from_u64(1))
    }

    fn point_module() -> (Module, TypeDefId) {
        let mut module = Module::new("App");
        let point = module.add_type(TypeDef::new(
            "App",
            "Point",
            type_attributes::PUBLIC | type_attributes::SEQUENTIAL_LAYOUT,
            Some(TypeSignature::corlib_class("System", "ValueType")),
        ));
        module.add_field(point, FieldDef::new("X", field_attributes::PUBLIC, TypeSignature::I4));
        (module, point)
    }

    #[test]
    fn test_proxy_shape() {
        let mut module = Module::new("App");
        let mut factory = factory(StrategyKind::Empty);
        let info = factory.proxy_info(&mut module, &TypeSignature::I4).clone();

        let def = module.type_def(info.ty);
        assert_eq!(def.namespace, "System");
        assert_eq!(def.name, "Int32");
        assert!(def.is_value_type());
        assert_eq!(def.attributes & type_attributes::LAYOUT_MASK, type_attributes::SEQUENTIAL_LAYOUT);
        assert!(def.attributes & type_attributes::SEALED != 0);

        let field = module.field(def.fields[0]);
        assert_eq!(field.name, WRAPPED_FIELD_NAME);
        assert_eq!(field.field_type, TypeSignature::I4);
        assert!(!field.is_public());
        assert_eq!(field.custom_attributes.len(), 2);

        let operators = def
            .methods
            .iter()
            .filter(|&&m| module.method(m).name == CONVERSION_OPERATOR_NAME)
            .count();
        assert_eq!(operators, 2);
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_declared_types_get_homoglyph_names() {
        let (mut module, point) = point_module();
        let original = module.signature_of(point);
        let mut factory = factory(StrategyKind::Mimic);
        let proxy = factory.proxy_info(&mut module, &original).ty;

        let def = module.type_def(proxy);
        assert_eq!(def.namespace, "App");
        assert_ne!(def.name, "Point");
        assert_eq!(def.name, apply_homoglyphs("Point"));
        assert!(def.is_value_type());
    }

    #[test]
    fn test_reference_type_proxy_round_trip() {
        let mut module = Module::new("App");
        let mut factory = factory(StrategyKind::Mimic);
        let info = factory.proxy_info(&mut module, &TypeSignature::String).clone();
        assert!(!module.type_def(info.ty).is_value_type());

        let mut eval = Evaluator::new(&module);
        let boxed = eval
            .invoke_ref(&info.box_method, vec![Value::String("secret".into())])
            .unwrap()
            .unwrap();
        assert!(matches!(boxed, Value::Object(_)));
        let unboxed = eval.invoke_ref(&info.unbox_method, vec![boxed]).unwrap();
        assert_eq!(unboxed, Some(Value::String("secret".into())));
    }

    #[test]
    fn test_value_type_proxy_round_trip() {
        let mut module = Module::new("App");
        let mut factory = factory(StrategyKind::Empty);
        let info = factory.proxy_info(&mut module, &TypeSignature::I8).clone();

        let mut eval = Evaluator::new(&module);
        let boxed = eval
            .invoke_ref(&info.box_method, vec![Value::I8(1234)])
            .unwrap()
            .unwrap();
        assert!(matches!(boxed, Value::Struct(_)));
        let unboxed = eval.invoke_ref(&info.unbox_method, vec![boxed]).unwrap();
        assert_eq!(unboxed, Some(Value::I8(1234)));
    }

    #[test]
    fn test_cached_per_signature() {
        let mut module = Module::new("App");
        let mut factory = factory(StrategyKind::Mimic);
        let first = factory.proxy_info(&mut module, &TypeSignature::Boolean).clone();
        let types = module.type_count();
        let second = factory.proxy_info(&mut module, &TypeSignature::Boolean).clone();

        assert_eq!(first, second);
        assert_eq!(module.type_count(), types);
        assert_eq!(factory.cache().len(), 1);
    }

    #[test]
    fn test_primitive_display_property() {
        let mut module = Module::new("App");
        let mut factory = factory(StrategyKind::Mimic);
        let proxy = factory.proxy_info(&mut module, &TypeSignature::I4).ty;

        let def = module.type_def(proxy);
        let display = def
            .custom_attributes
            .iter()
            .find_map(display_string)
            .map(str::to_string);
        assert_eq!(display.as_deref(), Some("{Display}"));

        let property = module.property(def.properties[0]);
        assert_eq!(property.name, DISPLAY_PROPERTY_NAME);
        assert_eq!(property.property_type, TypeSignature::I4);
        let getter = property.getter.unwrap();

        let this = factory_box(&module, proxy, Value::I4(5));
        let shown = Evaluator::new(&module).invoke(getter, vec![this]).unwrap();
        match shown {
            Some(Value::I4(v)) => assert!((0..100).contains(&v)),
            other => panic!("unexpected display value {:?}", other),
        }
    }

    fn factory_box(module: &Module, proxy: TypeDefId, value: Value) -> Value {
        use std::cell::RefCell;
        use std::rc::Rc;
        use veil_metadata::eval::{Pointer, PointerRoot};

        let box_method = module
            .type_def(proxy)
            .methods
            .iter()
            .copied()
            .find(|&m| {
                let def = module.method(m);
                def.name == CONVERSION_OPERATOR_NAME && def.signature.return_type == module.signature_of(proxy)
            })
            .unwrap();
        let boxed = Evaluator::new(module).invoke(box_method, vec![value]).unwrap().unwrap();
        Value::Ptr(Pointer {
            root: PointerRoot::Slot(Rc::new(RefCell::new(boxed))),
            path: Vec::new(),
        })
    }

    #[test]
    fn test_embedded_placement() {
        let (mut target, point) = point_module();
        let original = target.signature_of(point);
        let mut factory = ProxyFactory::new(
            StrategyKind::Mimic.create(),
            Placement::Embedded(Module::new("Aux")),
            StdRng::seed_from_u64(3),
        );
        let types_before = target.type_count();
        let info = factory.proxy_info(&mut target, &original).clone();

        assert_eq!(target.type_count(), types_before);
        let aux = factory.embedded_module().unwrap();
        let field = aux.field(aux.type_def(info.ty).fields[0]);
        assert!(matches!(
            &field.field_type,
            TypeSignature::ValueType(TypeDefOrRef::Ref(r)) if r.name == "Point"
        ));
        assert!(matches!(
            &info.signature,
            TypeSignature::ValueType(TypeDefOrRef::Ref(r))
                if r.scope == veil_metadata::ResolutionScope::Assembly("Aux".into())
        ));
        assert!(matches!(info.box_method, MethodRef::Member(_)));
        verify_module(aux).unwrap();
    }

    fn list_of(arg: TypeSignature) -> TypeSignature {
        TypeSignature::GenericInst {
            generic: Box::new(TypeSignature::corlib_class("System.Collections.Generic", "List`1")),
            args: vec![arg],
        }
    }

    #[test]
    fn test_generic_instantiations_get_distinct_proxies() {
        let mut module = Module::new("App");
        let mut factory = factory(StrategyKind::Empty);
        let ints = factory.proxy_info(&mut module, &list_of(TypeSignature::I4)).clone();
        let strings = factory.proxy_info(&mut module, &list_of(TypeSignature::String)).clone();

        assert_ne!(ints.ty, strings.ty);
        assert_ne!(ints.signature, strings.signature);
        assert_eq!(module.type_def(ints.ty).name, "List`1<System.Int32>");
        assert_eq!(module.type_def(strings.ty).name, "List`1<System.String>");
        assert_eq!(module.type_def(ints.ty).namespace, "System.Collections.Generic");
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_generic_instantiations_distinct_when_embedded() {
        let mut target = Module::new("App");
        let mut factory = ProxyFactory::new(
            StrategyKind::Empty.create(),
            Placement::Embedded(Module::new("Aux")),
            StdRng::seed_from_u64(3),
        );
        let ints = factory.proxy_info(&mut target, &list_of(TypeSignature::I4)).clone();
        let strings = factory.proxy_info(&mut target, &list_of(TypeSignature::String)).clone();

        assert_ne!(ints.signature, strings.signature);
        assert_ne!(ints.box_method, strings.box_method);
        let aux = factory.embedded_module().unwrap();
        assert_ne!(aux.type_def(ints.ty).name, aux.type_def(strings.ty).name);
    }

    #[test]
    fn test_proxy_never_reuses_an_existing_type_name() {
        let mut module = Module::new("App");
        let original = module.add_type(TypeDef::new(
            "App",
            "Xyz",
            type_attributes::PUBLIC,
            Some(TypeSignature::Object),
        ));
        assert_eq!(apply_homoglyphs("Xyz"), "Xyz");

        let signature = module.signature_of(original);
        let mut factory = factory(StrategyKind::Empty);
        let proxy = factory.proxy_info(&mut module, &signature).ty;

        assert_ne!(proxy, original);
        assert_eq!(module.type_def(proxy).name, "Xyz1");
        assert_eq!(module.find_type("App", "Xyz"), Some(original));
    }
}
