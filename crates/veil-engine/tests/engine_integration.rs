//! End-to-end tests: build a module, obfuscate it and run it again

use rand::rngs::StdRng;
use rand::SeedableRng;
use veil_engine::known::is_attribute;
use veil_engine::strategy::CRASH_MESSAGE;
use veil_engine::synth::PEEPING_MESSAGE;
use veil_engine::{
    apply_homoglyphs, load_embedded_module, obfuscate, ObfuscationOptions, Placement, ProxyFactory,
    StrategyKind, VeilError,
};
use veil_metadata::module::{field_attributes, method_attributes, type_attributes};
use veil_metadata::{
    verify_module, EvalError, Evaluator, FieldDef, FieldRef, MethodBody, MethodDef, MethodId, MethodRef,
    MethodSignature, Module, Opcode, Operand, PropertyDef, ResolutionScope, TypeDef, TypeDefId,
    TypeDefOrRef, TypeSignature, Value,
};

struct Shop {
    module: Module,
    customer: TypeDefId,
    run: MethodId,
    name: MethodId,
}

/// ```text
/// class Customer { public string Name; public int Visits { set; } ... }
/// struct Point { public int X; }
/// static int Program.Run() {
///     Customer c = new Customer("ann"); Point p; p.X = 5;
///     int total = p.X; total += 10; string label = c.Name; return total;
/// }
/// static string Program.Name() { Customer c = new Customer("ann"); return c.Name; }
/// ```
fn build_shop() -> Shop {
    let mut module = Module::new("Shop");

    let customer = module.add_type(TypeDef::new(
        "Shop",
        "Customer",
        type_attributes::PUBLIC,
        Some(TypeSignature::Object),
    ));
    let name_field = module.add_field(
        customer,
        FieldDef::new("Name", field_attributes::PUBLIC, TypeSignature::String),
    );
    let visits = module.add_field(
        customer,
        FieldDef::new("Visits", field_attributes::PUBLIC, TypeSignature::I4),
    );

    let mut ctor_body = MethodBody::new();
    ctor_body.emit_op(Opcode::Ldarg0);
    ctor_body.emit_op(Opcode::Ldarg1);
    ctor_body.emit(Opcode::Stfld, Operand::Field(FieldRef::Def(name_field)));
    ctor_body.emit_op(Opcode::Ret);
    let ctor = module.add_method(
        customer,
        MethodDef::new(
            ".ctor",
            method_attributes::PUBLIC | method_attributes::SPECIAL_NAME | method_attributes::RT_SPECIAL_NAME,
            MethodSignature::new_instance(TypeSignature::Void, vec![TypeSignature::String]),
        )
        .with_body(ctor_body),
    );

    let mut setter_body = MethodBody::new();
    setter_body.emit_op(Opcode::Ldarg0);
    setter_body.emit_op(Opcode::Ldarg1);
    setter_body.emit(Opcode::Stfld, Operand::Field(FieldRef::Def(visits)));
    setter_body.emit_op(Opcode::Ret);
    let setter = module.add_method(
        customer,
        MethodDef::new(
            "set_Visits",
            method_attributes::PUBLIC | method_attributes::SPECIAL_NAME | method_attributes::HIDE_BY_SIG,
            MethodSignature::new_instance(TypeSignature::Void, vec![TypeSignature::I4]),
        )
        .with_body(setter_body),
    );
    let mut property = PropertyDef::new("Visits", TypeSignature::I4);
    property.setter = Some(setter);
    module.add_property(customer, property);

    let point = module.add_type(TypeDef::new(
        "Shop",
        "Point",
        type_attributes::PUBLIC | type_attributes::SEQUENTIAL_LAYOUT,
        Some(TypeSignature::corlib_class("System", "ValueType")),
    ));
    let x = module.add_field(point, FieldDef::new("X", field_attributes::PUBLIC, TypeSignature::I4));

    let program = module.add_type(TypeDef::new(
        "Shop",
        "Program",
        type_attributes::PUBLIC | type_attributes::ABSTRACT | type_attributes::SEALED,
        Some(TypeSignature::Object),
    ));
    let customer_sig = module.signature_of(customer);

    let mut body = MethodBody::new();
    body.add_local(customer_sig.clone());
    body.add_local(module.signature_of(point));
    body.add_local(TypeSignature::I4);
    body.add_local(TypeSignature::String);
    body.emit(Opcode::Ldstr, Operand::String("ann".into()));
    body.emit(Opcode::Newobj, Operand::Method(MethodRef::Def(ctor)));
    body.emit_op(Opcode::Stloc0);
    body.emit(Opcode::LdlocaS, Operand::Local(1));
    body.emit_op(Opcode::LdcI4_5);
    body.emit(Opcode::Stfld, Operand::Field(FieldRef::Def(x)));
    body.emit(Opcode::LdlocaS, Operand::Local(1));
    body.emit(Opcode::Ldfld, Operand::Field(FieldRef::Def(x)));
    body.emit_op(Opcode::Stloc2);
    body.emit_op(Opcode::Ldloc2);
    body.emit(Opcode::LdcI4S, Operand::I32(10));
    body.emit_op(Opcode::Add);
    body.emit_op(Opcode::Stloc2);
    body.emit_op(Opcode::Ldloc0);
    body.emit(Opcode::Ldfld, Operand::Field(FieldRef::Def(name_field)));
    body.emit_op(Opcode::Stloc3);
    body.emit_op(Opcode::Ldloc2);
    body.emit_op(Opcode::Ret);
    let run = module.add_method(
        program,
        MethodDef::new(
            "Run",
            method_attributes::PUBLIC | method_attributes::STATIC,
            MethodSignature::new_static(TypeSignature::I4, vec![]),
        )
        .with_body(body),
    );

    let mut body = MethodBody::new();
    body.add_local(customer_sig);
    body.emit(Opcode::Ldstr, Operand::String("ann".into()));
    body.emit(Opcode::Newobj, Operand::Method(MethodRef::Def(ctor)));
    body.emit_op(Opcode::Stloc0);
    body.emit_op(Opcode::Ldloc0);
    body.emit(Opcode::Ldfld, Operand::Field(FieldRef::Def(name_field)));
    body.emit_op(Opcode::Ret);
    let name = module.add_method(
        program,
        MethodDef::new(
            "Name",
            method_attributes::PUBLIC | method_attributes::STATIC,
            MethodSignature::new_static(TypeSignature::String, vec![]),
        )
        .with_body(body),
    );

    Shop {
        module,
        customer,
        run,
        name,
    }
}

fn options(mode: StrategyKind) -> ObfuscationOptions {
    ObfuscationOptions {
        mode,
        seed: Some(11),
        ..ObfuscationOptions::default()
    }
}

fn run_shop(shop: &Shop) -> (Option<Value>, Option<Value>) {
    let mut eval = Evaluator::new(&shop.module);
    let total = eval.invoke(shop.run, vec![]).unwrap();
    let name = eval.invoke(shop.name, vec![]).unwrap();
    (total, name)
}

fn display_getter(module: &Module, proxy: TypeDefId) -> MethodId {
    module
        .type_def(proxy)
        .properties
        .iter()
        .map(|&p| module.property(p))
        .find(|p| p.name == "Display")
        .and_then(|p| p.getter)
        .unwrap()
}

#[test]
fn test_default_mode_preserves_behavior() {
    let mut shop = build_shop();
    let types_before = shop.module.type_count();

    let report = obfuscate(&mut shop.module, &options(StrategyKind::Mimic)).unwrap();
    assert_eq!(report.mode, StrategyKind::Mimic);
    assert_eq!(report.stats.locals_proxied, 4);
    assert_eq!(report.stats.locals_skipped_address_taken, 1);
    assert_eq!(report.stats.locals_skipped_annotated, 0);
    assert_eq!(report.methods_rewritten, 2);
    assert_eq!(report.proxies_created, 3);
    assert_eq!(report.embedded_resource, None);
    assert_eq!(shop.module.type_count(), types_before + 3);

    let run = shop.module.method(shop.run).body.as_ref().unwrap();
    assert_ne!(run.locals[0].ty, shop.module.signature_of(shop.customer));
    assert!(matches!(run.locals[1].ty, TypeSignature::ValueType(_)));
    assert_ne!(run.locals[2].ty, TypeSignature::I4);
    assert_ne!(run.locals[3].ty, TypeSignature::String);

    // Both methods share one proxy per type
    let name = shop.module.method(shop.name).body.as_ref().unwrap();
    assert_eq!(name.locals[0].ty, run.locals[0].ty);

    verify_module(&shop.module).unwrap();
    let (total, name) = run_shop(&shop);
    assert_eq!(total, Some(Value::I4(15)));
    assert_eq!(name, Some(Value::String("ann".into())));
}

#[test]
fn test_every_strategy_round_trips_values() {
    for mode in StrategyKind::ALL {
        let mut shop = build_shop();
        obfuscate(&mut shop.module, &options(mode)).unwrap();

        let (total, name) = run_shop(&shop);
        assert_eq!(total, Some(Value::I4(15)), "mode {}", mode);
        assert_eq!(name, Some(Value::String("ann".into())), "mode {}", mode);
    }
}

#[test]
fn test_annotate_types_skips_covered_locals() {
    let mut shop = build_shop();
    let opts = ObfuscationOptions {
        annotate_types: true,
        ..options(StrategyKind::Mimic)
    };

    let report = obfuscate(&mut shop.module, &opts).unwrap();
    assert_eq!(report.types_annotated, 1);
    assert_eq!(report.stats.locals_skipped_annotated, 2);
    assert_eq!(report.stats.locals_proxied, 2);
    assert_eq!(report.proxies_created, 3);

    let customer = shop.module.type_def(shop.customer);
    let type_proxies = customer
        .custom_attributes
        .iter()
        .filter(|a| is_attribute(a, "System.Diagnostics", "DebuggerTypeProxyAttribute"))
        .count();
    assert_eq!(type_proxies, 1);
    let name = shop.module.method(shop.name).body.as_ref().unwrap();
    assert_eq!(name.locals[0].ty, shop.module.signature_of(shop.customer));

    let (total, name) = run_shop(&shop);
    assert_eq!(total, Some(Value::I4(15)));
    assert_eq!(name, Some(Value::String("ann".into())));
}

#[test]
fn test_same_seed_same_output() {
    let mut first = build_shop();
    let mut second = build_shop();
    obfuscate(&mut first.module, &options(StrategyKind::Mimic)).unwrap();
    obfuscate(&mut second.module, &options(StrategyKind::Mimic)).unwrap();
    assert_eq!(first.module.encode(), second.module.encode());
}

#[test]
fn test_dynamic_mode_embeds_proxies() {
    let mut shop = build_shop();
    let opts = ObfuscationOptions {
        dynamic: true,
        ..options(StrategyKind::Empty)
    };

    let report = obfuscate(&mut shop.module, &opts).unwrap();
    let resource = apply_homoglyphs("mscorlib");
    assert_eq!(report.embedded_resource.as_deref(), Some(resource.as_str()));

    // Only `<Module>` was added to the target
    assert!(shop.module.find_type("Shop", &apply_homoglyphs("Customer")).is_none());
    let run = shop.module.method(shop.run).body.as_ref().unwrap();
    assert!(matches!(
        &run.locals[2].ty,
        TypeSignature::ValueType(TypeDefOrRef::Ref(r)) if r.scope == ResolutionScope::Assembly(resource.clone())
    ));

    let aux = load_embedded_module(&shop.module, &resource).unwrap();
    assert!(aux.find_type("Shop", &apply_homoglyphs("Customer")).is_some());
    assert!(aux.find_type("System", "Int32").is_some());
    assert!(aux.find_type("System", "String").is_some());
    verify_module(&aux).unwrap();
    verify_module(&shop.module).unwrap();
}

#[test]
fn test_crash_display_fails_fast() {
    let mut module = Module::new("App");
    let mut factory = ProxyFactory::new(
        StrategyKind::Crash.create(),
        Placement::Target,
        StdRng::seed_from_u64(0),
    );
    let info = factory.proxy_info(&mut module, &TypeSignature::String).clone();
    let getter = display_getter(&module, info.ty);

    let mut eval = Evaluator::new(&module);
    let boxed = eval
        .invoke_ref(&info.box_method, vec![Value::String("pin".into())])
        .unwrap()
        .unwrap();
    let err = eval.invoke(getter, vec![boxed]).unwrap_err();
    assert!(matches!(err, EvalError::FailFast(ref msg) if msg == CRASH_MESSAGE));
}

#[test]
fn test_recursion_display_overflows() {
    let mut module = Module::new("App");
    let mut factory = ProxyFactory::new(
        StrategyKind::InfiniteRecursion.create(),
        Placement::Target,
        StdRng::seed_from_u64(0),
    );
    let info = factory.proxy_info(&mut module, &TypeSignature::String).clone();
    let getter = display_getter(&module, info.ty);

    let mut eval = Evaluator::new(&module);
    let boxed = eval
        .invoke_ref(&info.box_method, vec![Value::String("pin".into())])
        .unwrap()
        .unwrap();
    let err = eval.invoke(getter, vec![boxed]).unwrap_err();
    assert!(matches!(err, EvalError::StackOverflow(_)));
}

#[test]
fn test_state_mutator_display_mutates_wrapped_object() {
    let mut shop = build_shop();
    let original = shop.module.signature_of(shop.customer);
    let mut factory = ProxyFactory::new(
        StrategyKind::StateMutator.create(),
        Placement::Target,
        StdRng::seed_from_u64(0),
    );
    let info = factory.proxy_info(&mut shop.module, &original).clone();
    let getter = display_getter(&shop.module, info.ty);
    let ctor = shop.module.find_method_by_name(shop.customer, ".ctor").unwrap();

    let mut eval = Evaluator::new(&shop.module);
    let customer = eval
        .construct(&MethodRef::Def(ctor), vec![Value::String("ann".into())])
        .unwrap();
    let boxed = eval.invoke_ref(&info.box_method, vec![customer.clone()]).unwrap().unwrap();

    // Converting back and forth alone leaves the object alone
    let unboxed = eval.invoke_ref(&info.unbox_method, vec![boxed.clone()]).unwrap();
    assert_eq!(unboxed, Some(customer.clone()));
    assert_eq!(customer.field("Name"), Some(Value::String("ann".into())));

    eval.invoke(getter, vec![boxed]).unwrap();
    assert_eq!(customer.field("Name"), Some(Value::String(PEEPING_MESSAGE.to_string())));
    let visits = customer.field("Visits").and_then(|v| v.as_i4()).unwrap();
    assert!((0..100).contains(&visits));
}

#[test]
fn test_encoded_output_decodes_and_runs() {
    let mut shop = build_shop();
    obfuscate(&mut shop.module, &options(StrategyKind::Empty)).unwrap();

    let decoded = Module::decode(&shop.module.encode()).unwrap();
    verify_module(&decoded).unwrap();
    let result = Evaluator::new(&decoded).invoke(shop.run, vec![]).unwrap();
    assert_eq!(result, Some(Value::I4(15)));
}

#[test]
fn test_malformed_input_rejected_before_mutation() {
    let mut shop = build_shop();
    let body = shop.module.method_mut(shop.run).body.as_mut().unwrap();
    let locals = body.locals.len() as u16;
    body.instructions.insert(0, Opcode::Ldloc, Operand::Local(locals));
    let types = shop.module.type_count();
    let before = shop.module.encode();

    let err = obfuscate(&mut shop.module, &options(StrategyKind::Mimic)).unwrap_err();
    assert!(matches!(err, VeilError::Verify(_)));
    assert_eq!(shop.module.type_count(), types);
    assert_eq!(shop.module.encode(), before);
}
