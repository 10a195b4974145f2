//! Dynamic embedding
//!
//! In dynamic mode proxies live in an auxiliary module. The auxiliary module
//! is compressed into a manifest resource of the target. Two methods are
//! emitted into `<Module>`: an assembly-resolve handler that inflates and
//! loads the resource when the runtime asks for the auxiliary module, and a
//! bootstrap that subscribes the handler. The bootstrap runs first in the
//! module initializer, so the target needs no support assembly.

use crate::error::VeilError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::debug;
use veil_metadata::module::{method_attributes, resource_attributes};
use veil_metadata::types::{ResolutionScope, TypeReference};
use veil_metadata::{
    MethodBody, MethodDef, MethodId, MethodRef, MethodSignature, Module, Opcode, Operand,
    TypeDefOrRef, TypeSignature,
};

/// Bootstrap method added to `<Module>`
pub const EMBEDDED_RESOLVER_METHOD: &str = "InitializeEmbeddedResolver";

/// Assembly-resolve handler added to `<Module>`
pub const RESOLVE_HANDLER_METHOD: &str = "ResolveEmbeddedAssembly";

/// Assembly declaring the deflate stream types
const COMPRESSION_ASSEMBLY: &str = "System";

/// `System.IO.Compression.CompressionMode.Decompress`
const DECOMPRESS: i32 = 0;

fn corlib(namespace: &str, name: &str) -> TypeSignature {
    TypeSignature::corlib_class(namespace, name)
}

fn compression(name: &str, value_type: bool) -> TypeSignature {
    let reference = TypeDefOrRef::Ref(TypeReference {
        scope: ResolutionScope::Assembly(COMPRESSION_ASSEMBLY.to_string()),
        namespace: Some("System.IO.Compression".to_string()),
        name: name.to_string(),
    });
    if value_type {
        TypeSignature::ValueType(reference)
    } else {
        TypeSignature::Class(reference)
    }
}

fn instance(parent: TypeSignature, name: &str, ret: TypeSignature, params: Vec<TypeSignature>) -> Operand {
    Operand::Method(MethodRef::member(parent, name, MethodSignature::new_instance(ret, params)))
}

fn static_call(parent: TypeSignature, name: &str, ret: TypeSignature, params: Vec<TypeSignature>) -> Operand {
    Operand::Method(MethodRef::member(parent, name, MethodSignature::new_static(ret, params)))
}

/// Embed `embedded` into `target` and hook up the bootstrap.
///
/// Returns the name of the created resource, which is the embedded module's
/// name.
pub fn embed_module(target: &mut Module, embedded: &Module) -> Result<String, VeilError> {
    let image = embedded.encode();
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&image)?;
    let data = encoder.finish()?;
    debug!(
        "Embedding {} ({} bytes, {} compressed)",
        embedded.name,
        image.len(),
        data.len()
    );

    let name = embedded.name.clone();
    target.add_resource(&name, resource_attributes::PUBLIC, data);

    let handler = add_resolve_handler(target, &name);
    let bootstrap = add_bootstrap(target, handler);
    let cctor = module_initializer(target);
    if let Some(body) = target.method_mut(cctor).body.as_mut() {
        body.instructions
            .insert(0, Opcode::Call, Operand::Method(MethodRef::Def(bootstrap)));
    }
    Ok(name)
}

/// ```text
/// static Assembly ResolveEmbeddedAssembly(object sender, ResolveEventArgs args) {
///     if (new AssemblyName(args.Name).Name != name) return null;
///     Stream resource = Assembly.GetExecutingAssembly().GetManifestResourceStream(name);
///     if (resource == null) return null;
///     MemoryStream image = new MemoryStream();
///     new DeflateStream(resource, CompressionMode.Decompress).CopyTo(image);
///     return Assembly.Load(image.ToArray());
/// }
/// ```
fn add_resolve_handler(target: &mut Module, resource: &str) -> MethodId {
    let assembly = corlib("System.Reflection", "Assembly");
    let assembly_name = corlib("System.Reflection", "AssemblyName");
    let stream = corlib("System.IO", "Stream");
    let memory_stream = corlib("System.IO", "MemoryStream");
    let deflate_stream = compression("DeflateStream", false);
    let bytes = TypeSignature::SzArray(Box::new(TypeSignature::U1));

    let mut body = MethodBody::new();
    let resource_local = body.add_local(stream.clone());
    let image_local = body.add_local(memory_stream.clone());

    body.emit_op(Opcode::Ldarg1);
    body.emit(
        Opcode::Callvirt,
        instance(corlib("System", "ResolveEventArgs"), "get_Name", TypeSignature::String, vec![]),
    );
    body.emit(
        Opcode::Newobj,
        instance(assembly_name.clone(), ".ctor", TypeSignature::Void, vec![TypeSignature::String]),
    );
    body.emit(
        Opcode::Callvirt,
        instance(assembly_name, "get_Name", TypeSignature::String, vec![]),
    );
    body.emit(Opcode::Ldstr, Operand::String(resource.to_string()));
    body.emit(
        Opcode::Call,
        static_call(
            TypeSignature::String,
            "op_Equality",
            TypeSignature::Boolean,
            vec![TypeSignature::String, TypeSignature::String],
        ),
    );
    let matched = body.emit(Opcode::Brtrue, Operand::None);
    body.emit_op(Opcode::Ldnull);
    body.emit_op(Opcode::Ret);

    let load = body.emit(
        Opcode::Call,
        static_call(assembly.clone(), "GetExecutingAssembly", assembly.clone(), vec![]),
    );
    body.emit(Opcode::Ldstr, Operand::String(resource.to_string()));
    body.emit(
        Opcode::Callvirt,
        instance(
            assembly.clone(),
            "GetManifestResourceStream",
            stream.clone(),
            vec![TypeSignature::String],
        ),
    );
    body.emit(Opcode::Stloc, Operand::Local(resource_local));
    body.emit(Opcode::Ldloc, Operand::Local(resource_local));
    let found = body.emit(Opcode::Brtrue, Operand::None);
    body.emit_op(Opcode::Ldnull);
    body.emit_op(Opcode::Ret);

    let inflate = body.emit(
        Opcode::Newobj,
        instance(memory_stream.clone(), ".ctor", TypeSignature::Void, vec![]),
    );
    body.emit(Opcode::Stloc, Operand::Local(image_local));
    body.emit(Opcode::Ldloc, Operand::Local(resource_local));
    body.emit(Opcode::LdcI4, Operand::I32(DECOMPRESS));
    body.emit(
        Opcode::Newobj,
        instance(
            deflate_stream,
            ".ctor",
            TypeSignature::Void,
            vec![stream.clone(), compression("CompressionMode", true)],
        ),
    );
    body.emit(Opcode::Ldloc, Operand::Local(image_local));
    body.emit(
        Opcode::Callvirt,
        instance(stream.clone(), "CopyTo", TypeSignature::Void, vec![stream]),
    );
    body.emit(Opcode::Ldloc, Operand::Local(image_local));
    body.emit(
        Opcode::Callvirt,
        instance(memory_stream, "ToArray", bytes.clone(), vec![]),
    );
    body.emit(
        Opcode::Call,
        static_call(assembly.clone(), "Load", assembly.clone(), vec![bytes]),
    );
    body.emit_op(Opcode::Ret);

    body.instructions.patch(matched, Operand::Label(load));
    body.instructions.patch(found, Operand::Label(inflate));

    let global = target.module_type_id();
    target.add_method(
        global,
        MethodDef::new(
            RESOLVE_HANDLER_METHOD,
            method_attributes::PRIVATE | method_attributes::STATIC | method_attributes::HIDE_BY_SIG,
            MethodSignature::new_static(
                assembly,
                vec![TypeSignature::Object, corlib("System", "ResolveEventArgs")],
            ),
        )
        .with_body(body),
    )
}

/// ```text
/// static void InitializeEmbeddedResolver() {
///     AppDomain.CurrentDomain.AssemblyResolve += ResolveEmbeddedAssembly;
/// }
/// ```
fn add_bootstrap(target: &mut Module, handler: MethodId) -> MethodId {
    let app_domain = corlib("System", "AppDomain");
    let handler_type = corlib("System", "ResolveEventHandler");

    let mut body = MethodBody::new();
    body.emit(
        Opcode::Call,
        static_call(app_domain.clone(), "get_CurrentDomain", app_domain.clone(), vec![]),
    );
    body.emit_op(Opcode::Ldnull);
    body.emit(Opcode::Ldftn, Operand::Method(MethodRef::Def(handler)));
    body.emit(
        Opcode::Newobj,
        instance(
            handler_type.clone(),
            ".ctor",
            TypeSignature::Void,
            vec![TypeSignature::Object, TypeSignature::I],
        ),
    );
    body.emit(
        Opcode::Callvirt,
        instance(app_domain, "add_AssemblyResolve", TypeSignature::Void, vec![handler_type]),
    );
    body.emit_op(Opcode::Ret);

    let global = target.module_type_id();
    target.add_method(
        global,
        MethodDef::new(
            EMBEDDED_RESOLVER_METHOD,
            method_attributes::PRIVATE | method_attributes::STATIC | method_attributes::HIDE_BY_SIG,
            MethodSignature::new_static(TypeSignature::Void, vec![]),
        )
        .with_body(body),
    )
}

/// Get or create `<Module>::.cctor`
fn module_initializer(target: &mut Module) -> MethodId {
    let global = target.module_type_id();
    if let Some(existing) = target.find_method_by_name(global, ".cctor") {
        let def = target.method_mut(existing);
        if def.body.is_none() {
            let mut body = MethodBody::new();
            body.emit_op(Opcode::Ret);
            def.body = Some(body);
        }
        return existing;
    }

    let mut body = MethodBody::new();
    body.emit_op(Opcode::Ret);
    target.add_method(
        global,
        MethodDef::new(
            ".cctor",
            method_attributes::PRIVATE
                | method_attributes::STATIC
                | method_attributes::HIDE_BY_SIG
                | method_attributes::SPECIAL_NAME
                | method_attributes::RT_SPECIAL_NAME,
            MethodSignature::new_static(TypeSignature::Void, vec![]),
        )
        .with_body(body),
    )
}

/// Inflate and decode the module embedded in `target` under `name`
pub fn load_embedded_module(target: &Module, name: &str) -> Result<Module, VeilError> {
    let resource = target
        .find_resource(name)
        .ok_or_else(|| VeilError::MissingResource(name.to_string()))?;

    let mut decoder = DeflateDecoder::new(&resource.data[..]);
    let mut image = Vec::new();
    decoder.read_to_end(&mut image)?;
    Ok(Module::decode(&image)?)
}
