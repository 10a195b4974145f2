//! Method body rewriting
//!
//! Locals of proxied types are retyped to their proxy. Every load of such a
//! local is followed by a call to the unbox operator and every store is
//! preceded by a call to the box operator, so the code around them still sees
//! the original type.

use crate::annotate::covers_local;
use crate::cache::ProxyTypeInfo;
use crate::factory::ProxyFactory;
use rustc_hash::{FxHashMap, FxHashSet};
use std::ops::AddAssign;
use tracing::debug;
use veil_metadata::{MethodId, Module, Opcode, Operand, TypeSignature};

/// Counters collected while rewriting bodies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub locals_proxied: usize,
    pub locals_skipped_address_taken: usize,
    pub locals_skipped_annotated: usize,
    pub calls_inserted: usize,
}

impl RewriteStats {
    pub fn merge(&mut self, other: RewriteStats) {
        self.locals_proxied += other.locals_proxied;
        self.locals_skipped_address_taken += other.locals_skipped_address_taken;
        self.locals_skipped_annotated += other.locals_skipped_annotated;
        self.calls_inserted += other.calls_inserted;
    }
}

impl AddAssign for RewriteStats {
    fn add_assign(&mut self, other: RewriteStats) {
        self.merge(other);
    }
}

/// Whether a local of this type can be stored in a proxy.
///
/// Arrays, pointers, references, pinned locals, function pointers and open
/// generic types cannot.
pub fn is_proxyable(ty: &TypeSignature) -> bool {
    match ty {
        TypeSignature::Void
        | TypeSignature::TypedByRef
        | TypeSignature::SzArray(_)
        | TypeSignature::Array { .. }
        | TypeSignature::Ptr(_)
        | TypeSignature::ByRef(_)
        | TypeSignature::Pinned(_)
        | TypeSignature::FnPtr(_)
        | TypeSignature::Var(_)
        | TypeSignature::MVar(_) => false,
        TypeSignature::ModReq { base, .. } | TypeSignature::ModOpt { base, .. } => is_proxyable(base),
        TypeSignature::GenericInst { args, .. } => args.iter().all(is_closed),
        _ => true,
    }
}

fn is_closed(ty: &TypeSignature) -> bool {
    match ty {
        TypeSignature::Var(_) | TypeSignature::MVar(_) => false,
        TypeSignature::SzArray(inner)
        | TypeSignature::Array { element: inner, .. }
        | TypeSignature::Ptr(inner)
        | TypeSignature::ByRef(inner)
        | TypeSignature::Pinned(inner)
        | TypeSignature::ModReq { base: inner, .. }
        | TypeSignature::ModOpt { base: inner, .. } => is_closed(inner),
        TypeSignature::GenericInst { generic, args } => is_closed(generic) && args.iter().all(is_closed),
        TypeSignature::FnPtr(signature) => {
            is_closed(&signature.return_type) && signature.params.iter().all(is_closed)
        }
        _ => true,
    }
}

/// Rewrite every eligible local of one method body
pub fn rewrite_method(
    factory: &mut ProxyFactory,
    module: &mut Module,
    method: MethodId,
    annotate_types: bool,
) -> RewriteStats {
    let mut stats = RewriteStats::default();
    let Some(mut body) = module.method_mut(method).body.take() else {
        return stats;
    };
    let method_name = module.method(method).name.clone();

    // Scan
    let mut included = Vec::new();
    for (index, local) in body.locals.iter().enumerate() {
        if !is_proxyable(&local.ty) {
            continue;
        }
        if covers_local(module, &local.ty, annotate_types) {
            debug!("{}: local {} already covered by a type proxy", method_name, index);
            stats.locals_skipped_annotated += 1;
            continue;
        }
        included.push(index as u16);
    }

    // Exclude locals whose address escapes
    let address_taken: FxHashSet<u16> = body
        .instructions
        .iter()
        .filter(|instr| instr.opcode.is_ldloca())
        .filter_map(|instr| instr.local_index())
        .collect();
    included.retain(|index| {
        if address_taken.contains(index) {
            debug!("{}: local {} has its address taken", method_name, index);
            stats.locals_skipped_address_taken += 1;
            false
        } else {
            true
        }
    });

    if included.is_empty() {
        module.method_mut(method).body = Some(body);
        return stats;
    }

    let proxies: FxHashMap<u16, ProxyTypeInfo> = included
        .iter()
        .map(|&index| {
            let original = body.locals[index as usize].ty.clone();
            (index, factory.proxy_info(module, &original).clone())
        })
        .collect();

    // Rewrite
    body.instructions.expand_macros();
    let mut i = 0;
    while i < body.instructions.len() {
        let instr = &body.instructions[i];
        let opcode = instr.opcode;
        let Some(info) = instr.local_index().and_then(|index| proxies.get(&index)) else {
            i += 1;
            continue;
        };

        if opcode.is_ldloc() {
            body.instructions
                .insert_after(i, Opcode::Call, Operand::Method(info.unbox_method.clone()));
            stats.calls_inserted += 1;
            i += 2;
        } else if opcode.is_stloc() {
            body.instructions
                .insert_before(i, Opcode::Call, Operand::Method(info.box_method.clone()));
            stats.calls_inserted += 1;
            i += 2;
        } else {
            i += 1;
        }
    }

    // Retype
    for &index in &included {
        let info = &proxies[&index];
        debug!(
            "{}: local {} {} -> {}",
            method_name, index, body.locals[index as usize].ty, info.signature
        );
        body.locals[index as usize].ty = info.signature.clone();
    }
    stats.locals_proxied = included.len();

    body.instructions.optimize_macros();
    module.method_mut(method).body = Some(body);
    stats
}
