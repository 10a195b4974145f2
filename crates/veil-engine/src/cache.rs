//! Proxy type cache
//!
//! One entry per distinct original type signature for the lifetime of a
//! factory. Signatures are keyed by structural equality, so `int32` seen in
//! two different methods maps to the same proxy.

use rustc_hash::FxHashMap;
use veil_metadata::{MethodRef, TypeDefId, TypeSignature};

/// A synthesized proxy type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTypeInfo {
    /// Definition in the module the proxy was placed in
    pub ty: TypeDefId,
    /// Signature of the proxy as seen from the rewritten module
    pub signature: TypeSignature,
    /// `op_Implicit(original) -> proxy`
    pub box_method: MethodRef,
    /// `op_Implicit(proxy) -> original`
    pub unbox_method: MethodRef,
}

/// Memo of synthesized proxies, keyed by original signature
#[derive(Debug, Default)]
pub struct ProxyTypeCache {
    entries: FxHashMap<TypeSignature, ProxyTypeInfo>,
}

impl ProxyTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the proxy of `original`, invoking `synthesize` on the first request only
    pub fn get_or_create<F>(&mut self, original: &TypeSignature, synthesize: F) -> &ProxyTypeInfo
    where
        F: FnOnce() -> ProxyTypeInfo,
    {
        self.entries
            .entry(original.clone())
            .or_insert_with(synthesize)
    }

    pub fn get(&self, original: &TypeSignature) -> Option<&ProxyTypeInfo> {
        self.entries.get(original)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TypeSignature, &ProxyTypeInfo)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u32) -> ProxyTypeInfo {
        let signature = TypeSignature::Class(veil_metadata::TypeDefOrRef::Def(TypeDefId(id)));
        ProxyTypeInfo {
            ty: TypeDefId(id),
            signature,
            box_method: MethodRef::Def(veil_metadata::MethodId(id * 2)),
            unbox_method: MethodRef::Def(veil_metadata::MethodId(id * 2 + 1)),
        }
    }

    #[test]
    fn test_synthesizes_once_per_signature() {
        let mut cache = ProxyTypeCache::new();
        let mut calls = 0;

        let first = cache
            .get_or_create(&TypeSignature::I4, || {
                calls += 1;
                info(1)
            })
            .clone();
        let second = cache
            .get_or_create(&TypeSignature::I4, || {
                calls += 1;
                info(2)
            })
            .clone();

        assert_eq!(calls, 1);
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_structural_keys() {
        let mut cache = ProxyTypeCache::new();
        let a = TypeSignature::corlib_value_type("System", "DateTime");
        let b = TypeSignature::corlib_value_type("System", "DateTime");
        cache.get_or_create(&a, || info(1));
        cache.get_or_create(&b, || info(2));
        cache.get_or_create(&TypeSignature::String, || info(3));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&b).map(|i| i.ty), Some(TypeDefId(1)));
        assert!(cache.get(&TypeSignature::Boolean).is_none());
        assert_eq!(cache.iter().count(), 2);
    }
}
