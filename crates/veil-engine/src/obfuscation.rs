//! Obfuscation driver

use crate::annotate::annotate_type;
use crate::embed::embed_module;
use crate::error::VeilError;
use crate::factory::{Placement, ProxyFactory};
use crate::homoglyph::apply_homoglyphs;
use crate::options::ObfuscationOptions;
use crate::rewrite::{rewrite_method, RewriteStats};
use crate::strategy::StrategyKind;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use veil_metadata::{verify_module, Module};

/// Summary of one obfuscation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObfuscationReport {
    pub mode: StrategyKind,
    pub types_annotated: usize,
    pub methods_rewritten: usize,
    pub proxies_created: usize,
    pub stats: RewriteStats,
    /// Resource holding the proxies in dynamic mode
    pub embedded_resource: Option<String>,
}

/// Rewrite every method of `module` with proxies from `factory`.
///
/// Types are snapshotted first, so proxies the factory adds to the module are
/// never rewritten themselves.
pub fn obfuscate_module(module: &mut Module, factory: &mut ProxyFactory, annotate_types: bool) -> ObfuscationReport {
    let mut report = ObfuscationReport::default();
    let types = module.all_type_ids();

    if annotate_types {
        for &ty in &types {
            if annotate_type(factory, module, ty) {
                report.types_annotated += 1;
            }
        }
    }

    for &ty in &types {
        let methods = module.type_def(ty).methods.clone();
        for method in methods {
            let stats = rewrite_method(factory, module, method, annotate_types);
            if stats.locals_proxied > 0 {
                report.methods_rewritten += 1;
            }
            report.stats += stats;
        }
    }

    report.proxies_created = factory.cache().len();
    report
}

/// Apply the obfuscation described by `options` to `module`
pub fn obfuscate(module: &mut Module, options: &ObfuscationOptions) -> Result<ObfuscationReport, VeilError> {
    // Malformed input is rejected before anything is mutated
    verify_module(module)?;

    let rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let placement = if options.dynamic {
        let mut aux = Module::new(&apply_homoglyphs(&module.corlib_name));
        aux.corlib_name = module.corlib_name.clone();
        Placement::Embedded(aux)
    } else {
        Placement::Target
    };

    let mut factory = ProxyFactory::new(options.mode.create(), placement, rng);
    let mut report = obfuscate_module(module, &mut factory, options.annotate_types);
    report.mode = options.mode;

    if let Some(aux) = factory.into_embedded_module() {
        verify_module(&aux)?;
        report.embedded_resource = Some(embed_module(module, &aux)?);
    }
    verify_module(module)?;

    info!(
        "{}: {} locals proxied in {} methods, {} proxies ({} mode), {} types annotated",
        module.name,
        report.stats.locals_proxied,
        report.methods_rewritten,
        report.proxies_created,
        report.mode,
        report.types_annotated
    );
    Ok(report)
}
