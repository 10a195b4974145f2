//! Veil Engine
//!
//! Rewrites a managed module so that local variables render fabricated or
//! hostile information in a debugger's variable view:
//!
//! - [`factory`]: synthesizes a proxy type per original type signature
//! - [`strategy`]: decides what the debugger sees for a proxy
//! - [`rewrite`]: boxes stores and unboxes loads of proxied locals
//! - [`obfuscation`]: drives the whole pass over a module
//! - [`embed`]: moves the proxies into a compressed embedded module

#![warn(rust_2018_idioms)]

pub mod annotate;
pub mod cache;
pub mod embed;
pub mod error;
pub mod factory;
pub mod homoglyph;
pub mod known;
pub mod obfuscation;
pub mod options;
pub mod rewrite;
pub mod strategy;
pub mod synth;

pub use cache::{ProxyTypeCache, ProxyTypeInfo};
pub use embed::{load_embedded_module, EMBEDDED_RESOLVER_METHOD, RESOLVE_HANDLER_METHOD};
pub use error::VeilError;
pub use factory::{Placement, ProxyContext, ProxyFactory};
pub use homoglyph::apply_homoglyphs;
pub use obfuscation::{obfuscate, obfuscate_module, ObfuscationReport};
pub use options::ObfuscationOptions;
pub use rewrite::RewriteStats;
pub use strategy::{DisplayStrategy, StrategyKind};
