//! Display strategies
//!
//! A strategy decides what the debugger shows for a proxy. It runs once per
//! proxy type, right after the wrapped field, constructor and conversion
//! operators were synthesized, and may append members and attributes.

mod crash;
mod empty;
mod mimic;
mod mutator;
mod recursion;

pub use crash::{CrashStrategy, CRASH_MESSAGE};
pub use empty::EmptyStrategy;
pub use mimic::MimicStrategy;
pub use mutator::StateMutatorStrategy;
pub use recursion::InfiniteRecursionStrategy;

use crate::error::VeilError;
use crate::factory::ProxyContext;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use veil_metadata::{TypeDefId, TypeSignature};

/// Hook appended to proxy type synthesis
pub trait DisplayStrategy {
    /// Mode name as accepted on the command line
    fn name(&self) -> &'static str;

    /// Decorate a freshly synthesized proxy of `original`.
    ///
    /// `original` is expressed in terms of the module the proxy lives in.
    /// Shapes the strategy cannot handle are left untouched.
    fn post_process(&self, cx: &mut ProxyContext<'_>, original: &TypeSignature, proxy: TypeDefId);
}

/// The closed set of display strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum StrategyKind {
    Empty,
    #[default]
    Mimic,
    Crash,
    InfiniteRecursion,
    StateMutator,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Empty,
        StrategyKind::Mimic,
        StrategyKind::Crash,
        StrategyKind::InfiniteRecursion,
        StrategyKind::StateMutator,
    ];

    /// Mode name as accepted on the command line
    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::Empty => "empty",
            StrategyKind::Mimic => "mimic",
            StrategyKind::Crash => "failfast",
            StrategyKind::InfiniteRecursion => "stackoverflow",
            StrategyKind::StateMutator => "statechanger",
        }
    }

    /// Instantiate the strategy
    pub fn create(self) -> Box<dyn DisplayStrategy> {
        match self {
            StrategyKind::Empty => Box::new(EmptyStrategy),
            StrategyKind::Mimic => Box::new(MimicStrategy),
            StrategyKind::Crash => Box::new(CrashStrategy),
            StrategyKind::InfiniteRecursion => Box::new(InfiniteRecursionStrategy),
            StrategyKind::StateMutator => Box::new(StateMutatorStrategy),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = VeilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == lower)
            .ok_or_else(|| VeilError::UnknownMode(s.to_string()))
    }
}

impl TryFrom<String> for StrategyKind {
    type Error = VeilError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode_names() {
        assert_eq!("empty".parse::<StrategyKind>().unwrap(), StrategyKind::Empty);
        assert_eq!("MIMIC".parse::<StrategyKind>().unwrap(), StrategyKind::Mimic);
        assert_eq!("FailFast".parse::<StrategyKind>().unwrap(), StrategyKind::Crash);
        assert_eq!(
            "stackoverflow".parse::<StrategyKind>().unwrap(),
            StrategyKind::InfiniteRecursion
        );
        assert_eq!(
            "statechanger".parse::<StrategyKind>().unwrap(),
            StrategyKind::StateMutator
        );
    }

    #[test]
    fn test_unknown_mode() {
        let err = "chaos".parse::<StrategyKind>().unwrap_err();
        assert!(matches!(err, VeilError::UnknownMode(ref m) if m == "chaos"));
    }

    #[test]
    fn test_default_is_mimic() {
        assert_eq!(StrategyKind::default(), StrategyKind::Mimic);
    }

    #[test]
    fn test_created_strategy_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.create().name(), kind.name());
        }
    }
}
