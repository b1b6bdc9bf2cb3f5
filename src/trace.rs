//! Per-operation bookkeeping: the visited-node budget and the warnings collected along the way.
//!
//! A [Trace] belongs to whoever started the operation. Shared components (the image, the
//! volume, the index) never hold one, which is what lets several threads use the same image.

use crate::config::Config;
use crate::error::{Error, Result, Warning};

#[derive(Debug, Clone, Default)]
pub struct Trace {
    visited: u64,
    limit: Option<u64>,
    strict: bool,
    warnings: Vec<Warning>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// A trace carrying the strictness and node budget of `config`
    pub fn from_config(config: &Config) -> Self {
        Self {
            limit: config.node_limit,
            strict: config.strict,
            ..Default::default()
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn limit(mut self, nodes: u64) -> Self {
        self.limit = Some(nodes);
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Count one node read; fails once the budget is spent.
    pub fn visit(&mut self) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.visited >= limit {
                return Err(Error::BudgetExhausted { limit });
            }
        }
        self.visited += 1;
        Ok(())
    }

    /// How many nodes this operation has read so far
    pub fn visited(&self) -> u64 {
        self.visited
    }

    pub fn warn(&mut self, warning: Warning) {
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Decide what to do about a damaged node: in tolerant mode, node damage becomes a warning and
    /// the caller skips the node; in strict mode (or for any other kind of error) it is returned.
    pub fn tolerate(&mut self, error: Error) -> Result<()> {
        if self.strict || !error.is_node_damage() {
            return Err(error);
        }
        self.warn(Warning::from(&error));
        Ok(())
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }
}

#[test]
fn test_budget() {
    let mut trace = Trace::new().limit(2);
    assert!(trace.visit().is_ok());
    assert!(trace.visit().is_ok());
    assert!(matches!(
        trace.visit(),
        Err(Error::BudgetExhausted { limit: 2 })
    ));
    assert_eq!(trace.visited(), 2);
}

#[test]
fn test_tolerate() {
    use crate::ubifs::Location;

    let damage = || Error::BadMagic {
        loc: Location::new(5, 0),
        found: 0,
    };

    let mut trace = Trace::new();
    assert!(trace.tolerate(damage()).is_ok());
    assert!(trace.tolerate(Error::UnsupportedCodec(7)).is_err());
    assert_eq!(trace.warnings().len(), 1);
    assert_eq!(trace.take_warnings()[0].loc, Some(Location::new(5, 0)));
    assert!(trace.warnings().is_empty());

    let mut strict = Trace::new().strict(true);
    assert!(strict.tolerate(damage()).is_err());
    assert!(strict.warnings().is_empty());
}
