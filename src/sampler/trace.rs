//! Posterior trace storage.
//!
//! A [`Trace`] is the immutable-after-creation product of one sampling call:
//! named sample arrays shaped `(chain, draw, entity dims...)` plus the
//! per-draw divergence indicator. Arrays are stored flat, row-major, with an
//! explicit dims/shape header so they stay self-describing when archived.

use indexmap::IndexMap;

/// One named sample array. `dims` always starts `["chain", "draw", ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleArray {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl SampleArray {
    pub fn new(dims: Vec<String>, shape: Vec<usize>, values: Vec<f64>) -> SampleArray {
        debug_assert_eq!(dims.len(), shape.len());
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        SampleArray {
            dims,
            shape,
            values,
        }
    }

    /// Number of scalar entities per draw (product of the entity dims).
    pub fn entity_len(&self) -> usize {
        self.shape.iter().skip(2).product::<usize>().max(1)
    }

    /// Value at `(chain, draw, entity)` with the entity axes flattened.
    pub fn at(&self, chain: usize, draw: usize, entity: usize) -> f64 {
        let draws = self.shape[1];
        self.values[(chain * draws + draw) * self.entity_len() + entity]
    }
}

/// Sampling output: exactly one per invocation.
#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: usize,
    pub draws: usize,
    pub vars: IndexMap<String, SampleArray>,
    /// Per-draw divergence indicator, chain-major, length `chains * draws`.
    pub diverging: Vec<bool>,
}

impl Trace {
    pub fn var(&self, name: &str) -> Option<&SampleArray> {
        self.vars.get(name)
    }

    /// Count of divergent transitions across all chains.
    pub fn divergences(&self) -> usize {
        self.diverging.iter().filter(|d| **d).count()
    }
}
