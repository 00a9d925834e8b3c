//! No-data handling.
//!
//! Sentinels come from three places: numeric values in the configuration,
//! string tokens in the configuration, and the no-data value declared by the
//! source raster. Tokens of categorical layers only mean something once the
//! category table exists, so a [`NoDataSpec`] has to be resolved against it
//! before it can be applied.

use rayon::prelude::*;

use crate::category::CategoryTable;
use crate::model::Raster;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoDataSpec {
    pub values: Vec<f64>,
    pub tokens: Vec<String>,
    /// Declared by the source raster band.
    pub declared: Option<f64>,
}

impl NoDataSpec {
    pub fn new(values: Vec<f64>, tokens: Vec<String>) -> Self {
        Self {
            values,
            tokens,
            declared: None,
        }
    }

    pub fn with_declared(mut self, declared: Option<f64>) -> Self {
        self.declared = declared.filter(|v| v.is_finite());
        self
    }

    /// Builds the final sentinel set.
    ///
    /// With a category table, tokens are translated to the ids the table
    /// assigned them. Without one, tokens that parse as numbers are used
    /// directly and the rest are dropped.
    pub fn resolve(&self, categories: Option<&CategoryTable>) -> NoDataSet {
        let mut set = NoDataSet::default();
        for value in self.values.iter().copied().chain(self.declared) {
            set.insert(value);
        }
        for token in &self.tokens {
            let resolved = match categories {
                Some(table) => table.id_of(token).map(f64::from),
                None => token.trim().parse::<f64>().ok(),
            };
            if let Some(value) = resolved {
                set.insert(value);
            }
        }
        set
    }

    /// Whether a raw attribute value is one of the tokens.
    pub fn matches_token(&self, raw: &str) -> bool {
        self.tokens.iter().any(|token| token == raw)
    }
}

/// Resolved sentinels, compared exactly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoDataSet {
    sentinels: Vec<f64>,
}

impl NoDataSet {
    pub fn from_values(values: &[f64]) -> Self {
        let mut set = Self::default();
        for &value in values {
            set.insert(value);
        }
        set
    }

    fn insert(&mut self, value: f64) {
        if !value.is_nan() && !self.sentinels.contains(&value) {
            self.sentinels.push(value);
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.sentinels.contains(&value)
    }

    pub fn is_empty(&self) -> bool {
        self.sentinels.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.sentinels
    }
}

/// Replaces every sentinel with NaN.
pub fn normalize(raw: &[f64], sentinels: &NoDataSet) -> Vec<f64> {
    raw.par_iter()
        .map(|&value| if sentinels.contains(value) { f64::NAN } else { value })
        .collect()
}

pub fn normalize_raster(mut raster: Raster, sentinels: &NoDataSet) -> Raster {
    if !sentinels.is_empty() {
        raster.values = normalize(&raster.values, sentinels);
    }
    raster
}
