use std::collections::HashMap;
use std::ops::Add;

use crate::range::DimensionValue;
use crate::subarray::Subarray;

/// Estimated result sizes in bytes for one attribute over a subarray.
/// `size_var` is zero for fixed-sized attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EstResultSize {
    pub size_fixed: u64,
    pub size_var: u64,
}

impl Add for EstResultSize {
    type Output = EstResultSize;

    fn add(self, rhs: EstResultSize) -> EstResultSize {
        EstResultSize {
            size_fixed: self.size_fixed.saturating_add(rhs.size_fixed),
            size_var: self.size_var.saturating_add(rhs.size_var),
        }
    }
}

/// Per-attribute byte budget a partition's estimated result must fit.
/// `size_var` is ignored for fixed-sized attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResultBudget {
    pub size_fixed: u64,
    pub size_var: u64,
}

/// Size oracle consulted by the partitioner, typically backed by the query
/// engine's fragment statistics.
pub trait ResultSizeEstimator<T: DimensionValue>: Send + Sync {
    fn est_result_size(&self, attr: &str, subarray: &Subarray<T>) -> EstResultSize;
}

/// Density-one estimator: bytes scale linearly with the selected cell
/// count. Attributes it does not know estimate to zero.
#[derive(Clone, Debug, Default)]
pub struct CellCountEstimator {
    attrs: HashMap<String, (u64, u64)>,
}

impl CellCountEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `attr` with its fixed and var-sized bytes-per-cell costs.
    pub fn with_attr(mut self, attr: &str, fixed_bytes: u64, var_bytes: u64) -> Self {
        self.attrs.insert(attr.to_string(), (fixed_bytes, var_bytes));
        self
    }
}

impl<T: DimensionValue> ResultSizeEstimator<T> for CellCountEstimator {
    fn est_result_size(&self, attr: &str, subarray: &Subarray<T>) -> EstResultSize {
        let Some(&(fixed, var)) = self.attrs.get(attr) else {
            return EstResultSize::default();
        };
        let cells = subarray.cell_extent();
        EstResultSize {
            size_fixed: (cells * fixed as f64).ceil() as u64,
            size_var: (cells * var as f64).ceil() as u64,
        }
    }
}
