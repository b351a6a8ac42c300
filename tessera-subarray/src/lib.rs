//! Multi-range N-D subarrays and the budget-driven subarray partitioner.
//!
//! A [`Subarray`] selects a union of per-dimension 1-D range lists over a
//! typed [`Domain`]; the cross product of those lists enumerates N-D
//! ranges in the order given by the [`Layout`]. The
//! [`SubarrayPartitioner`] walks that enumeration and yields successive
//! partitions whose estimated result size fits per-attribute and memory
//! budgets, splitting ranges where necessary. Size estimates come from an
//! external [`ResultSizeEstimator`].

pub use estimate::*;
pub use layout::Layout;
pub use partitioner::*;
pub use range::{DimRange, DimensionValue};
pub use subarray::{Dimension, Domain, Subarray};

mod estimate;
mod layout;
mod partitioner;
mod range;
mod subarray;
