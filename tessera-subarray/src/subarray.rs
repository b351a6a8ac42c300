use std::sync::Arc;

use tessera_error::{tessera_bail, TesseraResult};

use crate::estimate::{EstResultSize, ResultSizeEstimator};
use crate::layout::Layout;
use crate::range::{DimRange, DimensionValue};

/// One dimension of an array domain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Dimension<T> {
    pub bounds: DimRange<T>,
    /// Space-tile extent, when the dimension is tiled.
    pub tile_extent: Option<T>,
}

impl<T: DimensionValue> Dimension<T> {
    pub fn new(bounds: DimRange<T>) -> Self {
        Self {
            bounds,
            tile_extent: None,
        }
    }

    pub fn with_tile_extent(mut self, extent: T) -> Self {
        self.tile_extent = Some(extent);
        self
    }
}

/// The N-D domain a subarray selects from. Every dimension shares the
/// element type `T`.
#[derive(Clone, Debug, PartialEq)]
pub struct Domain<T> {
    dims: Vec<Dimension<T>>,
}

impl<T: DimensionValue> Domain<T> {
    pub fn new(dims: Vec<Dimension<T>>) -> TesseraResult<Self> {
        if dims.is_empty() {
            tessera_bail!("a domain needs at least one dimension");
        }
        Ok(Self { dims })
    }

    pub fn dim_num(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, d: usize) -> &Dimension<T> {
        &self.dims[d]
    }
}

/// A multi-range N-D region: one non-empty list of 1-D ranges per
/// dimension, whose cross product enumerates N-D ranges in the order given
/// by the layout.
///
/// A fresh subarray selects the whole domain; the first range explicitly
/// added on a dimension replaces that implicit default.
#[derive(Clone, Debug, PartialEq)]
pub struct Subarray<T: DimensionValue> {
    domain: Arc<Domain<T>>,
    layout: Layout,
    ranges: Vec<Vec<DimRange<T>>>,
    is_default: Vec<bool>,
}

impl<T: DimensionValue> Subarray<T> {
    pub fn new(domain: Arc<Domain<T>>, layout: Layout) -> Self {
        let dim_num = domain.dim_num();
        let ranges = (0..dim_num).map(|d| vec![domain.dim(d).bounds]).collect();
        Self {
            domain,
            layout,
            ranges,
            is_default: vec![true; dim_num],
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn domain(&self) -> &Arc<Domain<T>> {
        &self.domain
    }

    pub fn dim_num(&self) -> usize {
        self.domain.dim_num()
    }

    pub fn dim_ranges(&self, d: usize) -> &[DimRange<T>] {
        &self.ranges[d]
    }

    pub fn range_num_per_dim(&self, d: usize) -> u64 {
        self.ranges[d].len() as u64
    }

    /// Add a 1-D range on `dim`.
    pub fn add_range(&mut self, dim: usize, range: DimRange<T>) -> TesseraResult<()> {
        if dim >= self.dim_num() {
            tessera_bail!("dimension index {dim} out of bounds");
        }
        if !self.domain.dim(dim).bounds.covers(&range) {
            tessera_bail!(
                "range [{:?}, {:?}] is outside the domain of dimension {dim}",
                range.low,
                range.high
            );
        }
        if self.is_default[dim] {
            self.ranges[dim] = vec![range];
            self.is_default[dim] = false;
        } else {
            if self.layout == Layout::GlobalOrder {
                tessera_bail!("global order supports a single range per dimension");
            }
            self.ranges[dim].push(range);
        }
        Ok(())
    }

    /// The total number of N-D ranges in the cross product.
    pub fn range_num(&self) -> u64 {
        self.ranges.iter().map(|r| r.len() as u64).product()
    }

    /// Dimensions from slowest- to fastest-varying under the layout.
    fn layout_order(&self) -> Vec<usize> {
        match self.layout {
            Layout::ColMajor => (0..self.dim_num()).rev().collect(),
            _ => (0..self.dim_num()).collect(),
        }
    }

    /// Per-dimension range indices of the N-D range at flattened `idx`.
    pub fn range_coords(&self, mut idx: u64) -> Vec<usize> {
        let order = self.layout_order();
        let mut coords = vec![0usize; self.dim_num()];
        for &d in order.iter().rev() {
            let n = self.ranges[d].len() as u64;
            coords[d] = (idx % n) as usize;
            idx /= n;
        }
        coords
    }

    /// The N-D range at flattened `idx`, one 1-D range per dimension.
    pub fn get_range(&self, idx: u64) -> TesseraResult<Vec<DimRange<T>>> {
        if idx >= self.range_num() {
            tessera_bail!("range index {idx} out of bounds");
        }
        Ok(self
            .range_coords(idx)
            .iter()
            .enumerate()
            .map(|(d, &c)| self.ranges[d][c])
            .collect())
    }

    /// The subarray over the flattened interval `[start, end]`.
    ///
    /// The interval must itself form a cross product: a run confined to a
    /// single row, or whole blocks at some level of the layout hierarchy.
    /// Intervals produced by partition calibration always do.
    pub fn slice(&self, start: u64, end: u64) -> TesseraResult<Subarray<T>> {
        if start > end || end >= self.range_num() {
            tessera_bail!("invalid range interval [{start}, {end}]");
        }
        let order = self.layout_order();
        let start_coords = self.range_coords(start);
        let end_coords = self.range_coords(end);
        let varying = order.iter().position(|&d| start_coords[d] != end_coords[d]);

        let mut ranges: Vec<Vec<DimRange<T>>> = vec![Vec::new(); self.dim_num()];
        match varying {
            // A single N-D range.
            None => {
                for d in 0..self.dim_num() {
                    ranges[d] = vec![self.ranges[d][start_coords[d]]];
                }
            }
            Some(p) => {
                for (pos, &d) in order.iter().enumerate() {
                    if pos < p {
                        ranges[d] = vec![self.ranges[d][start_coords[d]]];
                    } else if pos == p {
                        ranges[d] = self.ranges[d][start_coords[d]..=end_coords[d]].to_vec();
                    } else {
                        if start_coords[d] != 0 || end_coords[d] != self.ranges[d].len() - 1 {
                            tessera_bail!(
                                "range interval [{start}, {end}] does not form a cross product"
                            );
                        }
                        ranges[d] = self.ranges[d].clone();
                    }
                }
            }
        }
        Ok(Subarray {
            domain: self.domain.clone(),
            layout: self.layout,
            ranges,
            is_default: vec![false; self.dim_num()],
        })
    }

    /// Bisect the only range on `dim` at `point`. Applies to single-range
    /// subarrays.
    pub fn split(&self, dim: usize, point: T) -> TesseraResult<(Subarray<T>, Subarray<T>)> {
        if self.ranges.iter().any(|r| r.len() != 1) {
            tessera_bail!("split applies to single-range subarrays");
        }
        let (left_range, right_range) = self.ranges[dim][0].split_at(point)?;
        let mut left = self.clone();
        let mut right = self.clone();
        left.ranges[dim] = vec![left_range];
        right.ranges[dim] = vec![right_range];
        Ok((left, right))
    }

    /// Split the range list of `dim` after position `at`: the left part
    /// keeps ranges `0..=at`, the right part the rest.
    pub fn split_multi(&self, dim: usize, at: usize) -> TesseraResult<(Subarray<T>, Subarray<T>)> {
        let n = self.ranges[dim].len();
        if at + 1 >= n {
            tessera_bail!("cannot split dimension {dim} after range {at} of {n}");
        }
        let mut left = self.clone();
        let mut right = self.clone();
        left.ranges[dim] = self.ranges[dim][..=at].to_vec();
        right.ranges[dim] = self.ranges[dim][at + 1..].to_vec();
        Ok((left, right))
    }

    /// The smallest 1-D range covering every range of `dim`.
    pub fn bounding_range(&self, d: usize) -> DimRange<T> {
        let mut low = self.ranges[d][0].low;
        let mut high = self.ranges[d][0].high;
        for range in &self.ranges[d][1..] {
            if range.low < low {
                low = range.low;
            }
            if range.high > high {
                high = range.high;
            }
        }
        DimRange { low, high }
    }

    /// Per-dimension count of space tiles overlapped by the bounding
    /// range; 1 for untiled dimensions.
    pub fn tile_spans(&self) -> Vec<u64> {
        (0..self.dim_num())
            .map(|d| {
                let Some(extent) = self.domain.dim(d).tile_extent else {
                    return 1;
                };
                let origin = self.domain.dim(d).bounds.low;
                let bounds = self.bounding_range(d);
                let first = T::tile_index(bounds.low, origin, extent);
                let last = T::tile_index(bounds.high, origin, extent);
                last - first + 1
            })
            .collect()
    }

    /// Estimated result size of `attr` over this subarray.
    pub fn est_result_size(
        &self,
        attr: &str,
        estimator: &dyn ResultSizeEstimator<T>,
    ) -> EstResultSize {
        estimator.est_result_size(attr, self)
    }

    /// The number of selected cells as a float; continuous dimensions
    /// contribute their extents.
    pub fn cell_extent(&self) -> f64 {
        self.ranges
            .iter()
            .map(|dim_ranges| {
                dim_ranges
                    .iter()
                    .map(|r| r.count().map(|c| c as f64).unwrap_or_else(|| r.span()))
                    .sum::<f64>()
            })
            .product()
    }
}
