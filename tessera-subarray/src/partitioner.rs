use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tessera_error::{tessera_bail, TesseraExpect, TesseraResult};

use crate::estimate::{EstResultSize, ResultBudget, ResultSizeEstimator};
use crate::layout::Layout;
use crate::range::DimensionValue;
use crate::subarray::Subarray;

/// Default budget for fixed-sized data across all attributes.
pub const DEFAULT_MEMORY_BUDGET: u64 = 5 * 1024 * 1024 * 1024;
/// Default budget for var-sized data across all attributes.
pub const DEFAULT_MEMORY_BUDGET_VAR: u64 = 10 * 1024 * 1024 * 1024;

/// The current partition together with the interval of flattened range
/// indices of the original subarray it was constructed from.
#[derive(Clone, Debug)]
pub struct PartitionInfo<T: DimensionValue> {
    pub partition: Subarray<T>,
    pub start: u64,
    pub end: u64,
    /// Whether the partition came from splitting a multi-range slab.
    pub split_multi_range: bool,
}

/// Iteration state: the interval of still-unconsumed flattened ranges,
/// plus the queues of pieces produced by splitting. At most one queue is
/// non-empty at any moment; when both are empty the next partition is
/// drawn directly from `[start, end]`.
#[derive(Clone, Debug)]
pub struct State<T: DimensionValue> {
    pub start: u64,
    pub end: u64,
    pub single_range: VecDeque<Subarray<T>>,
    pub multi_range: VecDeque<Subarray<T>>,
}

/// Iterates over partitions of a subarray such that the estimated result
/// of each partition fits the per-attribute and memory budgets.
///
/// The caller loops [`next`][Self::next] until [`done`][Self::done],
/// reading [`current`][Self::current] each iteration, and may call
/// [`split_current`][Self::split_current] when the actual result proves
/// the estimate too optimistic. Budget exhaustion is never an error; it is
/// signaled through the `unsplittable` out-parameter so the reader can
/// shrink its request.
///
/// Cloning performs a deep copy of the subarray, the state queues, the
/// current partition and the budgets; the estimator is an immutable shared
/// handle.
#[derive(Clone)]
pub struct SubarrayPartitioner<T: DimensionValue> {
    subarray: Subarray<T>,
    estimator: Arc<dyn ResultSizeEstimator<T>>,
    budget: HashMap<String, ResultBudget>,
    current: Option<PartitionInfo<T>>,
    state: State<T>,
    memory_budget: u64,
    memory_budget_var: u64,
    /// Flattened index that produced the pieces in `state.single_range`.
    single_origin: u64,
    /// Flattened interval that produced the pieces in `state.multi_range`.
    multi_origin: (u64, u64),
}

enum MultiSplit<T> {
    /// Split the range list of a dimension after the given position.
    BetweenRanges(usize, usize),
    /// Bisect the single remaining range of a dimension at a value.
    AtValue(usize, T),
}

impl<T: DimensionValue> SubarrayPartitioner<T> {
    pub fn new(subarray: Subarray<T>, estimator: Arc<dyn ResultSizeEstimator<T>>) -> Self {
        let end = subarray.range_num() - 1;
        Self {
            subarray,
            estimator,
            budget: HashMap::new(),
            current: None,
            state: State {
                start: 0,
                end,
                single_range: VecDeque::new(),
                multi_range: VecDeque::new(),
            },
            memory_budget: DEFAULT_MEMORY_BUDGET,
            memory_budget_var: DEFAULT_MEMORY_BUDGET_VAR,
            single_origin: 0,
            multi_origin: (0, 0),
        }
    }

    pub fn subarray(&self) -> &Subarray<T> {
        &self.subarray
    }

    pub fn state(&self) -> &State<T> {
        &self.state
    }

    pub fn current(&self) -> Option<&Subarray<T>> {
        self.current.as_ref().map(|info| &info.partition)
    }

    pub fn current_partition_info(&self) -> Option<&PartitionInfo<T>> {
        self.current.as_ref()
    }

    /// Budget for a fixed-sized attribute.
    pub fn set_result_budget(&mut self, attr: &str, size_fixed: u64) {
        self.budget.insert(
            attr.to_string(),
            ResultBudget {
                size_fixed,
                size_var: 0,
            },
        );
    }

    /// Budget for a var-sized attribute: offsets and values separately.
    pub fn set_result_budget_var(&mut self, attr: &str, size_fixed: u64, size_var: u64) {
        self.budget.insert(
            attr.to_string(),
            ResultBudget {
                size_fixed,
                size_var,
            },
        );
    }

    pub fn get_result_budget(&self, attr: &str) -> Option<ResultBudget> {
        self.budget.get(attr).copied()
    }

    pub fn result_budgets(&self) -> &HashMap<String, ResultBudget> {
        &self.budget
    }

    pub fn set_memory_budget(&mut self, budget: u64, budget_var: u64) {
        self.memory_budget = budget;
        self.memory_budget_var = budget_var;
    }

    pub fn get_memory_budget(&self) -> (u64, u64) {
        (self.memory_budget, self.memory_budget_var)
    }

    /// Whether all partitions have been produced.
    pub fn done(&self) -> bool {
        self.state.single_range.is_empty()
            && self.state.multi_range.is_empty()
            && self.state.start > self.state.end
    }

    /// Advance to the next partition.
    ///
    /// When the front of the work queue cannot be split any further while
    /// over budget (a single cell, or a real range at representation
    /// granularity), `unsplittable` is set and the state is left unchanged.
    pub fn next(&mut self, unsplittable: &mut bool) -> TesseraResult<()> {
        *unsplittable = false;
        if self.done() {
            tessera_bail!("the partitioner has no more partitions");
        }
        if !self.state.single_range.is_empty() {
            return self.next_from_single_range(unsplittable);
        }
        if !self.state.multi_range.is_empty() {
            return self.next_from_multi_range(unsplittable);
        }

        let start = self.state.start;
        let (end, found) = self.compute_current_start_end()?;

        if !found {
            // Not even the first range fits; it must be split on its own.
            let single = self.subarray.slice(start, start)?;
            self.single_origin = start;
            self.state.single_range.push_front(single);
            self.state.start += 1;
            return self.next_from_single_range(unsplittable);
        }

        let (end, must_split_slab) = self.calibrate(start, end)?;

        if must_split_slab {
            let slab = self.subarray.slice(start, end)?;
            self.multi_origin = (start, end);
            self.state.multi_range.push_front(slab);
            self.state.start = end + 1;
            return self.next_from_multi_range(unsplittable);
        }

        let partition = self.subarray.slice(start, end)?;
        self.current = Some(PartitionInfo {
            partition,
            start,
            end,
            split_multi_range: false,
        });
        self.state.start = end + 1;
        Ok(())
    }

    /// Split the current partition and re-materialize a smaller one.
    ///
    /// Called by the reader after the partition returned by
    /// [`next`][Self::next] overshot the budget in practice. On
    /// `unsplittable` the current partition is left in place.
    pub fn split_current(&mut self, unsplittable: &mut bool) -> TesseraResult<()> {
        *unsplittable = false;
        let Some(current) = self.current.clone() else {
            tessera_bail!("there is no current partition to split");
        };

        // The partition came from splitting a multi-range slab.
        if current.split_multi_range {
            self.state.multi_range.push_front(current.partition);
            self.split_top_multi_range(unsplittable)?;
            if *unsplittable {
                self.state.multi_range.pop_front();
                return Ok(());
            }
            self.multi_origin = (current.start, current.end);
            return self.next_from_multi_range(unsplittable);
        }

        // The partition covered an interval of several ranges: halve it
        // and give the second half back to the direct interval.
        if current.start < current.end {
            let len = current.end - current.start + 1;
            let halved = current.start + len / 2 - 1;
            let (end, must_split_slab) = self.calibrate(current.start, halved)?;
            self.state.start = end + 1;
            if must_split_slab {
                let slab = self.subarray.slice(current.start, end)?;
                self.multi_origin = (current.start, end);
                self.state.multi_range.push_front(slab);
                return self.next_from_multi_range(unsplittable);
            }
            let partition = self.subarray.slice(current.start, end)?;
            self.current = Some(PartitionInfo {
                partition,
                start: current.start,
                end,
                split_multi_range: false,
            });
            return Ok(());
        }

        // The partition was a single range (or a piece of one); force one
        // more split regardless of what the estimates say.
        self.state.single_range.push_front(current.partition);
        self.single_origin = current.start;
        self.split_top_single_range(unsplittable)?;
        if *unsplittable {
            self.state.single_range.pop_front();
            return Ok(());
        }
        self.next_from_single_range(unsplittable)
    }

    /// Greedily grow `[state.start, end]` while the accumulated estimates
    /// fit every budget. `found` is false when not even the first range
    /// fits.
    fn compute_current_start_end(&self) -> TesseraResult<(u64, bool)> {
        let start = self.state.start;
        let mut sizes: HashMap<&str, EstResultSize> = self
            .budget
            .keys()
            .map(|attr| (attr.as_str(), EstResultSize::default()))
            .collect();
        let mut total = EstResultSize::default();
        let mut end = start;
        let mut found = false;

        for idx in start..=self.state.end {
            let range = self.subarray.slice(idx, idx)?;
            let mut fits = true;
            let mut grown = Vec::with_capacity(self.budget.len());
            let mut grown_total = total;
            for (attr, budget) in &self.budget {
                let est = self.estimator.est_result_size(attr, &range);
                let new = sizes[attr.as_str()] + est;
                if new.size_fixed > budget.size_fixed || new.size_var > budget.size_var {
                    fits = false;
                }
                grown_total = grown_total + est;
                grown.push((attr.as_str(), new));
            }
            if grown_total.size_fixed > self.memory_budget
                || grown_total.size_var > self.memory_budget_var
            {
                fits = false;
            }
            if !fits {
                break;
            }
            for (attr, new) in grown {
                sizes.insert(attr, new);
            }
            total = grown_total;
            end = idx;
            found = true;
        }
        Ok((end, found))
    }

    /// Align `[start, end]` with the structure the layout requires: whole
    /// slabs for the ordered layouts (flagging a partial first slab for
    /// multi-range splitting), a single partial row at most for the
    /// unordered layout, and the interval itself for global order.
    fn calibrate(&self, start: u64, end: u64) -> TesseraResult<(u64, bool)> {
        match self.subarray.layout() {
            Layout::GlobalOrder => Ok((end, false)),
            Layout::Unordered => Ok((self.calibrate_unordered(start, end), false)),
            Layout::RowMajor | Layout::ColMajor => Ok(self.calibrate_ordered(start, end)),
        }
    }

    /// Range count of the fastest-varying dimension.
    fn row_len(&self) -> u64 {
        let fastest = match self.subarray.layout() {
            Layout::ColMajor => 0,
            _ => self.subarray.dim_num() - 1,
        };
        self.subarray.range_num_per_dim(fastest)
    }

    fn calibrate_unordered(&self, start: u64, end: u64) -> u64 {
        let row = self.row_len();
        if start / row == end / row {
            // A single, possibly partial, row.
            return end;
        }
        if start % row == 0 {
            // Cover whole rows only.
            if (end + 1) % row == 0 {
                end
            } else {
                (end / row) * row - 1
            }
        } else {
            // Finish the partial row a previous split left behind.
            (start / row + 1) * row - 1
        }
    }

    fn calibrate_ordered(&self, start: u64, mut end: u64) -> (u64, bool) {
        // Block sizes per level of the layout hierarchy, slowest dimension
        // first: level j spans the ranges of all dimensions faster than j.
        let radices: Vec<u64> = match self.subarray.layout() {
            Layout::ColMajor => (0..self.subarray.dim_num())
                .rev()
                .map(|d| self.subarray.range_num_per_dim(d))
                .collect(),
            _ => (0..self.subarray.dim_num())
                .map(|d| self.subarray.range_num_per_dim(d))
                .collect(),
        };
        let dim_num = radices.len();
        let mut level = vec![1u64; dim_num];
        for j in (0..dim_num - 1).rev() {
            level[j] = level[j + 1] * radices[j + 1];
        }

        // The coarsest level at which `start` sits on a block boundary;
        // level[dim_num - 1] == 1 always terminates the search.
        let mut j = 0;
        while start % level[j] != 0 {
            j += 1;
        }
        if j > 0 {
            // `start` sits inside an enclosing coarser block; the
            // partition must not escape it.
            let outer = level[j - 1];
            let block_end = (start / outer + 1) * outer - 1;
            end = end.min(block_end);
        }

        let block = level[j];
        if (end + 1) % block == 0 {
            (end, false)
        } else if end / block > start / block {
            // Round down to the last whole block.
            ((end / block) * block - 1, false)
        } else {
            // Less than one block: cover the whole block containing
            // `start` and split it as a multi-range slab.
            (start + block - 1, true)
        }
    }

    fn next_from_single_range(&mut self, unsplittable: &mut bool) -> TesseraResult<()> {
        loop {
            let must = {
                let front = self
                    .state
                    .single_range
                    .front()
                    .tessera_expect("single-range queue is non-empty");
                self.must_split(front)
            };
            if !must {
                break;
            }
            self.split_top_single_range(unsplittable)?;
            if *unsplittable {
                return Ok(());
            }
        }
        let partition = self
            .state
            .single_range
            .pop_front()
            .tessera_expect("single-range queue is non-empty");
        self.current = Some(PartitionInfo {
            partition,
            start: self.single_origin,
            end: self.single_origin,
            split_multi_range: false,
        });
        Ok(())
    }

    fn next_from_multi_range(&mut self, unsplittable: &mut bool) -> TesseraResult<()> {
        loop {
            let must = {
                let front = self
                    .state
                    .multi_range
                    .front()
                    .tessera_expect("multi-range queue is non-empty");
                self.must_split(front)
            };
            if !must {
                break;
            }
            self.split_top_multi_range(unsplittable)?;
            if *unsplittable {
                return Ok(());
            }
        }
        let partition = self
            .state
            .multi_range
            .pop_front()
            .tessera_expect("multi-range queue is non-empty");
        self.current = Some(PartitionInfo {
            partition,
            start: self.multi_origin.0,
            end: self.multi_origin.1,
            split_multi_range: true,
        });
        Ok(())
    }

    /// Replace the front of the single-range queue with its two halves,
    /// left first so iteration stays lexicographic.
    fn split_top_single_range(&mut self, unsplittable: &mut bool) -> TesseraResult<()> {
        let plan = {
            let front = self
                .state
                .single_range
                .front()
                .tessera_expect("single-range queue is non-empty");
            match self.subarray.layout() {
                Layout::GlobalOrder => self.splitting_point_on_tiles(front),
                _ => self.splitting_point_single_range(front),
            }
        };
        let Some((dim, point)) = plan else {
            *unsplittable = true;
            return Ok(());
        };
        let front = self
            .state
            .single_range
            .pop_front()
            .tessera_expect("single-range queue is non-empty");
        let (left, right) = front.split(dim, point)?;
        self.state.single_range.push_front(right);
        self.state.single_range.push_front(left);
        Ok(())
    }

    /// Replace the front of the multi-range queue with its two parts.
    fn split_top_multi_range(&mut self, unsplittable: &mut bool) -> TesseraResult<()> {
        let plan = {
            let front = self
                .state
                .multi_range
                .front()
                .tessera_expect("multi-range queue is non-empty");
            self.splitting_point_multi_range(front)
        };
        let Some(plan) = plan else {
            *unsplittable = true;
            return Ok(());
        };
        let front = self
            .state
            .multi_range
            .pop_front()
            .tessera_expect("multi-range queue is non-empty");
        let (left, right) = match plan {
            MultiSplit::BetweenRanges(dim, at) => front.split_multi(dim, at)?,
            MultiSplit::AtValue(dim, point) => front.split(dim, point)?,
        };
        self.state.multi_range.push_front(right);
        self.state.multi_range.push_front(left);
        Ok(())
    }

    /// The dimension with the longest range (lowest index on ties) and its
    /// midpoint. `None` when the midpoint does not exist, i.e. the range
    /// is a single cell or at representation granularity.
    fn splitting_point_single_range(&self, single: &Subarray<T>) -> Option<(usize, T)> {
        let mut best: Option<(usize, f64)> = None;
        for d in 0..single.dim_num() {
            let span = single.dim_ranges(d)[0].span();
            if best.map_or(true, |(_, best_span)| span > best_span) {
                best = Some((d, span));
            }
        }
        let (dim, _) = best?;
        let point = single.dim_ranges(dim)[0].midpoint()?;
        Some((dim, point))
    }

    /// Global order splits in units of space tiles: the dimension spanning
    /// the most tiles, split at the end of its middle tile. A range within
    /// a single tile on every dimension is unsplittable.
    fn splitting_point_on_tiles(&self, single: &Subarray<T>) -> Option<(usize, T)> {
        let spans = single.tile_spans();
        let mut best: Option<(usize, u64)> = None;
        for (d, &span) in spans.iter().enumerate() {
            if span > 1 && best.map_or(true, |(_, best_span)| span > best_span) {
                best = Some((d, span));
            }
        }
        let (dim, _) = best?;

        let extent = single
            .domain()
            .dim(dim)
            .tile_extent
            .tessera_expect("a dimension spanning several tiles is tiled");
        let origin = single.domain().dim(dim).bounds.low;
        let range = single.dim_ranges(dim)[0];
        let first = T::tile_index(range.low, origin, extent);
        let last = T::tile_index(range.high, origin, extent);
        let middle = first + (last - first) / 2;
        let point = T::tile_end(origin, extent, middle);
        if range.low <= point && point < range.high {
            Some((dim, point))
        } else {
            // A tile boundary coinciding with the range end; fall back to
            // the value midpoint.
            range.midpoint().map(|p| (dim, p))
        }
    }

    /// The first dimension holding more than one range, scanning from the
    /// slowest-varying dimension of the layout; split after the median
    /// range. Once every dimension has collapsed to a single range, split
    /// inside a range like the single-range case.
    fn splitting_point_multi_range(&self, multi: &Subarray<T>) -> Option<MultiSplit<T>> {
        let dims: Vec<usize> = match self.subarray.layout() {
            Layout::ColMajor => (0..multi.dim_num()).rev().collect(),
            _ => (0..multi.dim_num()).collect(),
        };
        for d in dims {
            let n = multi.range_num_per_dim(d);
            if n > 1 {
                return Some(MultiSplit::BetweenRanges(d, ((n - 1) / 2) as usize));
            }
        }
        self.splitting_point_single_range(multi)
            .map(|(dim, point)| MultiSplit::AtValue(dim, point))
    }

    /// Whether the partition's estimated result exceeds any active budget.
    fn must_split(&self, partition: &Subarray<T>) -> bool {
        let mut total = EstResultSize::default();
        for (attr, budget) in &self.budget {
            let est = self.estimator.est_result_size(attr, partition);
            if est.size_fixed > budget.size_fixed || est.size_var > budget.size_var {
                return true;
            }
            total = total + est;
        }
        total.size_fixed > self.memory_budget || total.size_var > self.memory_budget_var
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use itertools::Itertools;

    use super::*;
    use crate::estimate::CellCountEstimator;
    use crate::range::DimRange;
    use crate::subarray::{Dimension, Domain};

    fn domain_1d(high: u64) -> Arc<Domain<u64>> {
        Arc::new(Domain::new(vec![Dimension::new(DimRange::new(0, high).unwrap())]).unwrap())
    }

    fn byte_per_cell() -> Arc<CellCountEstimator> {
        Arc::new(CellCountEstimator::new().with_attr("a", 1, 0))
    }

    fn ranges_of(subarray: &Subarray<u64>, d: usize) -> Vec<(u64, u64)> {
        subarray.dim_ranges(d).iter().map(|r| (r.low, r.high)).collect()
    }

    fn cells(subarray: &Subarray<u64>) -> Vec<Vec<u64>> {
        (0..subarray.dim_num())
            .map(|d| {
                subarray
                    .dim_ranges(d)
                    .iter()
                    .flat_map(|r| r.low..=r.high)
                    .collect::<Vec<u64>>()
            })
            .multi_cartesian_product()
            .collect()
    }

    fn drain(partitioner: &mut SubarrayPartitioner<u64>) -> Vec<Subarray<u64>> {
        let mut partitions = Vec::new();
        let mut unsplittable = false;
        while !partitioner.done() {
            partitioner.next(&mut unsplittable).unwrap();
            assert!(!unsplittable, "unexpected unsplittable partition");
            partitions.push(partitioner.current().unwrap().clone());
        }
        partitions
    }

    #[test]
    fn a_covering_budget_yields_one_partition() {
        let subarray = Subarray::new(domain_1d(99), Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray.clone(), byte_per_cell());
        partitioner.set_result_budget("a", 1_000);

        let partitions = drain(&mut partitioner);
        assert_eq!(partitions.len(), 1);
        assert_eq!(ranges_of(&partitions[0], 0), ranges_of(&subarray, 0));
        let info = partitioner.current_partition_info().unwrap();
        assert_eq!((info.start, info.end), (0, 0));
        assert!(!info.split_multi_range);
    }

    #[test]
    fn one_dimensional_integer_halving() {
        let subarray = Subarray::new(domain_1d(99), Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 50);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert!(!unsplittable);
        assert_eq!(ranges_of(partitioner.current().unwrap(), 0), vec![(0, 49)]);
        let info = partitioner.current_partition_info().unwrap();
        assert_eq!((info.start, info.end), (0, 0));

        partitioner.next(&mut unsplittable).unwrap();
        assert!(!unsplittable);
        assert_eq!(ranges_of(partitioner.current().unwrap(), 0), vec![(50, 99)]);

        assert!(partitioner.done());
    }

    #[test]
    fn next_after_done_is_an_error() {
        let subarray = Subarray::new(domain_1d(9), Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert!(partitioner.done());
        assert!(partitioner.next(&mut unsplittable).is_err());
    }

    #[test]
    fn row_major_slab_calibration() {
        // dim0: [0..9], [20..29]; dim1: [0..9]. One slab = 100 cells.
        let domain = Arc::new(
            Domain::new(vec![
                Dimension::new(DimRange::new(0, 99).unwrap()),
                Dimension::new(DimRange::new(0, 9).unwrap()),
            ])
            .unwrap(),
        );
        let mut subarray = Subarray::new(domain, Layout::RowMajor);
        subarray.add_range(0, DimRange::new(0, 9).unwrap()).unwrap();
        subarray.add_range(0, DimRange::new(20, 29).unwrap()).unwrap();

        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        // Fits 1.5 slabs: the first partition is exactly one full slab.
        partitioner.set_result_budget("a", 150);

        let partitions = drain(&mut partitioner);
        assert_eq!(partitions.len(), 2);
        assert_eq!(ranges_of(&partitions[0], 0), vec![(0, 9)]);
        assert_eq!(ranges_of(&partitions[0], 1), vec![(0, 9)]);
        assert_eq!(ranges_of(&partitions[1], 0), vec![(20, 29)]);
    }

    #[test]
    fn partial_slab_is_split_as_multi_range() {
        // dim0: [0..9], [20..29]; dim1: [0..1], [5..6]. Slab = 40 cells.
        let domain = Arc::new(
            Domain::new(vec![
                Dimension::new(DimRange::new(0, 99).unwrap()),
                Dimension::new(DimRange::new(0, 9).unwrap()),
            ])
            .unwrap(),
        );
        let mut subarray = Subarray::new(domain, Layout::RowMajor);
        subarray.add_range(0, DimRange::new(0, 9).unwrap()).unwrap();
        subarray.add_range(0, DimRange::new(20, 29).unwrap()).unwrap();
        subarray.add_range(1, DimRange::new(0, 1).unwrap()).unwrap();
        subarray.add_range(1, DimRange::new(5, 6).unwrap()).unwrap();

        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 30);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert!(!unsplittable);
        // The first slab (40 cells) exceeds the budget, so it is split
        // between the two dim1 ranges.
        let info = partitioner.current_partition_info().unwrap();
        assert!(info.split_multi_range);
        assert_eq!((info.start, info.end), (0, 1));
        assert_eq!(ranges_of(&info.partition, 0), vec![(0, 9)]);
        assert_eq!(ranges_of(&info.partition, 1), vec![(0, 1)]);

        partitioner.next(&mut unsplittable).unwrap();
        assert_eq!(
            ranges_of(partitioner.current().unwrap(), 1),
            vec![(5, 6)]
        );

        // The second slab also splits; afterwards the iterator is done.
        partitioner.next(&mut unsplittable).unwrap();
        assert_eq!(ranges_of(partitioner.current().unwrap(), 0), vec![(20, 29)]);
        partitioner.next(&mut unsplittable).unwrap();
        assert!(partitioner.done());
    }

    #[test]
    fn col_major_splits_its_slowest_dimension_first() {
        // Col-major: dim0 varies fastest, dim1 is the slab dimension.
        let domain = Arc::new(
            Domain::new(vec![
                Dimension::new(DimRange::new(0, 9).unwrap()),
                Dimension::new(DimRange::new(0, 99).unwrap()),
            ])
            .unwrap(),
        );
        let mut subarray = Subarray::new(domain, Layout::ColMajor);
        subarray.add_range(0, DimRange::new(0, 1).unwrap()).unwrap();
        subarray.add_range(0, DimRange::new(5, 6).unwrap()).unwrap();
        subarray.add_range(1, DimRange::new(0, 9).unwrap()).unwrap();
        subarray.add_range(1, DimRange::new(20, 29).unwrap()).unwrap();

        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 30);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        let info = partitioner.current_partition_info().unwrap();
        assert!(info.split_multi_range);
        // The slab kept dim1 fixed and split between the dim0 ranges.
        assert_eq!(ranges_of(&info.partition, 1), vec![(0, 9)]);
        assert_eq!(ranges_of(&info.partition, 0), vec![(0, 1)]);
    }

    #[test]
    fn unordered_allows_partial_rows() {
        // dim0: 2 ranges of 10 cells; dim1: 3 ranges of 5 cells.
        let domain = Arc::new(
            Domain::new(vec![
                Dimension::new(DimRange::new(0, 99).unwrap()),
                Dimension::new(DimRange::new(0, 99).unwrap()),
            ])
            .unwrap(),
        );
        let mut subarray = Subarray::new(domain, Layout::Unordered);
        subarray.add_range(0, DimRange::new(0, 9).unwrap()).unwrap();
        subarray.add_range(0, DimRange::new(20, 29).unwrap()).unwrap();
        for low in [0, 10, 30] {
            subarray.add_range(1, DimRange::new(low, low + 4).unwrap()).unwrap();
        }

        let original = subarray.clone();
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        // Each N-D range holds 50 cells; two fit per partition.
        partitioner.set_result_budget("a", 100);

        let partitions = drain(&mut partitioner);
        // Rows have 3 ranges: [0,1] partial, [2] row rest, [3,4], [5].
        assert_eq!(partitions.len(), 4);
        assert_eq!(partitions[0].range_num(), 2);
        assert_eq!(partitions[1].range_num(), 1);

        let mut seen = HashSet::new();
        let mut count = 0usize;
        for partition in &partitions {
            for cell in cells(partition) {
                count += 1;
                seen.insert(cell);
            }
        }
        let expected: HashSet<_> = cells(&original).into_iter().collect();
        assert_eq!(count, expected.len(), "partitions overlap");
        assert_eq!(seen, expected, "partitions do not cover the subarray");
    }

    #[test]
    fn split_current_after_overshoot() {
        let subarray = Subarray::new(domain_1d(99), Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 1_000);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert_eq!(ranges_of(partitioner.current().unwrap(), 0), vec![(0, 99)]);
        assert!(partitioner.done());

        // The reader discovers the estimate was too optimistic.
        partitioner.split_current(&mut unsplittable).unwrap();
        assert!(!unsplittable);
        assert_eq!(ranges_of(partitioner.current().unwrap(), 0), vec![(0, 49)]);
        assert!(!partitioner.done());

        partitioner.next(&mut unsplittable).unwrap();
        assert_eq!(ranges_of(partitioner.current().unwrap(), 0), vec![(50, 99)]);
        assert!(partitioner.done());
    }

    #[test]
    fn split_current_halves_an_interval_partition() {
        let domain = domain_1d(99);
        let mut subarray = Subarray::new(domain, Layout::RowMajor);
        for low in [0, 10, 20, 30] {
            subarray.add_range(0, DimRange::new(low, low + 9).unwrap()).unwrap();
        }
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 40);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert_eq!(partitioner.current().unwrap().range_num(), 4);

        partitioner.split_current(&mut unsplittable).unwrap();
        assert!(!unsplittable);
        assert_eq!(
            ranges_of(partitioner.current().unwrap(), 0),
            vec![(0, 9), (10, 19)]
        );

        partitioner.next(&mut unsplittable).unwrap();
        assert_eq!(
            ranges_of(partitioner.current().unwrap(), 0),
            vec![(20, 29), (30, 39)]
        );
        assert!(partitioner.done());
    }

    #[test]
    fn below_one_cell_budget_is_unsplittable() {
        let domain = Arc::new(
            Domain::new(vec![Dimension::new(DimRange::new(5, 5).unwrap())]).unwrap(),
        );
        let subarray = Subarray::new(domain, Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 0);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert!(unsplittable);
        assert!(partitioner.current().is_none());
    }

    #[test]
    fn deep_splitting_stops_at_single_cells() {
        let subarray = Subarray::new(domain_1d(99), Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 0);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert!(unsplittable, "a zero budget cannot fit a single cell");
    }

    #[test]
    fn real_domains_split_until_granularity() {
        let domain = Arc::new(
            Domain::new(vec![Dimension::new(DimRange::new(0.0f64, 1.0).unwrap())]).unwrap(),
        );
        let subarray = Subarray::new(domain, Layout::RowMajor);
        let estimator = Arc::new(CellCountEstimator::new().with_attr("a", 100, 0));
        let mut partitioner = SubarrayPartitioner::new(subarray, estimator.clone());
        partitioner.set_result_budget("a", 50);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert!(!unsplittable);
        let first = partitioner.current().unwrap();
        assert_eq!(first.dim_ranges(0)[0].high, 0.5);

        // A range at representation granularity cannot split further.
        let tiny_domain = Arc::new(
            Domain::new(vec![Dimension::new(
                DimRange::new(1.0f64, 1.0f64.next_up()).unwrap(),
            )])
            .unwrap(),
        );
        let tiny = Subarray::new(tiny_domain, Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(tiny, estimator);
        partitioner.set_result_budget("a", 0);
        partitioner.next(&mut unsplittable).unwrap();
        assert!(unsplittable);
    }

    #[test]
    fn global_order_splits_on_tile_boundaries() {
        let domain = Arc::new(
            Domain::new(vec![Dimension::new(DimRange::new(0, 99).unwrap())
                .with_tile_extent(10)])
            .unwrap(),
        );
        let subarray = Subarray::new(domain, Layout::GlobalOrder);
        let mut partitioner = SubarrayPartitioner::new(subarray.clone(), byte_per_cell());
        partitioner.set_result_budget("a", 25);

        let mut partitions = Vec::new();
        let mut unsplittable = false;
        while !partitioner.done() {
            partitioner.next(&mut unsplittable).unwrap();
            assert!(!unsplittable);
            partitions.push(partitioner.current().unwrap().clone());
        }

        // Every split lands on a tile boundary and the cover is exact.
        let mut cursor = 0u64;
        for partition in &partitions {
            let range = partition.dim_ranges(0)[0];
            assert_eq!(range.low, cursor);
            assert_eq!((range.high + 1) % 10, 0);
            assert!(range.count().unwrap() <= 25);
            cursor = range.high + 1;
        }
        assert_eq!(cursor, 100);

        // A range confined to one tile is unsplittable at tile granularity.
        let one_tile_domain = Arc::new(
            Domain::new(vec![Dimension::new(DimRange::new(0, 9).unwrap())
                .with_tile_extent(10)])
            .unwrap(),
        );
        let one_tile = Subarray::new(one_tile_domain, Layout::GlobalOrder);
        let mut partitioner = SubarrayPartitioner::new(one_tile, byte_per_cell());
        partitioner.set_result_budget("a", 5);
        partitioner.next(&mut unsplittable).unwrap();
        assert!(unsplittable);
    }

    #[test]
    fn memory_budget_caps_the_total_across_attributes() {
        let subarray = Subarray::new(domain_1d(99), Layout::RowMajor);
        let estimator = Arc::new(
            CellCountEstimator::new()
                .with_attr("a", 1, 0)
                .with_attr("b", 1, 0),
        );
        let mut partitioner = SubarrayPartitioner::new(subarray, estimator);
        // Each attribute alone fits, but together they exceed the memory
        // budget, forcing a split.
        partitioner.set_result_budget("a", 100);
        partitioner.set_result_budget("b", 100);
        partitioner.set_memory_budget(100, u64::MAX);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        assert_eq!(ranges_of(partitioner.current().unwrap(), 0), vec![(0, 49)]);
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let subarray = Subarray::new(domain_1d(99), Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 50);

        let mut unsplittable = false;
        partitioner.next(&mut unsplittable).unwrap();
        let snapshot = partitioner.clone();

        partitioner.next(&mut unsplittable).unwrap();
        assert!(partitioner.done());

        // The clone still sees the state at snapshot time.
        assert!(!snapshot.done());
        assert_eq!(ranges_of(snapshot.current().unwrap(), 0), vec![(0, 49)]);
        assert_eq!(snapshot.get_result_budget("a").unwrap().size_fixed, 50);

        let mut snapshot = snapshot;
        snapshot.next(&mut unsplittable).unwrap();
        assert_eq!(ranges_of(snapshot.current().unwrap(), 0), vec![(50, 99)]);
    }

    #[test]
    fn budget_accessors_round_trip() {
        let subarray = Subarray::new(domain_1d(9), Layout::RowMajor);
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());

        assert_eq!(partitioner.get_result_budget("a"), None);
        partitioner.set_result_budget("a", 10);
        partitioner.set_result_budget_var("v", 20, 200);
        assert_eq!(
            partitioner.get_result_budget("a").unwrap(),
            ResultBudget { size_fixed: 10, size_var: 0 }
        );
        assert_eq!(
            partitioner.get_result_budget("v").unwrap(),
            ResultBudget { size_fixed: 20, size_var: 200 }
        );
        assert_eq!(partitioner.result_budgets().len(), 2);

        assert_eq!(
            partitioner.get_memory_budget(),
            (DEFAULT_MEMORY_BUDGET, DEFAULT_MEMORY_BUDGET_VAR)
        );
        partitioner.set_memory_budget(1_000, 2_000);
        assert_eq!(partitioner.get_memory_budget(), (1_000, 2_000));
    }

    #[test]
    fn disjoint_cover_under_mixed_splitting() {
        // Multi-range 2-D subarray partitioned with a budget small enough
        // to force slab calibration, multi-range splits and single-range
        // splits together.
        let domain = Arc::new(
            Domain::new(vec![
                Dimension::new(DimRange::new(0, 99).unwrap()),
                Dimension::new(DimRange::new(0, 99).unwrap()),
            ])
            .unwrap(),
        );
        let mut subarray = Subarray::new(domain, Layout::RowMajor);
        subarray.add_range(0, DimRange::new(0, 6).unwrap()).unwrap();
        subarray.add_range(0, DimRange::new(50, 54).unwrap()).unwrap();
        subarray.add_range(1, DimRange::new(0, 3).unwrap()).unwrap();
        subarray.add_range(1, DimRange::new(90, 98).unwrap()).unwrap();

        let original = subarray.clone();
        let mut partitioner = SubarrayPartitioner::new(subarray, byte_per_cell());
        partitioner.set_result_budget("a", 17);

        let partitions = drain(&mut partitioner);
        assert!(partitions.len() > 2);

        let mut seen = HashSet::new();
        let mut count = 0usize;
        for partition in &partitions {
            for cell in cells(partition) {
                count += 1;
                seen.insert(cell);
            }
        }
        let expected: HashSet<_> = cells(&original).into_iter().collect();
        assert_eq!(count, expected.len(), "partitions overlap");
        assert_eq!(seen, expected, "partitions do not cover the subarray");
    }
}
