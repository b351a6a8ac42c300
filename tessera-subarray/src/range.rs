use std::fmt::Debug;

use tessera_error::{tessera_bail, TesseraResult};

/// A value type usable as a dimension domain element.
///
/// Splitting logic is monomorphized over this trait. [`midpoint`] returning
/// `None` signals that `[low, high]` cannot be split: a single-cell
/// integral range, or a floating range already at representation
/// granularity.
///
/// [`midpoint`]: DimensionValue::midpoint
pub trait DimensionValue: Copy + PartialOrd + Debug + Send + Sync + 'static {
    /// The midpoint of `[low, high]`, or `None` when the range cannot be
    /// split.
    fn midpoint(low: Self, high: Self) -> Option<Self>;

    /// The smallest representable value strictly above `value`.
    fn successor(value: Self) -> Self;

    /// The number of cells in `[low, high]`; `None` for continuous
    /// domains.
    fn count(low: Self, high: Self) -> Option<u64>;

    /// The extent of `[low, high]` as a float, for longest-dimension
    /// selection.
    fn span(low: Self, high: Self) -> f64;

    /// Index of the space tile holding `value`, for tiles of `extent`
    /// anchored at `origin`.
    fn tile_index(value: Self, origin: Self, extent: Self) -> u64;

    /// The last value covered by `tile` for integral domains, or its upper
    /// boundary for continuous ones.
    fn tile_end(origin: Self, extent: Self, tile: u64) -> Self;
}

macro_rules! integral_dimension_value {
    ($($t:ty => $wide:ty),* $(,)?) => {$(
        impl DimensionValue for $t {
            fn midpoint(low: Self, high: Self) -> Option<Self> {
                if low >= high {
                    return None;
                }
                Some((low as $wide + (high as $wide - low as $wide) / 2) as $t)
            }

            fn successor(value: Self) -> Self {
                value + 1
            }

            fn count(low: Self, high: Self) -> Option<u64> {
                Some(((high as $wide - low as $wide) as u64).saturating_add(1))
            }

            fn span(low: Self, high: Self) -> f64 {
                (high as $wide - low as $wide) as f64
            }

            fn tile_index(value: Self, origin: Self, extent: Self) -> u64 {
                ((value as $wide - origin as $wide) / extent as $wide) as u64
            }

            fn tile_end(origin: Self, extent: Self, tile: u64) -> Self {
                (origin as $wide + (tile as $wide + 1) * extent as $wide - 1) as $t
            }
        }
    )*};
}

integral_dimension_value!(
    i8 => i128, i16 => i128, i32 => i128, i64 => i128,
    u8 => u128, u16 => u128, u32 => u128, u64 => u128,
);

macro_rules! real_dimension_value {
    ($($t:ty),* $(,)?) => {$(
        impl DimensionValue for $t {
            fn midpoint(low: Self, high: Self) -> Option<Self> {
                if !(low < high) {
                    return None;
                }
                let mid = low * 0.5 + high * 0.5;
                // Rounds onto an endpoint once the range reaches the
                // granularity of the representation.
                (mid > low && mid < high).then_some(mid)
            }

            fn successor(value: Self) -> Self {
                value.next_up()
            }

            fn count(_low: Self, _high: Self) -> Option<u64> {
                None
            }

            fn span(low: Self, high: Self) -> f64 {
                (high - low) as f64
            }

            fn tile_index(value: Self, origin: Self, extent: Self) -> u64 {
                ((value - origin) / extent).floor() as u64
            }

            fn tile_end(origin: Self, extent: Self, tile: u64) -> Self {
                origin + (tile as $t + 1.0) * extent
            }
        }
    )*};
}

real_dimension_value!(f32, f64);

/// A 1-D range, inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DimRange<T> {
    pub low: T,
    pub high: T,
}

impl<T: DimensionValue> DimRange<T> {
    pub fn new(low: T, high: T) -> TesseraResult<Self> {
        if !(low <= high) {
            tessera_bail!("invalid range [{:?}, {:?}]", low, high);
        }
        Ok(Self { low, high })
    }

    pub fn count(&self) -> Option<u64> {
        T::count(self.low, self.high)
    }

    pub fn span(&self) -> f64 {
        T::span(self.low, self.high)
    }

    pub fn midpoint(&self) -> Option<T> {
        T::midpoint(self.low, self.high)
    }

    pub fn contains(&self, value: T) -> bool {
        self.low <= value && value <= self.high
    }

    pub fn covers(&self, other: &DimRange<T>) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    /// Split into `[low, point]` and `(point, high]`.
    pub fn split_at(&self, point: T) -> TesseraResult<(Self, Self)> {
        if !(self.low <= point) || !(point < self.high) {
            tessera_bail!(
                "splitting point {:?} outside range [{:?}, {:?}]",
                point,
                self.low,
                self.high
            );
        }
        Ok((
            Self {
                low: self.low,
                high: point,
            },
            Self {
                low: T::successor(point),
                high: self.high,
            },
        ))
    }
}
