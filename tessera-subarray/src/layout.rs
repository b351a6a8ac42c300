use std::fmt::{Display, Formatter};

/// Traversal order of a subarray's flattened N-D range enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layout {
    /// The last dimension varies fastest.
    RowMajor,
    /// The first dimension varies fastest.
    ColMajor,
    /// The array's global (tile) order; a single range per dimension.
    GlobalOrder,
    /// No order guarantee on the produced results.
    Unordered,
}

impl Display for Layout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Layout::RowMajor => "row-major",
            Layout::ColMajor => "col-major",
            Layout::GlobalOrder => "global-order",
            Layout::Unordered => "unordered",
        };
        write!(f, "{name}")
    }
}
