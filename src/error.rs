use thiserror::Error;

use crate::Scalar;

/// Errors that can occur when querying or growing a cover tree.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum CoverTreeError {
    /// Returned when a query runs against a tree with no root.
    #[error("tree is empty; insert a point first")]
    EmptyTree,
    /// Returned when a point lies outside the cover radius of the
    /// coarsest level, so no parent can be chosen without breaking the
    /// covering invariant. The tree was configured with a level range
    /// too narrow for the spread of the data.
    #[error("point at distance {distance} cannot be covered within the level range (radius {radius})")]
    InvalidLevelRange {
        /// Smallest distance from the rejected point to the cover set.
        distance: Scalar,
        /// Largest cover radius the level range allows for a parent.
        radius: Scalar,
    },
}
