//! A library for nearest neighbour search based on a level-indexed cover tree.
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

type Scalar = f64;

mod error;
pub use error::CoverTreeError;

mod metric;
pub use metric::Distance;
pub use metric::Metric;


mod tree;
pub use tree::CoverTree;
pub use tree::CoverTreeBuilder;
pub use tree::{Neighbour, QueryResult};
