//! Utility processors and batch steps
//!
//! Small, composable stages: header reshaping (filter, map, rename),
//! tagging, stream control (head, decouple) and batch steps (sort,
//! variance filter).

mod decouple;
mod filter;
mod head;
mod mapper;
mod sort;
mod tags;

pub use decouple::Decoupler;
pub use filter::{MetricFilter, MetricVarianceFilter};
pub use head::Head;
pub use mapper::{MetricMapper, MetricRenamer};
pub use sort::SampleSorter;
pub use tags::Tagger;
