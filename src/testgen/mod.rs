pub mod aggregator;
pub mod coverage;
pub mod extract;
pub mod pipeline;

pub use aggregator::SampleAggregator;
pub use pipeline::{CancelToken, Kickoff, Pipeline, PipelineOutcome};
