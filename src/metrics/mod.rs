//! Metrics: process-wide registry, ring-buffer history, periodic scraper

pub mod registry;
pub mod scraper;
pub mod series;

pub use registry::{Instruments, MetricsError, MetricsRegistry};
pub use scraper::MetricsScraper;
pub use series::{Aggregates, MetricHistory};
