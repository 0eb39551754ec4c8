pub mod client;
pub mod paginate;

pub use client::{FetchClient, FetchResponse, HttpTransport, RetryPolicy, Transport};
pub use paginate::{ChunkSink, CollectReport, Collector, PagedResource, SinkFlow};
