pub mod analysis;
pub mod archive;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod sources;
pub mod store;
