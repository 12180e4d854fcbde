//! Statistics, cleaning and daily aggregation of turbine readings.
//!
//! Submodules:
//! - `statistics`: windowed descriptive statistics and anomaly bounds.
//! - `cleaning`:   splits pending raw readings into clean and anomalous
//!   ones and imputes absent values.
//! - `summary`:    daily per-turbine power summaries and anomaly counts.

pub mod cleaning;
pub mod statistics;
pub mod summary;
