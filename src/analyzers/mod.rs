//! Zone analysis stages.
//!
//! Raw tables are normalized into per-zone snapshots, scored for stress,
//! correlated, matched against rules, answered with simulated actions and
//! finally rolled up into ranked recommendations. Hourly congestion bands
//! are built from the raw traffic table alongside.

pub mod anomaly;
pub mod correlate;
pub mod decide;
pub mod grade;
pub mod insights;
pub mod normalize;
pub mod rules;
pub mod stress;
pub mod types;
pub mod utility;
