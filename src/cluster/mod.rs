//! Module that contains the cluster membership view and the partitioning schemes built on top of it
pub mod error;
pub mod partitioning;
pub mod state;
