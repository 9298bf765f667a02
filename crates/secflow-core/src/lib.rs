pub mod adapters;
pub mod aggregation;
pub mod config;
pub mod execution;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod sqlite;
pub mod templates;
