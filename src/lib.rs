// lib.rs
pub mod bad_index;
pub mod balance;
pub mod builder;
pub mod cache;
pub mod cleaner;
pub mod cluster;
pub mod config;
pub mod contacts;
pub mod error;
pub mod expected;
pub mod export;
pub mod genome;
pub mod mapping;
pub mod pipeline;
pub mod pool;
pub mod reorder;
pub mod stats;
