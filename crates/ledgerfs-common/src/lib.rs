//! LedgerFS Common - Shared types and utilities
//!
//! This crate provides the error type and configuration structures
//! used across all LedgerFS components.

pub mod config;
pub mod error;

pub use config::{
    CheckpointConfig, Config, JournalConfig, LoggingConfig, ReplayMode, ReplicationConfig,
    StorageConfig,
};
pub use error::{Error, Result};
