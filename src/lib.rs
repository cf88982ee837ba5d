//! Parget Core Library
//!
//! This library provides the core functionality for the parget download
//! manager, which turns URLs (direct links or file-host pages) into
//! segmented, resumable, checksum-verified downloads on local disk.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Engine configuration and validation
//! - [`download`] - Segmented HTTP transfer engine with range support
//! - [`job`] - Job lifecycle, checkpointing, and the manager facade
//! - [`plugin`] - Source resolution plugins for file-hosting sites

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod job;
pub mod plugin;
#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use config::{Config, ConfigError, DEFAULT_MAX_RETRIES};
pub use download::{
    FailureType, HttpClient, ProbeResult, ProgressSample, RetryDecision, RetryPolicy, Segment,
    SegmentState, TransferError, classify_error, plan_segments,
};
pub use job::{
    CHECKPOINT_INTERVAL, CheckpointError, CheckpointStore, ControlError, DownloadManager, JobId,
    JobSnapshot, JobState, ProgressSubscription, ResumeCheckpoint, SubmitRequest, TARGET_FRESHNESS,
};
pub use plugin::{
    DirectPlugin, DownloadTarget, ExtractError, MediafirePlugin, PixeldrainPlugin, Plugin,
    PluginDescriptor, PluginRegistry, build_plugin_client, default_registry,
};
