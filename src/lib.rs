//! Resumable review pipeline.
//!
//! A workflow moves through a fixed sequence of phases. The two item phases
//! (screening and extraction) send every item to two independent reviewers
//! and escalate disagreements to an adjudicator. Every outcome and phase
//! checkpoint is durable, so an interrupted run picks up where it stopped.

pub mod cancel;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod judge;
pub mod orchestrator;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
pub mod ui;

pub use sysrev_common as common;
