//! councilwatch: decide which archived meetings gained documents or video
//! upstream, reprocess only those, and tell an operator what changed.

pub mod archive;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod lock;
pub mod notifier;
pub mod orchestrator;
pub mod reprocess;
pub mod types;
pub mod video_index;
