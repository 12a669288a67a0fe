//! Testing utilities for reportflow.
//!
//! This module provides:
//! - A scripted HTTP client that replays canned replies and records requests
//! - Recording and failing pipeline stages
//! - An in-memory record sink
//! - Record and lookup fixtures

mod fixtures;
mod mocks;

pub use fixtures::{course_record, course_records, lookup_entry, write_json_file};
pub use mocks::{FailingStage, MemorySink, RecordingStage, ScriptedHttpClient, ScriptedReply};
