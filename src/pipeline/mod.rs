//! Event pipeline.
//!
//! Stored event → queue item ([`types::QueueEvent`]) → worker claims it →
//! [`processor::EventProcessor`] selects rules, extracts entities, runs
//! actions and writes the ledger.

pub mod processor;
pub mod types;

pub use processor::EventProcessor;
pub use types::QueueEvent;
