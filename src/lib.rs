//! Chat automator: rule-driven automation over messaging events.

pub mod calendar;
pub mod channels;
pub mod config;
pub mod email;
pub mod entities;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod ledger;
pub mod nlp;
pub mod pipeline;
pub mod queue;
pub mod rules;
pub mod store;
