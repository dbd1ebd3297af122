#![deny(dead_code)]
#![deny(unused_variables)]

pub mod context;
pub mod service;
pub mod status;

pub use context::{fit_budget, format_context};
pub use service::{GuideOutcome, RetrievalService};
pub use status::StatusBoard;
