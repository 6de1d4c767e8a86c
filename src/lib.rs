//! A lightweight, pluggable metrics collection agent.
//!
//! The agent periodically invokes a set of [inputs](input) to gather
//! measurements, funnels them through a single fan-in channel, and hands
//! them to one or more [outputs](output), each backed by a bounded
//! [`buffer`].
//!
//! ```text
//! input --\                                /--> output (buffer, batches)
//! input ---> accumulator --> fan-in channel ---> output (buffer, batches)
//! input --/                                \--> output (buffer, batches)
//! ```
//!
//! The [`agent`] module wires these pieces together and drives the
//! scheduling, flushing and shutdown of the whole pipeline.

pub mod accumulator;
pub mod agent;
pub mod buffer;
pub mod error;
pub mod input;
pub mod inputs;
pub mod metric;
pub mod output;
pub mod outputs;
pub mod serializer;
pub mod version;
