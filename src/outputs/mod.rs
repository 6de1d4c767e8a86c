//! Reference output sinks. Illustrative, not an exhaustive plugin catalog;
//! see `SPEC_FULL.md` §1 Non-goals.

pub mod file;
