//! Core data model.
//!
//! A work item is a command or domain event waiting to be handed to a
//! handler. Its status is never stored; it is derived from timestamps and
//! the attempt counter.

pub mod work;

pub use work::{NewWorkItem, Status, WorkFilter, WorkId, WorkItem};
