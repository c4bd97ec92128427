//! Dispatch engine: the poll loop that drains the work queue.

pub mod dispatcher;

pub use dispatcher::{BatchReport, Dispatcher};
