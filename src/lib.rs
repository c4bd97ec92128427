//! # outbound
//!
//! Durable work-queue dispatcher backed by Postgres.
//!
//! Commands and domain events are written to a `work_queue` table (ideally
//! in the same transaction as the business change that produced them) and
//! delivered to handlers at least once. Concurrent dispatchers claim disjoint
//! batches with `FOR UPDATE SKIP LOCKED`; failures are retried with linear
//! backoff and dead-lettered once the retry budget is spent. Broker
//! publishing goes through a primary/secondary transport router with
//! background recovery.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod queue;
pub mod retry;
pub mod telemetry;
pub mod transport;
