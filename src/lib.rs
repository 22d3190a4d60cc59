//! Courier - RPC and fan-out logging over a message broker
//!
//! Callers get blocking-call semantics over a shared work queue with
//! correlated replies on private reply queues; workers compete for requests
//! with manual acknowledgment. Independently, log events are broadcast over
//! a fan-out exchange to subscribers that persist them in a sink.

pub mod broker;
pub mod config;
pub mod logs;
pub mod rpc;
pub mod sink;
pub mod utils;
pub mod worker;
