//! # IMEX Common Library
//!
//! Shared messaging substrate for all IMEX workers including:
//! - Message envelope (header with causal parent chain)
//! - Broker channel contract and the embedded in-process broker
//! - Producer with publisher confirms
//! - Consumer delivery lifecycle (decode / process / ack / nack)
//! - Batched publish-then-confirm relay
//! - Fatal error escalation channel
//! - Configuration loading
//! - Shared health endpoint

pub mod api;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod fatal;
pub mod messages;
pub mod producer;
pub mod relay;

pub use error::{Error, Result};
pub use fatal::{fatal_channel, FatalError, FatalEvents, FatalHook};
pub use messages::MessageHeader;
pub use producer::Producer;
