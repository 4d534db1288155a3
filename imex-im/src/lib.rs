//! imex-im (Identifier Mapper) - Identifier substitution stage
//!
//! Consumes per-image tag messages, substitutes the patient identifier via
//! a pluggable swapper, and republishes downstream using the batched
//! publish-then-confirm relay: consumed deliveries are acked only after the
//! batch carrying their mapped counterparts is confirmed by the broker.

pub mod config;
pub mod consumer;
pub mod swapper;

pub use consumer::IdentifierMapperConsumer;
pub use swapper::{HashingSwapper, IdentifierSwapper, SwapError};
