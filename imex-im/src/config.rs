//! Identifier mapper configuration

use serde::Deserialize;

use imex_common::config::{ConsumerOptions, ProducerOptions};
use imex_common::relay::RelayOptions;

/// Tuning for the identifier rewrite itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwapperOptions {
    /// Tag holding the identifier to substitute
    pub identifier_tag: String,
    /// Prefix stamped onto hashed pseudonyms
    pub pseudonym_prefix: String,
}

impl Default for SwapperOptions {
    fn default() -> Self {
        Self {
            identifier_tag: "PatientID".into(),
            pseudonym_prefix: "IMEX-".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentifierMapperOptions {
    /// Consumer of inbound image file messages
    pub consumer: ConsumerOptions,
    /// Producer of mapped image file messages
    pub producer: ProducerOptions,
    pub relay: RelayOptions,
    pub swapper: SwapperOptions,
    /// Port the health endpoint listens on
    pub health_port: u16,
}

impl Default for IdentifierMapperOptions {
    fn default() -> Self {
        Self {
            consumer: ConsumerOptions {
                queue_name: "ImageFileQueue".into(),
                prefetch_count: 16,
                requeue_on_fatal: true,
            },
            producer: ProducerOptions {
                exchange_name: "MappedFileExchange".into(),
                routing_key: "extract.file.mapped".into(),
                ..ProducerOptions::default()
            },
            relay: RelayOptions::default(),
            swapper: SwapperOptions::default(),
            health_port: 5742,
        }
    }
}
