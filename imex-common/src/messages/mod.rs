//! Message types for the IMEX pipeline
//!
//! Every payload that crosses the broker carries a [`MessageHeader`]
//! envelope in the delivery's string-keyed header block, independent of the
//! JSON body encoding. The header records a unique id, the identity of the
//! producing process, and the causal chain of ancestor message ids.

mod extraction;

pub use extraction::{
    ExtractMessage, ExtractedFileStatus, ExtractedFileStatusMessage, ExtractionRequestInfoMessage,
    ImageFileMessage,
};

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Marker trait for payloads that can travel through the broker.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Header map key for the unique message id.
pub const KEY_MESSAGE_GUID: &str = "MessageGuid";
/// Header map key for the producing process id.
pub const KEY_PRODUCER_PROCESS_ID: &str = "ProducerProcessID";
/// Header map key for the producing executable name.
pub const KEY_PRODUCER_EXECUTABLE: &str = "ProducerExecutableName";
/// Header map key for the original publish timestamp (unix seconds).
pub const KEY_ORIGINAL_PUBLISH_TIMESTAMP: &str = "OriginalPublishTimestamp";
/// Header map key for the ancestor chain, guids joined with `->`.
pub const KEY_PARENTS: &str = "Parents";

const PARENT_SEPARATOR: &str = "->";

/// Identity of the process producing messages, stamped into every envelope.
#[derive(Debug, Clone)]
pub struct ProducerIdentity {
    pub executable: String,
    pub process_id: u32,
}

impl ProducerIdentity {
    /// Identity for the current process.
    pub fn current(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            process_id: std::process::id(),
        }
    }
}

/// Self-describing envelope attached to every published payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Globally unique id, assigned at creation, immutable
    pub message_guid: Uuid,
    /// Process id of the producer
    pub producer_process_id: u32,
    /// Executable name of the producer
    pub producer_executable: String,
    /// When the first message in this chain was published
    pub original_publish_timestamp: DateTime<Utc>,
    /// Ordered ancestor message ids, oldest first; grows by one per hop
    pub parents: Vec<Uuid>,
}

impl MessageHeader {
    /// New envelope with a fresh id and an empty parent chain.
    pub fn new(identity: &ProducerIdentity) -> Self {
        Self {
            message_guid: Uuid::new_v4(),
            producer_process_id: identity.process_id,
            producer_executable: identity.executable.clone(),
            original_publish_timestamp: Utc::now(),
            parents: Vec::new(),
        }
    }

    /// New envelope derived from the message being responded to: the parent
    /// chain is the prior chain with the prior message's id appended.
    pub fn in_response_to(identity: &ProducerIdentity, parent: &MessageHeader) -> Self {
        let mut parents = parent.parents.clone();
        debug_assert!(
            !parents.contains(&parent.message_guid),
            "parent chain already contains the responding message id"
        );
        parents.push(parent.message_guid);

        Self {
            message_guid: Uuid::new_v4(),
            producer_process_id: identity.process_id,
            producer_executable: identity.executable.clone(),
            // The chain keeps the timestamp of its originating message
            original_publish_timestamp: parent.original_publish_timestamp,
            parents,
        }
    }

    /// Whether `guid` appears anywhere in this message's ancestry.
    pub fn is_descendant_of(&self, guid: &Uuid) -> bool {
        self.parents.contains(guid)
    }

    /// Write the envelope fields into a delivery header map.
    pub fn populate_header_map(&self, map: &mut HashMap<String, String>) {
        map.insert(KEY_MESSAGE_GUID.into(), self.message_guid.to_string());
        map.insert(
            KEY_PRODUCER_PROCESS_ID.into(),
            self.producer_process_id.to_string(),
        );
        map.insert(
            KEY_PRODUCER_EXECUTABLE.into(),
            self.producer_executable.clone(),
        );
        map.insert(
            KEY_ORIGINAL_PUBLISH_TIMESTAMP.into(),
            self.original_publish_timestamp.timestamp().to_string(),
        );
        let chain: Vec<String> = self.parents.iter().map(Uuid::to_string).collect();
        map.insert(KEY_PARENTS.into(), chain.join(PARENT_SEPARATOR));
    }

    /// Parse an envelope back out of a delivery header map.
    ///
    /// Rejects missing or malformed fields, and any parent chain containing
    /// a repeated guid (a cycle would indicate a malformed relay).
    pub fn from_header_map(map: &HashMap<String, String>) -> Result<Self> {
        let message_guid = parse_guid(required(map, KEY_MESSAGE_GUID)?)?;
        let producer_process_id = required(map, KEY_PRODUCER_PROCESS_ID)?
            .parse::<u32>()
            .map_err(|e| Error::MalformedHeader(format!("{KEY_PRODUCER_PROCESS_ID}: {e}")))?;
        let producer_executable = required(map, KEY_PRODUCER_EXECUTABLE)?.to_string();

        let ts = required(map, KEY_ORIGINAL_PUBLISH_TIMESTAMP)?
            .parse::<i64>()
            .map_err(|e| Error::MalformedHeader(format!("{KEY_ORIGINAL_PUBLISH_TIMESTAMP}: {e}")))?;
        let original_publish_timestamp = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| Error::MalformedHeader(format!("timestamp out of range: {ts}")))?;

        let parents_raw = required(map, KEY_PARENTS)?;
        let mut parents = Vec::new();
        if !parents_raw.is_empty() {
            for part in parents_raw.split(PARENT_SEPARATOR) {
                parents.push(parse_guid(part)?);
            }
        }

        let header = Self {
            message_guid,
            producer_process_id,
            producer_executable,
            original_publish_timestamp,
            parents,
        };
        header.check_for_cycle()?;
        Ok(header)
    }

    fn check_for_cycle(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::with_capacity(self.parents.len() + 1);
        for guid in self.parents.iter().chain(std::iter::once(&self.message_guid)) {
            if !seen.insert(guid) {
                return Err(Error::MalformedHeader(format!(
                    "parent chain contains a cycle at {guid}"
                )));
            }
        }
        Ok(())
    }
}

fn required<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::MalformedHeader(format!("missing header key {key}")))
}

fn parse_guid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| Error::MalformedHeader(format!("bad guid {raw:?}: {e}")))
}
