//! Record protocol.
//!
//! Everything written to a partition's log is a record: a command, an event,
//! or a command rejection. Records carry a closed set of value types and
//! intents, so processor lookup is a static `(ValueType, Intent)` match
//! rather than open-ended reflection.
//!
//! - `LogAppendEntry`: a record draft handed to the log writer (no position yet)
//! - `LogEntry`: a sequenced record read back from the log
//! - `TypedRecord<T>`: a `LogEntry` with its payload decoded into `T`

pub mod codec;

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Partition identifier. Partitions are numbered from 1.
pub type PartitionId = u32;

/// Position/key value meaning "none".
pub const NO_POSITION: i64 = -1;

/// Errors raised while encoding or decoding record payloads.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Expected value type {expected}, but record has {actual}")]
    ValueTypeMismatch {
        expected: ValueType,
        actual: ValueType,
    },

    #[error("Intent {intent} does not belong to value type {value_type}")]
    IntentMismatch { value_type: ValueType, intent: Intent },
}

// ============================================================================
// Protocol enums
// ============================================================================

/// Kind of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

impl RecordType {
    pub(crate) fn code(self) -> u8 {
        match self {
            RecordType::Command => 0,
            RecordType::Event => 1,
            RecordType::CommandRejection => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RecordType::Command),
            1 => Some(RecordType::Event),
            2 => Some(RecordType::CommandRejection),
            _ => None,
        }
    }
}

/// Value type of a record's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Group,
    CommandDistribution,
}

impl ValueType {
    pub(crate) fn code(self) -> u8 {
        match self {
            ValueType::Group => 0,
            ValueType::CommandDistribution => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ValueType::Group),
            1 => Some(ValueType::CommandDistribution),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Group => f.write_str("GROUP"),
            ValueType::CommandDistribution => f.write_str("COMMAND_DISTRIBUTION"),
        }
    }
}

/// Intents of the `Group` value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupIntent {
    Create,
    Created,
    Update,
    Updated,
}

impl GroupIntent {
    pub fn is_event(self) -> bool {
        matches!(self, GroupIntent::Created | GroupIntent::Updated)
    }
}

/// Intents of the `CommandDistribution` value type.
///
/// `Acknowledge` is the only command; everything else is bookkeeping written
/// by the origin partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandDistributionIntent {
    Started,
    Enqueued,
    Distributing,
    Acknowledge,
    Acknowledged,
    Finished,
}

impl CommandDistributionIntent {
    pub fn is_event(self) -> bool {
        !matches!(self, CommandDistributionIntent::Acknowledge)
    }
}

/// Intent of a record, tagged by its value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Group(GroupIntent),
    CommandDistribution(CommandDistributionIntent),
}

impl Intent {
    /// The value type this intent belongs to.
    pub fn value_type(self) -> ValueType {
        match self {
            Intent::Group(_) => ValueType::Group,
            Intent::CommandDistribution(_) => ValueType::CommandDistribution,
        }
    }

    pub fn is_event(self) -> bool {
        match self {
            Intent::Group(intent) => intent.is_event(),
            Intent::CommandDistribution(intent) => intent.is_event(),
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Intent::Group(intent) => match intent {
                GroupIntent::Create => 0,
                GroupIntent::Created => 1,
                GroupIntent::Update => 2,
                GroupIntent::Updated => 3,
            },
            Intent::CommandDistribution(intent) => match intent {
                CommandDistributionIntent::Started => 0,
                CommandDistributionIntent::Enqueued => 1,
                CommandDistributionIntent::Distributing => 2,
                CommandDistributionIntent::Acknowledge => 3,
                CommandDistributionIntent::Acknowledged => 4,
                CommandDistributionIntent::Finished => 5,
            },
        }
    }

    pub(crate) fn from_code(value_type: ValueType, code: u8) -> Option<Self> {
        let intent = match value_type {
            ValueType::Group => Intent::Group(match code {
                0 => GroupIntent::Create,
                1 => GroupIntent::Created,
                2 => GroupIntent::Update,
                3 => GroupIntent::Updated,
                _ => return None,
            }),
            ValueType::CommandDistribution => Intent::CommandDistribution(match code {
                0 => CommandDistributionIntent::Started,
                1 => CommandDistributionIntent::Enqueued,
                2 => CommandDistributionIntent::Distributing,
                3 => CommandDistributionIntent::Acknowledge,
                4 => CommandDistributionIntent::Acknowledged,
                5 => CommandDistributionIntent::Finished,
                _ => return None,
            }),
        };
        Some(intent)
    }
}

impl From<GroupIntent> for Intent {
    fn from(intent: GroupIntent) -> Self {
        Intent::Group(intent)
    }
}

impl From<CommandDistributionIntent> for Intent {
    fn from(intent: CommandDistributionIntent) -> Self {
        Intent::CommandDistribution(intent)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Group(intent) => write!(f, "{:?}", intent),
            Intent::CommandDistribution(intent) => write!(f, "{:?}", intent),
        }
    }
}

/// Reason a command was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    ProcessingError,
}

/// Rejection details attached to a `CommandRejection` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

impl RecordRejection {
    pub fn new(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            rejection_type,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Marks a command that arrived from another partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionMetadata {
    /// Partition that accepted the command and is tracking its distribution.
    pub origin_partition: PartitionId,
}

/// Out-of-band record metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RecordRejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<DistributionMetadata>,
}

impl RecordMetadata {
    pub fn is_empty(&self) -> bool {
        self.rejection.is_none() && self.distribution.is_none()
    }
}

/// A typed record payload.
pub trait RecordValue: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync {
    const VALUE_TYPE: ValueType;
}

/// A record draft handed to the log writer. Positions are assigned by the
/// sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppendEntry {
    pub key: i64,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub metadata: RecordMetadata,
    pub payload: Bytes,
}

impl LogAppendEntry {
    /// Build a record of the given type from a typed value.
    pub fn new<T: RecordValue>(
        key: i64,
        record_type: RecordType,
        intent: impl Into<Intent>,
        value: &T,
    ) -> Result<Self, RecordError> {
        let intent = intent.into();
        if intent.value_type() != T::VALUE_TYPE {
            return Err(RecordError::IntentMismatch {
                value_type: T::VALUE_TYPE,
                intent,
            });
        }
        Ok(Self {
            key,
            record_type,
            value_type: T::VALUE_TYPE,
            intent,
            metadata: RecordMetadata::default(),
            payload: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    /// Build a command record. User commands usually pass `NO_POSITION` as key.
    pub fn command<T: RecordValue>(
        key: i64,
        intent: impl Into<Intent>,
        value: &T,
    ) -> Result<Self, RecordError> {
        Self::new(key, RecordType::Command, intent, value)
    }

    /// Build an event record.
    pub fn event<T: RecordValue>(
        key: i64,
        intent: impl Into<Intent>,
        value: &T,
    ) -> Result<Self, RecordError> {
        Self::new(key, RecordType::Event, intent, value)
    }

    /// Approximate encoded length, used for fragment size checks.
    pub fn approximate_length(&self) -> usize {
        codec::ENTRY_HEADER_LENGTH + self.payload.len()
    }
}

/// A sequenced record read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub position: i64,
    pub source_position: i64,
    pub key: i64,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub metadata: RecordMetadata,
    pub payload: Bytes,
}

impl LogEntry {
    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }

    /// Whether this command was distributed here from another partition.
    pub fn is_distributed(&self) -> bool {
        self.metadata.distribution.is_some()
    }

    /// Decode the payload into its typed value.
    pub fn value<T: RecordValue>(&self) -> Result<T, RecordError> {
        if self.value_type != T::VALUE_TYPE {
            return Err(RecordError::ValueTypeMismatch {
                expected: T::VALUE_TYPE,
                actual: self.value_type,
            });
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// A log entry with its payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord<T> {
    pub position: i64,
    pub key: i64,
    pub record_type: RecordType,
    pub intent: Intent,
    pub metadata: RecordMetadata,
    pub value: T,
}

impl<T: RecordValue> TypedRecord<T> {
    pub fn from_entry(entry: &LogEntry) -> Result<Self, RecordError> {
        Ok(Self {
            position: entry.position,
            key: entry.key,
            record_type: entry.record_type,
            intent: entry.intent,
            metadata: entry.metadata.clone(),
            value: entry.value()?,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.metadata.distribution.is_some()
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Number of bits reserved for the per-partition key counter.
pub const KEY_BITS: u32 = 51;

/// Encode a partition-local counter into a cluster-unique key.
pub fn encode_key(partition_id: PartitionId, local_key: i64) -> i64 {
    ((partition_id as i64) << KEY_BITS) + local_key
}

/// Decode the partition that generated a key.
pub fn decode_partition_id(key: i64) -> PartitionId {
    (key >> KEY_BITS) as PartitionId
}
