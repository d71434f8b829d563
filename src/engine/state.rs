//! Partition state rebuilt from the log.
//!
//! State only changes by applying events. The same `apply_event` runs when
//! a processor appends an event and when the log is replayed after a
//! restart, so both paths always agree.

use crate::distribution::{CommandDistributionRecord, DistributionState};
use crate::identity::{GroupRecord, GroupState};
use crate::record::{
    decode_partition_id, encode_key, GroupIntent, Intent, PartitionId, RecordError, ValueType,
};

/// Generates keys unique across the cluster.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    partition_id: PartitionId,
    next_local: i64,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            next_local: 1,
        }
    }

    pub fn next_key(&mut self) -> i64 {
        let key = encode_key(self.partition_id, self.next_local);
        self.next_local += 1;
        key
    }

    /// Never hand out `key` again if it was generated by this partition.
    pub fn set_key_if_higher(&mut self, key: i64) {
        if key <= 0 || decode_partition_id(key) != self.partition_id {
            return;
        }
        let local = key - encode_key(self.partition_id, 0);
        if local >= self.next_local {
            self.next_local = local + 1;
        }
    }
}

/// Everything one partition knows.
#[derive(Debug, Clone)]
pub struct EngineState {
    keys: KeyGenerator,
    pub group: GroupState,
    pub distribution: DistributionState,
    saved_keys: Option<KeyGenerator>,
}

impl EngineState {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            keys: KeyGenerator::new(partition_id),
            group: GroupState::default(),
            distribution: DistributionState::default(),
            saved_keys: None,
        }
    }

    /// Start recording changes so a rejected command can be undone. Only
    /// the entries a command touches are saved.
    pub fn checkpoint(&mut self) {
        self.saved_keys = Some(self.keys.clone());
        self.group.checkpoint();
        self.distribution.checkpoint();
    }

    /// Keep every change since `checkpoint`.
    pub fn release_checkpoint(&mut self) {
        self.saved_keys = None;
        self.group.release_checkpoint();
        self.distribution.release_checkpoint();
    }

    /// Undo every change since `checkpoint`, including generated keys.
    pub fn restore_checkpoint(&mut self) {
        if let Some(keys) = self.saved_keys.take() {
            self.keys = keys;
        }
        self.group.restore_checkpoint();
        self.distribution.restore_checkpoint();
    }

    pub fn next_key(&mut self) -> i64 {
        self.keys.next_key()
    }

    /// Apply an event to state. Commands and rejections never change state.
    pub fn apply_event(
        &mut self,
        key: i64,
        value_type: ValueType,
        intent: Intent,
        payload: &[u8],
    ) -> Result<(), RecordError> {
        if intent.value_type() != value_type {
            return Err(RecordError::IntentMismatch { value_type, intent });
        }
        self.keys.set_key_if_higher(key);

        match intent {
            Intent::Group(GroupIntent::Created) => {
                let record: GroupRecord = serde_json::from_slice(payload)?;
                self.group.apply_created(record);
            }
            Intent::Group(GroupIntent::Updated) => {
                let record: GroupRecord = serde_json::from_slice(payload)?;
                self.group.apply_updated(record);
            }
            Intent::CommandDistribution(intent) if intent.is_event() => {
                let record: CommandDistributionRecord = serde_json::from_slice(payload)?;
                self.distribution.apply(key, intent, record);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_partition_scoped() {
        let mut keys = KeyGenerator::new(2);
        let first = keys.next_key();
        assert_eq!(decode_partition_id(first), 2);
        assert_eq!(keys.next_key(), first + 1);
    }

    #[test]
    fn test_replayed_keys_are_not_reused() {
        let mut keys = KeyGenerator::new(1);
        keys.set_key_if_higher(encode_key(1, 40));
        keys.set_key_if_higher(encode_key(3, 900));
        assert_eq!(keys.next_key(), encode_key(1, 41));
    }

    #[test]
    fn test_apply_event_rejects_foreign_intent() {
        let mut state = EngineState::new(1);
        let result = state.apply_event(
            1,
            ValueType::Group,
            Intent::CommandDistribution(crate::record::CommandDistributionIntent::Started),
            b"{}",
        );
        assert!(matches!(result, Err(RecordError::IntentMismatch { .. })));
    }

    #[test]
    fn test_group_events_update_state() {
        let mut state = EngineState::new(1);
        let created = serde_json::to_vec(&GroupRecord::new(encode_key(1, 1), "ops")).unwrap();
        state
            .apply_event(
                encode_key(1, 1),
                ValueType::Group,
                GroupIntent::Created.into(),
                &created,
            )
            .unwrap();

        assert_eq!(state.group.key_by_name("ops"), Some(encode_key(1, 1)));
        assert_eq!(state.next_key(), encode_key(1, 2));
    }

    #[test]
    fn test_restore_checkpoint_undoes_command() {
        let mut state = EngineState::new(1);
        let ops = serde_json::to_vec(&GroupRecord::new(encode_key(1, 1), "ops")).unwrap();
        state
            .apply_event(encode_key(1, 1), ValueType::Group, GroupIntent::Created.into(), &ops)
            .unwrap();

        state.checkpoint();
        let key = state.next_key();
        let dev = serde_json::to_vec(&GroupRecord::new(key, "dev")).unwrap();
        state
            .apply_event(key, ValueType::Group, GroupIntent::Created.into(), &dev)
            .unwrap();
        state.restore_checkpoint();

        assert_eq!(state.group.key_by_name("dev"), None);
        assert_eq!(state.group.len(), 1);
        assert_eq!(state.next_key(), key);
    }
}
