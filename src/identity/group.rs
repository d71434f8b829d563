//! Groups: named identity entities known to every partition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::distribution::DistributionQueue;
use crate::engine::{DistributedProcessor, ProcessingContext, ProcessingError, ProcessingResult};
use crate::record::{GroupIntent, RecordValue, RejectionType, TypedRecord, ValueType, NO_POSITION};

/// Value of every `Group` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Assigned by the accepting partition. `NO_POSITION` on CREATE commands.
    #[serde(default = "no_key")]
    pub group_key: i64,
    pub name: String,
}

fn no_key() -> i64 {
    NO_POSITION
}

impl GroupRecord {
    pub fn new(group_key: i64, name: impl Into<String>) -> Self {
        Self {
            group_key,
            name: name.into(),
        }
    }

    /// CREATE command value: no key yet.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(NO_POSITION, name)
    }
}

impl RecordValue for GroupRecord {
    const VALUE_TYPE: ValueType = ValueType::Group;
}

/// Prior value of one index slot, restored on rollback.
#[derive(Debug, Clone)]
enum GroupUndo {
    Key(i64, Option<GroupRecord>),
    Name(String, Option<i64>),
}

/// Groups of one partition, indexed by key and by name.
#[derive(Debug, Clone, Default)]
pub struct GroupState {
    by_key: HashMap<i64, GroupRecord>,
    by_name: HashMap<String, i64>,
    journal: Option<Vec<GroupUndo>>,
}

impl GroupState {
    pub fn apply_created(&mut self, group: GroupRecord) {
        self.put_name(group.name.clone(), Some(group.group_key));
        self.put_key(group.group_key, Some(group));
    }

    pub fn apply_updated(&mut self, group: GroupRecord) {
        let stale_name = self
            .by_key
            .get(&group.group_key)
            .map(|previous| previous.name.clone())
            .filter(|name| self.by_name.get(name) == Some(&group.group_key));
        if let Some(name) = stale_name {
            self.put_name(name, None);
        }
        self.apply_created(group);
    }

    fn put_key(&mut self, group_key: i64, group: Option<GroupRecord>) {
        let previous = match group {
            Some(group) => self.by_key.insert(group_key, group),
            None => self.by_key.remove(&group_key),
        };
        if let Some(journal) = &mut self.journal {
            journal.push(GroupUndo::Key(group_key, previous));
        }
    }

    fn put_name(&mut self, name: String, group_key: Option<i64>) {
        let previous = match group_key {
            Some(group_key) => self.by_name.insert(name.clone(), group_key),
            None => self.by_name.remove(&name),
        };
        if let Some(journal) = &mut self.journal {
            journal.push(GroupUndo::Name(name, previous));
        }
    }

    /// Start recording changes so they can be undone.
    pub(crate) fn checkpoint(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub(crate) fn release_checkpoint(&mut self) {
        self.journal = None;
    }

    /// Undo every change since `checkpoint`.
    pub(crate) fn restore_checkpoint(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for undo in journal.into_iter().rev() {
            match undo {
                GroupUndo::Key(group_key, previous) => self.put_key(group_key, previous),
                GroupUndo::Name(name, previous) => self.put_name(name, previous),
            }
        }
    }

    pub fn get(&self, group_key: i64) -> Option<&GroupRecord> {
        self.by_key.get(&group_key)
    }

    pub fn key_by_name(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

fn already_exists(name: &str, existing: i64) -> ProcessingError {
    ProcessingError::rejected(
        RejectionType::AlreadyExists,
        format!(
            "Expected to create group with name '{}', but a group with this name already exists (key {})",
            name, existing
        ),
    )
}

fn not_found(group_key: i64) -> ProcessingError {
    ProcessingError::rejected(
        RejectionType::NotFound,
        format!(
            "Expected to update group with key {}, but no such group exists",
            group_key
        ),
    )
}

fn validate_name(name: &str) -> ProcessingResult {
    if name.trim().is_empty() {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidArgument,
            "Expected group name to be non-empty",
        ));
    }
    Ok(())
}

/// GROUP CREATE.
#[derive(Debug, Default)]
pub struct GroupCreateProcessor;

impl DistributedProcessor for GroupCreateProcessor {
    type Value = GroupRecord;

    fn process_new_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<GroupRecord>,
    ) -> ProcessingResult {
        let name = &command.value.name;
        validate_name(name)?;
        if let Some(existing) = ctx.state().group.key_by_name(name) {
            return Err(already_exists(name, existing));
        }

        let key = ctx.next_key();
        let group = GroupRecord::new(key, name.clone());
        ctx.append_event(key, GroupIntent::Created, &group)?;
        ctx.respond_event(key, GroupIntent::Created, &group)?;

        let distributed = TypedRecord {
            value: group,
            ..command.clone()
        };
        ctx.distribution()
            .with_key(key)
            .in_queue(DistributionQueue::Identity)
            .distribute(&distributed)
    }

    fn process_distributed_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<GroupRecord>,
    ) -> ProcessingResult {
        let group = &command.value;
        if ctx.state().group.get(group.group_key).is_some() {
            debug!(group_key = group.group_key, "Group already exists, acknowledging");
            ctx.acknowledge_command(command);
            return Ok(());
        }
        if let Some(existing) = ctx.state().group.key_by_name(&group.name) {
            warn!(
                group_key = group.group_key,
                existing,
                name = %group.name,
                "Distributed group conflicts with a local group, not acknowledging"
            );
            return Err(already_exists(&group.name, existing));
        }

        ctx.append_event(group.group_key, GroupIntent::Created, group)?;
        ctx.acknowledge_command(command);
        Ok(())
    }
}

/// GROUP UPDATE. Renames an existing group.
#[derive(Debug, Default)]
pub struct GroupUpdateProcessor;

impl GroupUpdateProcessor {
    fn validate(ctx: &ProcessingContext<'_>, group: &GroupRecord) -> ProcessingResult {
        validate_name(&group.name)?;
        if ctx.state().group.get(group.group_key).is_none() {
            return Err(not_found(group.group_key));
        }
        match ctx.state().group.key_by_name(&group.name) {
            Some(existing) if existing != group.group_key => Err(ProcessingError::rejected(
                RejectionType::AlreadyExists,
                format!(
                    "Expected to rename group {} to '{}', but a group with this name already exists (key {})",
                    group.group_key, group.name, existing
                ),
            )),
            _ => Ok(()),
        }
    }
}

impl DistributedProcessor for GroupUpdateProcessor {
    type Value = GroupRecord;

    fn process_new_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<GroupRecord>,
    ) -> ProcessingResult {
        let group = &command.value;
        Self::validate(ctx, group)?;

        ctx.append_event(group.group_key, GroupIntent::Updated, group)?;
        ctx.respond_event(group.group_key, GroupIntent::Updated, group)?;

        let distribution_key = ctx.next_key();
        ctx.distribution()
            .with_key(distribution_key)
            .in_queue(DistributionQueue::Identity)
            .distribute(command)
    }

    fn process_distributed_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<GroupRecord>,
    ) -> ProcessingResult {
        let group = &command.value;
        if ctx.state().group.get(group.group_key) == Some(group) {
            debug!(group_key = group.group_key, "Group already updated, acknowledging");
            ctx.acknowledge_command(command);
            return Ok(());
        }
        if let Err(e) = Self::validate(ctx, group) {
            warn!(
                group_key = group.group_key,
                name = %group.name,
                error = %e,
                "Cannot apply distributed group update, not acknowledging"
            );
            return Err(e);
        }

        ctx.append_event(group.group_key, GroupIntent::Updated, group)?;
        ctx.acknowledge_command(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::engine::{CommandResponse, EngineState};
    use crate::record::{
        encode_key, CommandDistributionIntent, DistributionMetadata, Intent, LogEntry,
        RecordMetadata, RecordType,
    };
    use crate::transport::InterPartitionMessage;

    fn command(key: i64, intent: GroupIntent, value: &GroupRecord, origin: Option<u32>) -> LogEntry {
        LogEntry {
            position: 1,
            source_position: NO_POSITION,
            key,
            record_type: RecordType::Command,
            value_type: ValueType::Group,
            intent: intent.into(),
            metadata: RecordMetadata {
                rejection: None,
                distribution: origin.map(|origin_partition| DistributionMetadata { origin_partition }),
            },
            payload: Bytes::from(serde_json::to_vec(value).unwrap()),
        }
    }

    #[test]
    fn test_create_distributes_on_identity_queue() {
        let mut state = EngineState::new(1);
        let entry = command(NO_POSITION, GroupIntent::Create, &GroupRecord::named("ops"), None);
        let typed = TypedRecord::from_entry(&entry).unwrap();

        let mut ctx = ProcessingContext::new(1, 3, &mut state, &entry);
        GroupCreateProcessor.process_new_command(&mut ctx, &typed).unwrap();
        let output = ctx.finish();

        let intents: Vec<Intent> = output.records.iter().map(|r| r.intent).collect();
        assert_eq!(
            intents,
            vec![
                GroupIntent::Created.into(),
                CommandDistributionIntent::Started.into(),
                CommandDistributionIntent::Enqueued.into(),
                CommandDistributionIntent::Distributing.into(),
                CommandDistributionIntent::Enqueued.into(),
                CommandDistributionIntent::Distributing.into(),
            ]
        );
        assert_eq!(output.sends.len(), 2);
        assert!(matches!(
            &output.sends[0].1,
            InterPartitionMessage::Distribute { queue_id: Some(q), .. } if q == "IDENTITY"
        ));
        assert!(matches!(
            output.response,
            Some(CommandResponse::Event { key, .. }) if key == encode_key(1, 1)
        ));
        assert_eq!(state.group.key_by_name("ops"), Some(encode_key(1, 1)));
    }

    #[test]
    fn test_create_rejects_duplicate_name() {
        let mut state = EngineState::new(1);
        state.group.apply_created(GroupRecord::new(encode_key(1, 1), "ops"));
        let entry = command(NO_POSITION, GroupIntent::Create, &GroupRecord::named("ops"), None);
        let typed = TypedRecord::from_entry(&entry).unwrap();

        let mut ctx = ProcessingContext::new(1, 3, &mut state, &entry);
        let result = GroupCreateProcessor.process_new_command(&mut ctx, &typed);
        assert!(matches!(
            result,
            Err(ProcessingError::Expected(ref r)) if r.rejection_type == RejectionType::AlreadyExists
        ));
    }

    #[test]
    fn test_distributed_create_is_idempotent() {
        let key = encode_key(1, 1);
        let mut state = EngineState::new(2);
        state.group.apply_created(GroupRecord::new(key, "ops"));
        let entry = command(key, GroupIntent::Create, &GroupRecord::new(key, "ops"), Some(1));
        let typed = TypedRecord::from_entry(&entry).unwrap();

        let mut ctx = ProcessingContext::new(2, 3, &mut state, &entry);
        GroupCreateProcessor
            .process_distributed_command(&mut ctx, &typed)
            .unwrap();
        let output = ctx.finish();

        assert!(output.records.is_empty());
        assert!(output.response.is_none());
        assert!(matches!(
            output.sends.as_slice(),
            [(1, InterPartitionMessage::Acknowledge { target_partition: 2, .. })]
        ));
    }

    #[test]
    fn test_distributed_create_conflict_is_not_acknowledged() {
        let mut state = EngineState::new(2);
        state.group.apply_created(GroupRecord::new(encode_key(2, 1), "ops"));
        let key = encode_key(1, 1);
        let entry = command(key, GroupIntent::Create, &GroupRecord::new(key, "ops"), Some(1));
        let typed = TypedRecord::from_entry(&entry).unwrap();

        let mut ctx = ProcessingContext::new(2, 3, &mut state, &entry);
        let result = GroupCreateProcessor.process_distributed_command(&mut ctx, &typed);
        assert!(result.is_err());
        assert!(ctx.finish().sends.is_empty());
    }

    #[test]
    fn test_update_requires_existing_group() {
        let mut state = EngineState::new(1);
        let value = GroupRecord::new(encode_key(1, 9), "dev");
        let entry = command(value.group_key, GroupIntent::Update, &value, None);
        let typed = TypedRecord::from_entry(&entry).unwrap();

        let mut ctx = ProcessingContext::new(1, 3, &mut state, &entry);
        let result = GroupUpdateProcessor.process_new_command(&mut ctx, &typed);
        assert!(matches!(
            result,
            Err(ProcessingError::Expected(ref r)) if r.rejection_type == RejectionType::NotFound
        ));
    }

    #[test]
    fn test_rename_frees_old_name() {
        let mut groups = GroupState::default();
        groups.apply_created(GroupRecord::new(7, "ops"));
        groups.apply_updated(GroupRecord::new(7, "dev"));

        assert_eq!(groups.key_by_name("ops"), None);
        assert_eq!(groups.key_by_name("dev"), Some(7));
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_restore_checkpoint_undoes_rename() {
        let mut groups = GroupState::default();
        groups.apply_created(GroupRecord::new(7, "ops"));

        groups.checkpoint();
        groups.apply_updated(GroupRecord::new(7, "dev"));
        groups.apply_created(GroupRecord::new(8, "ops"));
        groups.restore_checkpoint();

        assert_eq!(groups.key_by_name("ops"), Some(7));
        assert_eq!(groups.key_by_name("dev"), None);
        assert_eq!(groups.get(7), Some(&GroupRecord::new(7, "ops")));
        assert!(groups.get(8).is_none());
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_released_checkpoint_keeps_changes() {
        let mut groups = GroupState::default();
        groups.checkpoint();
        groups.apply_created(GroupRecord::new(7, "ops"));
        groups.release_checkpoint();
        groups.restore_checkpoint();

        assert_eq!(groups.key_by_name("ops"), Some(7));
    }
}
