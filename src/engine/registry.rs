//! Static `(ValueType, Intent) -> processor` lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::distribution::CommandDistributionAcknowledgeProcessor;
use crate::identity::{GroupCreateProcessor, GroupUpdateProcessor};
use crate::record::{CommandDistributionIntent, GroupIntent, Intent, RecordValue, ValueType};

use super::processor::{CommandProcessor, Distributed, DistributedProcessor, Local, RecordProcessor};

/// Processors by command type.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<(ValueType, Intent), Arc<dyn RecordProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every processor this crate ships.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register_distributed(GroupIntent::Create, GroupCreateProcessor);
        registry.register_distributed(GroupIntent::Update, GroupUpdateProcessor);
        registry.register(
            CommandDistributionIntent::Acknowledge,
            CommandDistributionAcknowledgeProcessor,
        );
        registry
    }

    pub fn register_distributed<P>(&mut self, intent: impl Into<Intent>, processor: P)
    where
        P: DistributedProcessor + 'static,
    {
        self.insert(
            <P::Value as RecordValue>::VALUE_TYPE,
            intent.into(),
            Arc::new(Distributed(processor)),
        );
    }

    pub fn register<P>(&mut self, intent: impl Into<Intent>, processor: P)
    where
        P: CommandProcessor + 'static,
    {
        self.insert(
            <P::Value as RecordValue>::VALUE_TYPE,
            intent.into(),
            Arc::new(Local(processor)),
        );
    }

    fn insert(&mut self, value_type: ValueType, intent: Intent, processor: Arc<dyn RecordProcessor>) {
        debug!(%value_type, %intent, "Registering processor");
        self.processors.insert((value_type, intent), processor);
    }

    pub fn get(&self, value_type: ValueType, intent: Intent) -> Option<&Arc<dyn RecordProcessor>> {
        self.processors.get(&(value_type, intent))
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.processors.keys().collect();
        keys.sort_by_key(|(value_type, intent)| (*value_type, intent.code()));
        f.debug_struct("ProcessorRegistry")
            .field("processors", &keys)
            .finish()
    }
}
