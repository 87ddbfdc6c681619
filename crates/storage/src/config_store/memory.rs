use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use super::{ConfigRepository, ConfigStoreError, StoredConfiguration, WriteCondition};

/// Configuration rows kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryConfigRepository {
    rows: Arc<DashMap<String, StoredConfiguration>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryConfigRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, tenant_id: &str) -> Option<StoredConfiguration> {
        self.rows.get(tenant_id).map(|row| row.clone())
    }

    pub fn put_raw(&self, record: StoredConfiguration) {
        self.rows.insert(record.tenant_id.clone(), record);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl ConfigRepository for MemoryConfigRepository {
    async fn fetch(&self, tenant_id: &str) -> Result<Option<StoredConfiguration>, ConfigStoreError> {
        Ok(self.raw(tenant_id))
    }

    async fn upsert(
        &self,
        record: StoredConfiguration,
        condition: WriteCondition,
    ) -> Result<StoredConfiguration, ConfigStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConfigStoreError::Unavailable(
                "write rejected by test repository".to_string(),
            ));
        }
        let conflict = || ConfigStoreError::Conflict {
            tenant_id: record.tenant_id.clone(),
        };
        match self.rows.entry(record.tenant_id.clone()) {
            Entry::Occupied(mut row) => {
                if !condition.allows(Some(row.get().updated_at)) {
                    return Err(conflict());
                }
                row.insert(record.clone());
            }
            Entry::Vacant(slot) => {
                if !condition.allows(None) {
                    return Err(conflict());
                }
                slot.insert(record.clone());
            }
        }
        Ok(record)
    }
}
