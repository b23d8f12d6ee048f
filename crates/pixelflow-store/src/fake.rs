//! An in-memory [`RecordStore`] for tests that don't need a live Redis
//! (teacher precedent: `Database::new_in_memory` in the teacher's db crate).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pixelflow_core::{FieldValue, PhotoRecord};

use crate::{NotFoundSnafu, RecordStore, StoreResult};

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, PhotoRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn seed(&self, record: &PhotoRecord) -> StoreResult<()> {
        let mut records = self.records.lock().expect("lock poisoned");
        records
            .entry(record.photo_id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn put_field(
        &self,
        photo_id: &str,
        name: &'static str,
        value: FieldValue,
    ) -> StoreResult<()> {
        let mut records = self.records.lock().expect("lock poisoned");
        let record = records
            .get_mut(photo_id)
            .ok_or_else(|| NotFoundSnafu { photo_id: photo_id.to_string() }.build())?;
        record.apply_field(name, value);
        Ok(())
    }

    async fn get_all(&self, photo_id: &str) -> StoreResult<PhotoRecord> {
        let records = self.records.lock().expect("lock poisoned");
        records
            .get(photo_id)
            .cloned()
            .ok_or_else(|| NotFoundSnafu { photo_id: photo_id.to_string() }.build())
    }

    async fn exists(&self, photo_id: &str) -> StoreResult<bool> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records.contains_key(photo_id))
    }
}

#[cfg(test)]
mod tests {
    use pixelflow_core::field;

    use super::*;

    #[tokio::test]
    async fn put_field_is_monotone() {
        let store = InMemoryRecordStore::new();
        let record = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        store.seed(&record).await.unwrap();

        store
            .put_field(
                "p1",
                field::CAPTION,
                FieldValue::Text("a cat".to_string()),
            )
            .await
            .unwrap();
        store
            .put_field(
                "p1",
                field::CAPTION,
                FieldValue::Text("a dog".to_string()),
            )
            .await
            .unwrap();

        let record = store.get_all("p1").await.unwrap();
        assert_eq!(record.caption, "a cat");
    }

    #[tokio::test]
    async fn get_all_unknown_photo_is_not_found() {
        let store = InMemoryRecordStore::new();
        assert!(store.get_all("missing").await.is_err());
    }

    #[tokio::test]
    async fn exists_reflects_seeded_records() {
        let store = InMemoryRecordStore::new();
        assert!(!store.exists("p1").await.unwrap());
        store
            .seed(&PhotoRecord::new("p1", 1, "http://x/a.jpg"))
            .await
            .unwrap();
        assert!(store.exists("p1").await.unwrap());
    }
}
