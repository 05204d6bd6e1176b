//! Storage event notifications.
//!
//! Mirrors the object-store notification shape: a batch of `Records`, each
//! naming a bucket and an object key. Everything else in the notification is
//! ignored.

use serde::{Deserialize, Serialize};

/// A batch of storage events delivered together
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

/// One storage event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

impl EventRecord {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            s3: S3Entity {
                bucket: BucketRef {
                    name: bucket.into(),
                },
                object: ObjectRef { key: key.into() },
            },
        }
    }

    pub fn bucket(&self) -> &str {
        &self.s3.bucket.name
    }

    pub fn key(&self) -> &str {
        &self.s3.object.key
    }
}

impl EventBatch {
    /// Build a batch of keys that all live in one bucket
    pub fn from_keys<I, K>(bucket: &str, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            records: keys
                .into_iter()
                .map(|key| EventRecord::new(bucket, key))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
