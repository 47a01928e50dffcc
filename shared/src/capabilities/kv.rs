//! Local key-value persistence and the like store built on it.
//!
//! Every key lives under the `userdata:` prefix. Stores only need to support the four
//! operations the like store issues: point reads, writes, deletes and ordered prefix
//! listing with a cursor.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::model::{ProductId, UserId};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 64 * 1024;
pub const MAX_LIST_LIMIT: u32 = 1000;

const USER_DATA_PREFIX: &str = "userdata:";
const LIKES_PREFIX: &str = "likes";

/// A validated key, stored as `userdata:{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvKey(String);

impl KvKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        if let Some(reason) = Self::rejection(&key) {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>().escape_default().to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(Self(key))
    }

    /// The key as written to storage.
    pub fn raw(&self) -> String {
        raw_key(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn rejection(key: &str) -> Option<&'static str> {
        if key.trim().is_empty() {
            Some("key cannot be empty")
        } else if key.len() > MAX_KEY_LENGTH {
            Some("key is too long")
        } else if key.contains("..") {
            Some("key cannot contain '..'")
        } else if key.starts_with(['/', '\\']) {
            Some("key cannot start with a path separator")
        } else if key.chars().any(char::is_control) {
            Some("key contains control characters")
        } else {
            None
        }
    }
}

pub(crate) fn raw_key(key: &str) -> String {
    format!("{USER_DATA_PREFIX}{key}")
}

/// Strips the storage prefix from a raw key.
pub(crate) fn logical_key(raw: &str) -> &str {
    raw.strip_prefix(USER_DATA_PREFIX).unwrap_or(raw)
}

fn check_value_size(data: &[u8]) -> Result<(), KvError> {
    if data.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: data.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOperation {
    Get {
        key: KvKey,
    },
    Set {
        key: KvKey,
        value: Vec<u8>,
    },
    Delete {
        key: KvKey,
    },
    /// Keys starting with `prefix` in key order, resuming after `cursor`.
    List {
        prefix: String,
        limit: u32,
        cursor: Option<String>,
    },
}

impl KvOperation {
    pub fn get(key: impl Into<String>) -> Result<Self, KvError> {
        Ok(Self::Get {
            key: KvKey::new(key)?,
        })
    }

    pub fn set(key: impl Into<String>, value: Vec<u8>) -> Result<Self, KvError> {
        check_value_size(&value)?;
        Ok(Self::Set {
            key: KvKey::new(key)?,
            value,
        })
    }

    pub fn delete(key: impl Into<String>) -> Result<Self, KvError> {
        Ok(Self::Delete {
            key: KvKey::new(key)?,
        })
    }

    pub fn list(prefix: impl Into<String>, limit: u32, cursor: Option<String>) -> Self {
        Self::List {
            prefix: prefix.into(),
            limit: limit.clamp(1, MAX_LIST_LIMIT),
            cursor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOutput {
    Value(Option<Vec<u8>>),
    Written,
    Deleted {
        existed: bool,
    },
    /// `next_cursor` is set when more keys follow.
    List {
        keys: Vec<String>,
        next_cursor: Option<String>,
    },
}

pub type KvResult = Result<KvOutput, KvError>;

/// Builds a listing page from up to `limit + 1` matched keys.
pub(crate) fn list_output(mut keys: Vec<String>, limit: usize) -> KvOutput {
    let next_cursor = if keys.len() > limit {
        keys.truncate(limit);
        keys.last().cloned()
    } else {
        None
    };
    KvOutput::List { keys, next_cursor }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("unexpected store output for {operation}")]
    UnexpectedOutput { operation: &'static str },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

/// Synchronous local key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn execute(&self, op: KvOperation) -> KvResult;
}

/// JSON codec for values of one type.
pub struct TypedKvStore<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Default for TypedKvStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> TypedKvStore<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }

    pub fn set_op(&self, key: impl Into<String>, value: &T) -> Result<KvOperation, KvError> {
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
        })?;
        KvOperation::set(key, data)
    }

    pub fn parse_value(&self, output: KvOutput) -> Result<Option<T>, KvError> {
        match output {
            KvOutput::Value(Some(data)) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                }),
            KvOutput::Value(None) => Ok(None),
            _ => Err(KvError::UnexpectedOutput { operation: "get" }),
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn execute(&self, op: KvOperation) -> KvResult {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store lock poisoned"))?;

        match op {
            KvOperation::Get { key } => Ok(KvOutput::Value(entries.get(&key.raw()).cloned())),
            KvOperation::Set { key, value } => {
                check_value_size(&value)?;
                entries.insert(key.raw(), value);
                Ok(KvOutput::Written)
            }
            KvOperation::Delete { key } => Ok(KvOutput::Deleted {
                existed: entries.remove(&key.raw()).is_some(),
            }),
            KvOperation::List {
                prefix,
                limit,
                cursor,
            } => {
                let full_prefix = raw_key(&prefix);
                let lower = match cursor {
                    Some(c) => Bound::Excluded(raw_key(&c)),
                    None => Bound::Included(full_prefix.clone()),
                };
                let limit = limit.min(MAX_LIST_LIMIT) as usize;
                let keys = entries
                    .range::<String, _>((lower, Bound::Unbounded))
                    .map(|(k, _)| k)
                    .skip_while(|k| k.as_str() < full_prefix.as_str())
                    .take_while(|k| k.starts_with(&full_prefix))
                    .take(limit + 1)
                    .map(|k| logical_key(k).to_string())
                    .collect();
                Ok(list_output(keys, limit))
            }
        }
    }
}

// ============================================================================
// Likes
// ============================================================================

/// Per-user like flags persisted on the device.
pub trait LikeStore: Send + Sync {
    fn is_liked(&self, product_id: ProductId, user_id: &UserId) -> Result<bool, KvError>;

    /// Flips the persisted flag.
    fn toggle_like(&self, product_id: ProductId, user_id: &UserId) -> Result<(), KvError>;

    fn liked_products(&self, user_id: &UserId) -> Result<Vec<ProductId>, KvError>;
}

/// Like flags stored as `userdata:likes/{user}/{product}` holding `true`; unliking
/// deletes the key.
pub struct KvLikeStore<S> {
    store: S,
    codec: TypedKvStore<bool>,
}

impl<S: KeyValueStore> KvLikeStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            codec: TypedKvStore::new(),
        }
    }

    fn user_prefix(user_id: &UserId) -> String {
        format!("{LIKES_PREFIX}/{user_id}/")
    }

    fn like_key(product_id: ProductId, user_id: &UserId) -> String {
        format!("{}{product_id}", Self::user_prefix(user_id))
    }
}

impl<S: KeyValueStore> LikeStore for KvLikeStore<S> {
    fn is_liked(&self, product_id: ProductId, user_id: &UserId) -> Result<bool, KvError> {
        let output = self
            .store
            .execute(KvOperation::get(Self::like_key(product_id, user_id))?)?;
        Ok(self.codec.parse_value(output)?.unwrap_or(false))
    }

    #[instrument(skip_all, fields(user = %user_id, product = %product_id))]
    fn toggle_like(&self, product_id: ProductId, user_id: &UserId) -> Result<(), KvError> {
        let key = Self::like_key(product_id, user_id);
        let op = if self.is_liked(product_id, user_id)? {
            KvOperation::delete(key)?
        } else {
            self.codec.set_op(key, &true)?
        };
        match self.store.execute(op)? {
            KvOutput::Written => debug!("like stored"),
            KvOutput::Deleted { existed } => debug!(existed, "like removed"),
            _ => return Err(KvError::UnexpectedOutput { operation: "toggle" }),
        }
        Ok(())
    }

    fn liked_products(&self, user_id: &UserId) -> Result<Vec<ProductId>, KvError> {
        let prefix = Self::user_prefix(user_id);
        KvKey::new(prefix.as_str())?;
        let mut liked = Vec::new();
        let mut cursor = None;

        loop {
            let op = KvOperation::list(prefix.as_str(), MAX_LIST_LIMIT, cursor.take());
            let KvOutput::List { keys, next_cursor } = self.store.execute(op)? else {
                return Err(KvError::UnexpectedOutput { operation: "list" });
            };

            for key in keys {
                match key[prefix.len()..].parse::<i64>() {
                    Ok(id) => liked.push(ProductId(id)),
                    Err(_) => warn!(%key, "ignoring malformed like key"),
                }
            }

            match next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        Ok(liked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("user123")
    }

    #[test]
    fn keys_are_validated_and_prefixed() {
        assert!(matches!(KvKey::new(""), Err(KvError::InvalidKey { .. })));
        assert!(KvKey::new("   ").is_err());
        assert!(KvKey::new("likes/u\0/1").is_err());
        assert!(KvKey::new("likes/../1").is_err());
        assert!(KvKey::new("/likes").is_err());
        assert!(KvKey::new("a".repeat(MAX_KEY_LENGTH + 1)).is_err());

        let key = KvKey::new("likes/u/1").unwrap();
        assert_eq!(key.raw(), "userdata:likes/u/1");
        assert_eq!(logical_key(&key.raw()), key.as_str());
    }

    #[test]
    fn oversized_values_are_rejected() {
        let result = KvOperation::set("big", vec![0u8; MAX_VALUE_SIZE + 1]);
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
    }

    #[test]
    fn only_transient_storage_errors_are_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::UnexpectedOutput { operation: "get" }.is_retryable());
    }

    #[test]
    fn memory_store_set_get_delete() {
        let store = MemoryKvStore::new();
        assert_eq!(
            store.execute(KvOperation::set("a", b"1".to_vec()).unwrap()).unwrap(),
            KvOutput::Written
        );
        store.execute(KvOperation::set("a", b"2".to_vec()).unwrap()).unwrap();
        assert_eq!(
            store.execute(KvOperation::get("a").unwrap()).unwrap(),
            KvOutput::Value(Some(b"2".to_vec()))
        );

        let delete = KvOperation::delete("a").unwrap();
        assert_eq!(
            store.execute(delete.clone()).unwrap(),
            KvOutput::Deleted { existed: true }
        );
        assert_eq!(store.execute(delete).unwrap(), KvOutput::Deleted { existed: false });
        assert_eq!(
            store.execute(KvOperation::get("a").unwrap()).unwrap(),
            KvOutput::Value(None)
        );
    }

    #[test]
    fn memory_store_lists_by_prefix_with_cursor() {
        let store = MemoryKvStore::new();
        for key in ["p/a", "p/b", "p/c", "q/a", "o/z"] {
            store.execute(KvOperation::set(key, vec![0]).unwrap()).unwrap();
        }

        let first = store.execute(KvOperation::list("p/", 2, None)).unwrap();
        assert_eq!(
            first,
            KvOutput::List {
                keys: vec!["p/a".into(), "p/b".into()],
                next_cursor: Some("p/b".into()),
            }
        );

        let rest = store
            .execute(KvOperation::list("p/", 2, Some("p/b".into())))
            .unwrap();
        assert_eq!(
            rest,
            KvOutput::List {
                keys: vec!["p/c".into()],
                next_cursor: None,
            }
        );
    }

    #[test]
    fn codec_rejects_wrong_output_and_bad_json() {
        let codec: TypedKvStore<bool> = TypedKvStore::new();
        assert!(codec.parse_value(KvOutput::Written).is_err());
        assert_eq!(codec.parse_value(KvOutput::Value(None)).unwrap(), None);
        assert!(matches!(
            codec.parse_value(KvOutput::Value(Some(b"maybe".to_vec()))),
            Err(KvError::Serialization { .. })
        ));
    }

    #[test]
    fn like_toggle_flips_persisted_flag() {
        let likes = KvLikeStore::new(MemoryKvStore::new());
        assert!(!likes.is_liked(ProductId(42), &user()).unwrap());

        likes.toggle_like(ProductId(42), &user()).unwrap();
        assert!(likes.is_liked(ProductId(42), &user()).unwrap());

        likes.toggle_like(ProductId(42), &user()).unwrap();
        assert!(!likes.is_liked(ProductId(42), &user()).unwrap());
    }

    #[test]
    fn likes_are_per_user() {
        let likes = KvLikeStore::new(MemoryKvStore::new());
        likes.toggle_like(ProductId(1), &user()).unwrap();
        assert!(!likes.is_liked(ProductId(1), &UserId::new("someone-else")).unwrap());
    }

    #[test]
    fn liked_products_lists_only_that_user() {
        let likes = KvLikeStore::new(MemoryKvStore::new());
        for id in [3, 1, 2] {
            likes.toggle_like(ProductId(id), &user()).unwrap();
        }
        likes.toggle_like(ProductId(9), &UserId::new("user1234")).unwrap();

        let mut liked = likes.liked_products(&user()).unwrap();
        liked.sort();
        assert_eq!(liked, vec![ProductId(1), ProductId(2), ProductId(3)]);
    }

    #[test]
    fn liked_products_follows_the_cursor() {
        let likes = KvLikeStore::new(MemoryKvStore::new());
        let total = i64::from(MAX_LIST_LIMIT) + 5;
        for id in 0..total {
            likes.toggle_like(ProductId(id), &user()).unwrap();
        }
        assert_eq!(likes.liked_products(&user()).unwrap().len(), total as usize);
    }

    #[test]
    fn invalid_user_id_is_rejected() {
        let likes = KvLikeStore::new(MemoryKvStore::new());
        let err = likes.toggle_like(ProductId(1), &UserId::new("../root")).unwrap_err();
        assert!(matches!(err, KvError::InvalidKey { .. }));
        assert!(likes.liked_products(&UserId::new("../root")).is_err());
    }
}
