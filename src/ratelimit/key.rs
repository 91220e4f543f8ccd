//! Storage key namespacing.

/// A key that uniquely identifies a window record in the shared store.
///
/// Composed of the limiter configuration's client id and the caller-supplied
/// key, so independently configured limiters sharing one store never see
/// each other's hits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    /// The limiter configuration this record belongs to
    pub client_id: String,
    /// The opaque key of the throttled entity
    pub key: String,
}

impl StorageKey {
    /// Create a new storage key.
    pub fn new(client_id: &str, key: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            key: key.to_string(),
        }
    }

    /// The `{client_id}:{key}` string written to the store.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.client_id, self.key)
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
