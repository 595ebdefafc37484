//! Dead-letter store backed by `sled`
//!
//! Each subscription gets its own tree. Keys are a zero-padded
//! millisecond timestamp followed by a UUID, so iteration yields letters
//! in the order they were dead-lettered.

use serde::{Deserialize, Serialize};
use sled::Db;
use uuid::Uuid;

use crate::utils::error::BrokerError;

const TREE_PREFIX: &str = "dead-letter/";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Delivery count of the final failed attempt.
    pub delivery_count: u32,
    /// Error text of the final failed attempt.
    pub reason: String,
    pub dead_lettered_at: i64,
}

#[derive(Clone)]
pub struct DeadLetterStore {
    db: Db,
}

impl DeadLetterStore {
    /// Open or create the store at `path`, or a temporary store when no
    /// path is given.
    pub fn open(path: Option<&str>) -> Result<Self, sled::Error> {
        let db = match path {
            Some(path) => sled::open(path)?,
            None => sled::Config::new().temporary(true).open()?,
        };
        Ok(Self { db })
    }

    pub fn store(&self, subscription: &str, letter: &DeadLetter) -> Result<(), BrokerError> {
        let serialized = serde_json::to_vec(letter)?;
        let tree = self.tree(subscription)?;
        let key = format!("{:020}_{}", letter.dead_lettered_at, Uuid::new_v4());
        tree.insert(key.as_bytes(), serialized)?;
        Ok(())
    }

    /// All letters for a subscription, oldest first. Entries that fail to
    /// decode are skipped.
    pub fn load(&self, subscription: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let tree = self.tree(subscription)?;
        Ok(tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
            .collect())
    }

    pub fn count(&self, subscription: &str) -> Result<usize, BrokerError> {
        Ok(self.tree(subscription)?.len())
    }

    pub async fn flush(&self) -> Result<(), BrokerError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn tree(&self, subscription: &str) -> Result<sled::Tree, sled::Error> {
        self.db.open_tree(format!("{TREE_PREFIX}{subscription}"))
    }
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
