use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

const EXCHANGES_TREE: &str = "exchanges";
const QUEUES_TREE: &str = "queues";
const BINDINGS_TREE: &str = "bindings";
const QUEUE_TREE_PREFIX: &str = "queue:";

/// A persistent message waiting in a durable queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Monotonic id from sled; also the FIFO position within the queue.
    #[serde(skip)]
    pub id: u64,
    pub body: Vec<u8>,
    pub stored_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingRecord {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// sled-backed storage for durable declarations and persistent messages.
///
/// Each durable queue gets its own tree keyed by a big-endian id, so a plain
/// iteration returns messages in the order they were stored.
#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    pub fn open(path: &str) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Storage that is wiped when the last handle is dropped.
    pub fn temporary() -> Result<Self, sled::Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn record_exchange(&self, name: &str) -> Result<(), sled::Error> {
        self.db
            .open_tree(EXCHANGES_TREE)?
            .insert(name.as_bytes(), Vec::<u8>::new())?;
        Ok(())
    }

    pub fn record_queue(&self, name: &str) -> Result<(), sled::Error> {
        self.db.open_tree(QUEUES_TREE)?.insert(name.as_bytes(), Vec::<u8>::new())?;
        Ok(())
    }

    pub fn record_binding(&self, binding: &BindingRecord) -> Result<(), sled::Error> {
        let key = binding_key(binding);
        let value = serde_json::to_vec(binding)
            .map_err(|e| sled::Error::Unsupported(format!("binding encode: {e}")))?;
        self.db.open_tree(BINDINGS_TREE)?.insert(key, value)?;
        Ok(())
    }

    pub fn exchanges(&self) -> Result<Vec<String>, sled::Error> {
        names(&self.db.open_tree(EXCHANGES_TREE)?)
    }

    pub fn queues(&self) -> Result<Vec<String>, sled::Error> {
        names(&self.db.open_tree(QUEUES_TREE)?)
    }

    pub fn bindings(&self) -> Result<Vec<BindingRecord>, sled::Error> {
        let tree = self.db.open_tree(BINDINGS_TREE)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(binding) => out.push(binding),
                Err(e) => tracing::warn!("skipping unreadable binding record: {e}"),
            }
        }
        Ok(out)
    }

    /// Stores a message at the tail of `queue` and returns its id.
    pub fn store_message(&self, queue: &str, body: &[u8]) -> Result<u64, sled::Error> {
        let id = self.db.generate_id()?;
        let msg = StoredMessage {
            id,
            body: body.to_vec(),
            stored_at: chrono::Utc::now().timestamp(),
        };
        let serialized = serde_json::to_vec(&msg)
            .map_err(|e| sled::Error::Unsupported(format!("message encode: {e}")))?;
        self.queue_tree(queue)?.insert(id.to_be_bytes(), serialized)?;
        Ok(id)
    }

    pub fn remove_message(&self, queue: &str, id: u64) -> Result<(), sled::Error> {
        self.queue_tree(queue)?.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// All stored messages of `queue`, oldest first.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<StoredMessage>, sled::Error> {
        let tree = self.queue_tree(queue)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let Ok(raw_id) = <[u8; 8]>::try_from(key.as_ref()) else {
                continue;
            };
            match serde_json::from_slice::<StoredMessage>(&value) {
                Ok(mut msg) => {
                    msg.id = u64::from_be_bytes(raw_id);
                    out.push(msg);
                }
                Err(e) => tracing::warn!(queue, "skipping unreadable stored message: {e}"),
            }
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), sled::Error> {
        self.db.flush()?;
        Ok(())
    }

    fn queue_tree(&self, queue: &str) -> Result<Tree, sled::Error> {
        self.db.open_tree(format!("{QUEUE_TREE_PREFIX}{queue}"))
    }
}

fn binding_key(b: &BindingRecord) -> Vec<u8> {
    [b.queue.as_bytes(), b.exchange.as_bytes(), b.routing_key.as_bytes()].join(&0u8)
}

fn names(tree: &Tree) -> Result<Vec<String>, sled::Error> {
    let mut out = Vec::new();
    for entry in tree.iter() {
        let (key, _) = entry?;
        out.push(String::from_utf8_lossy(&key).into_owned());
    }
    Ok(out)
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
