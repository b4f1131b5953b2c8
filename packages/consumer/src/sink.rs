//! Document Sink
//!
//! Appends normalized records to a document store, stamped with the
//! ingestion time at the moment of the write.
//! MongoDB collections and Redis lists are supported; neither enforces uniqueness,
//! so a redelivered message becomes a second document.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mongodb::bson::{self, doc, DateTime, Document};
use mongodb::{Client, Collection};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::info;

use crate::transform::{NormalizedRecord, TIMESTAMP_FIELD};

/// Errors that can occur while persisting a record
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("BSON serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Persist timed out after {0}ms")]
    Timeout(u64),
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Destination for normalized records
#[async_trait]
pub trait Sink: Send + Sync {
    /// Append one record to the store
    ///
    /// The ingestion timestamp is captured inside this call.
    async fn persist(&self, record: &NormalizedRecord) -> Result<(), PersistError>;
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for Arc<T> {
    async fn persist(&self, record: &NormalizedRecord) -> Result<(), PersistError> {
        (**self).persist(record).await
    }
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for Box<T> {
    async fn persist(&self, record: &NormalizedRecord) -> Result<(), PersistError> {
        (**self).persist(record).await
    }
}

/// MongoDB collection sink
///
/// The driver pools connections internally, so one sink can be shared by
/// every worker; each insert checks out its own connection.
#[derive(Clone, Debug)]
pub struct MongoSink {
    collection: Collection<Document>,
}

impl MongoSink {
    /// Wrap an existing collection handle
    pub fn new(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    /// Connect to MongoDB and verify the server answers a ping
    ///
    /// # Arguments
    /// * `url` - A `mongodb://` or `mongodb+srv://` connection string
    /// * `database` - Database name
    /// * `collection` - Collection receiving the records
    pub async fn connect(url: &str, database: &str, collection: &str) -> Result<Self, PersistError> {
        let client = Client::with_uri_str(url).await?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 }).await?;

        info!("Connected to MongoDB collection {}.{}", database, collection);
        Ok(Self::new(db.collection(collection)))
    }

    /// Build the stored document for a record
    pub fn to_document(record: &NormalizedRecord, timestamp_millis: u64) -> Result<Document, PersistError> {
        let mut document = bson::to_document(record.fields())?;
        document.insert(TIMESTAMP_FIELD, DateTime::from_millis(timestamp_millis as i64));
        Ok(document)
    }
}

#[async_trait]
impl Sink for MongoSink {
    async fn persist(&self, record: &NormalizedRecord) -> Result<(), PersistError> {
        let document = Self::to_document(record, current_timestamp_millis())?;
        self.collection.insert_one(document).await?;
        Ok(())
    }
}

/// Redis list sink
///
/// Each record is appended as one JSON document to the list
/// `{database}:{collection}`.
#[derive(Clone)]
pub struct RedisSink {
    connection: MultiplexedConnection,
    key: String,
}

impl RedisSink {
    /// Create a new sink on an established multiplexed connection
    pub fn new(connection: MultiplexedConnection, key: impl Into<String>) -> Self {
        Self {
            connection,
            key: key.into(),
        }
    }

    /// Connect to Redis
    ///
    /// # Arguments
    /// * `url` - A `redis://` or `rediss://` connection string
    /// * `database` - Key namespace
    /// * `collection` - List name within the namespace
    pub async fn connect(url: &str, database: &str, collection: &str) -> Result<Self, PersistError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        let key = list_key(database, collection);

        info!("Connected to Redis list {}", key);
        Ok(Self::new(connection, key))
    }

    /// Serialize a record the way it is stored
    pub fn to_json(record: &NormalizedRecord, timestamp_millis: u64) -> Result<String, PersistError> {
        Ok(serde_json::to_string(&record.stamped(timestamp_millis))?)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Sink for RedisSink {
    async fn persist(&self, record: &NormalizedRecord) -> Result<(), PersistError> {
        let json = Self::to_json(record, current_timestamp_millis())?;
        // Multiplexed connections are cheap handles onto one socket
        let mut connection = self.connection.clone();
        let _: i64 = connection.rpush(&self.key, json).await?;
        Ok(())
    }
}

/// Redis key holding a collection
pub fn list_key(database: &str, collection: &str) -> String {
    format!("{}:{}", database, collection)
}
