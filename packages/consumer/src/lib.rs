//! Indexer Consumer Library
//!
//! This crate provides components for draining blockchain-event messages from
//! an AMQP queue, normalizing their hex quantities, and appending them to a
//! document store.

pub mod config;
pub mod consumer;
pub mod normalizer;
pub mod queue;
pub mod sink;
pub mod transform;

// Re-export commonly used types
pub use config::{Config, ConfigError, StoreBackend};
pub use consumer::{ConsumerLoop, ConsumerStats, Outcome};
pub use normalizer::{MalformedNumericField, Normalizer, PrecisionPolicy};
pub use queue::{AmqpBroker, InboundMessage, MessageSource, QueueError, RetryPolicy};
pub use sink::{MongoSink, PersistError, RedisSink, Sink};
pub use transform::{MessageTransformer, NormalizedRecord, RawMessage, TransformError};
