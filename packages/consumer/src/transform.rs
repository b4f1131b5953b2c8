//! Message Transformer
//!
//! Decodes queue payloads into raw event records and normalizes their
//! hex-encoded numeric fields. Every other field passes through verbatim,
//! in its original order.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::normalizer::{json_type_name, MalformedNumericField, Normalizer, PrecisionPolicy};

/// Nested object carrying the decoded event arguments
pub const EVENT_DATA_FIELD: &str = "event_data";
/// Amount inside `event_data`
pub const VALUE_FIELD: &str = "value";
pub const BLOCK_NUMBER_FIELD: &str = "blockNumber";
pub const LOG_INDEX_FIELD: &str = "logIndex";
pub const TRANSACTION_INDEX_FIELD: &str = "transactionIndex";
/// Ingestion time; added by the sink, never by the transformer
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Dotted path of the nested amount, used in error reports
pub const EVENT_VALUE_PATH: &str = "event_data.value";

/// Errors that can occur while decoding a queue payload
#[derive(Error, Debug)]
pub enum DeserializationError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload must be a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// A numeric field could not be normalized; nothing was written back
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed field `{field}`: {cause}")]
pub struct TransformError {
    pub field: &'static str,
    #[source]
    pub cause: MalformedNumericField,
}

impl TransformError {
    fn new(field: &'static str, cause: MalformedNumericField) -> Self {
        Self { field, cause }
    }
}

/// Event record as received from the queue
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawMessage(Map<String, Value>);

impl RawMessage {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Decode a queue payload (UTF-8 JSON object)
    pub fn from_slice(payload: &[u8]) -> Result<Self, DeserializationError> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(DeserializationError::NotAnObject(json_type_name(&other))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

/// Event record with its numeric fields in canonical form
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord(Map<String, Value>);

impl NormalizedRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    pub fn event_value(&self) -> Option<&Value> {
        self.0.get(EVENT_DATA_FIELD).and_then(|data| data.get(VALUE_FIELD))
    }

    pub fn block_number(&self) -> Option<&Value> {
        self.0.get(BLOCK_NUMBER_FIELD)
    }

    pub fn log_index(&self) -> Option<&Value> {
        self.0.get(LOG_INDEX_FIELD)
    }

    pub fn transaction_index(&self) -> Option<&Value> {
        self.0.get(TRANSACTION_INDEX_FIELD)
    }

    /// Copy of the record with an ingestion timestamp (Unix millis) appended
    pub fn stamped(&self, timestamp_millis: u64) -> Map<String, Value> {
        let mut fields = self.0.clone();
        fields.insert(TIMESTAMP_FIELD.to_string(), Value::from(timestamp_millis));
        fields
    }
}

/// Applies the normalizer to the four known numeric fields
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageTransformer {
    normalizer: Normalizer,
}

impl MessageTransformer {
    pub fn new(policy: PrecisionPolicy) -> Self {
        Self {
            normalizer: Normalizer::new(policy),
        }
    }

    /// Normalize a raw message
    ///
    /// All four values are computed before the record is touched, so a
    /// failure never leaves a partially normalized record behind.
    ///
    /// # Returns
    /// The normalized record, or the first field that failed
    pub fn transform(&self, msg: RawMessage) -> Result<NormalizedRecord, TransformError> {
        let mut fields = msg.into_fields();

        let mut event_data = match fields.get(EVENT_DATA_FIELD) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(data)) => data.clone(),
            Some(other) => {
                return Err(TransformError::new(
                    EVENT_DATA_FIELD,
                    MalformedNumericField::UnexpectedType(json_type_name(other)),
                ))
            }
        };

        let value = self.normalize_field(EVENT_VALUE_PATH, event_data.get(VALUE_FIELD))?;
        let block_number = self.normalize_field(BLOCK_NUMBER_FIELD, fields.get(BLOCK_NUMBER_FIELD))?;
        let log_index = self.normalize_field(LOG_INDEX_FIELD, fields.get(LOG_INDEX_FIELD))?;
        let transaction_index =
            self.normalize_field(TRANSACTION_INDEX_FIELD, fields.get(TRANSACTION_INDEX_FIELD))?;

        // Existing keys keep their position; defaulted ones are appended.
        event_data.insert(VALUE_FIELD.to_string(), value);
        fields.insert(EVENT_DATA_FIELD.to_string(), Value::Object(event_data));
        fields.insert(BLOCK_NUMBER_FIELD.to_string(), block_number);
        fields.insert(LOG_INDEX_FIELD.to_string(), log_index);
        fields.insert(TRANSACTION_INDEX_FIELD.to_string(), transaction_index);

        Ok(NormalizedRecord(fields))
    }

    fn normalize_field(&self, field: &'static str, raw: Option<&Value>) -> Result<Value, TransformError> {
        self.normalizer
            .normalize(raw)
            .map_err(|cause| TransformError::new(field, cause))
    }
}
