//! Error types for the Tandem engine.

use crate::{EntityId, EntityType, OperationId, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity type: {0}")]
    UnknownEntityType(EntityType),

    #[error("unknown field '{field}' for entity type '{entity_type}'")]
    UnknownField {
        entity_type: EntityType,
        field: String,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Operation errors
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("operation on deleted entity: {0}")]
    OperationOnDeleted(EntityId),

    #[error("operation targets entity {got}, expected {expected}")]
    EntityMismatch { expected: EntityId, got: EntityId },

    #[error("entity {entity_id} is a '{expected}', not a '{got}'")]
    EntityTypeMismatch {
        entity_id: EntityId,
        expected: EntityType,
        got: EntityType,
    },

    #[error("staged write {0} was overtaken by another write")]
    StaleWrite(OperationId),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
