//! Entity schemas the node replicates.

use std::path::Path;

use tandem_engine::{EntitySchema, FieldDef, FieldType, Schema};

use crate::error::{NodeError, Result};

/// The built-in schema for the business services: employees, leave
/// requests, invoices and payroll runs.
pub fn business_schema() -> Schema {
    Schema::new(1)
        .with_entity_type(EntitySchema::new(
            "employee",
            vec![
                FieldDef::required("firstName", FieldType::String),
                FieldDef::optional("lastName", FieldType::String),
                FieldDef::optional("email", FieldType::String),
                FieldDef::optional("jobTitle", FieldType::String),
                FieldDef::optional("department", FieldType::String),
                FieldDef::optional("salary", FieldType::Float),
                FieldDef::optional("hiredAt", FieldType::Timestamp),
                FieldDef::optional("skills", FieldType::Set),
            ],
        ))
        .with_entity_type(EntitySchema::new(
            "leaveRequest",
            vec![
                FieldDef::required("employeeId", FieldType::String),
                FieldDef::required("startsAt", FieldType::Timestamp),
                FieldDef::required("endsAt", FieldType::Timestamp),
                FieldDef::optional("status", FieldType::String),
                FieldDef::optional("note", FieldType::String),
            ],
        ))
        .with_entity_type(EntitySchema::new(
            "invoice",
            vec![
                FieldDef::required("number", FieldType::String),
                FieldDef::optional("customer", FieldType::String),
                FieldDef::optional("amount", FieldType::Float),
                FieldDef::optional("paid", FieldType::Bool),
                FieldDef::optional("lineItems", FieldType::Json),
                FieldDef::optional("tags", FieldType::Set),
            ],
        ))
        .with_entity_type(EntitySchema::new(
            "payrollRun",
            vec![
                FieldDef::required("period", FieldType::String),
                FieldDef::optional("total", FieldType::Float),
                FieldDef::optional("approved", FieldType::Bool),
                FieldDef::optional("employees", FieldType::Set),
            ],
        ))
}

/// Load a schema from a JSON file, or fall back to [`business_schema`].
pub fn load(path: Option<&Path>) -> Result<Schema> {
    let Some(path) = path else {
        return Ok(business_schema());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| NodeError::Schema(format!("{}: {e}", path.display())))?;
    let schema: Schema = serde_json::from_str(&raw)
        .map_err(|e| NodeError::Schema(format!("{}: {e}", path.display())))?;
    tracing::info!(
        path = %path.display(),
        version = schema.version,
        entity_types = schema.entity_types.len(),
        "loaded schema"
    );
    Ok(schema)
}
