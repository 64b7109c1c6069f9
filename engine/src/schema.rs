//! Schema definition and validation.
//!
//! Every entity type declares its fields up front. Local writes are checked
//! before they are stamped, and remote operations are checked at the merge
//! boundary so a malformed update is a handled error instead of a silent
//! mismatch.

use crate::{
    error::Result, EntityType, Error, FieldName, Mutation, Operation, SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
    /// Observed-remove set of strings
    Set,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
            FieldType::Set => write!(f, "Set"),
        }
    }
}

/// Definition of a field in an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: FieldName,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<FieldName>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<FieldName>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.field_type == FieldType::Set
    }

    /// Validate a scalar write against this field.
    pub fn validate_value(&self, value: &serde_json::Value) -> Result<()> {
        if self.is_set() {
            return Err(self.mismatch(value));
        }
        if value.is_null() {
            return if self.required {
                Err(Error::MissingRequiredField(self.name.clone()))
            } else {
                Ok(())
            };
        }

        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
            FieldType::Set => false,
        };

        if valid {
            Ok(())
        } else {
            Err(self.mismatch(value))
        }
    }

    /// Parse the initial contents of a set field (an array of strings).
    pub fn parse_set(&self, value: &serde_json::Value) -> Result<BTreeSet<String>> {
        if !self.is_set() {
            return Err(self.mismatch(value));
        }
        let items = value.as_array().ok_or_else(|| self.mismatch(value))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.mismatch(item))
            })
            .collect()
    }

    fn expect_set(&self) -> Result<()> {
        if self.is_set() {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: "Set".to_string(),
            })
        }
    }

    fn mismatch(&self, value: &serde_json::Value) -> Error {
        Error::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type.to_string(),
            got: json_type_name(value).to_string(),
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Initial field values of a new entity, split by field kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialFields {
    pub values: BTreeMap<FieldName, serde_json::Value>,
    pub sets: BTreeMap<FieldName, BTreeSet<String>>,
}

/// Schema for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    pub name: EntityType,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new(name: impl Into<EntityType>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Look up a field definition.
    pub fn field(&self, name: &str) -> Result<&FieldDef> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::UnknownField {
                entity_type: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Split a JSON object of initial values into scalar and set fields,
    /// validating each against its definition.
    pub fn split_initial(&self, payload: &serde_json::Value) -> Result<InitialFields> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("initial fields must be an object".into()))?;

        let mut initial = InitialFields::default();
        for (name, value) in obj {
            let def = self.field(name)?;
            if def.is_set() {
                initial.sets.insert(name.clone(), def.parse_set(value)?);
            } else {
                initial.values.insert(name.clone(), value.clone());
            }
        }
        self.validate_create(&initial.values, &initial.sets)?;
        Ok(initial)
    }

    /// Validate the payload of a create operation.
    pub fn validate_create(
        &self,
        values: &BTreeMap<FieldName, serde_json::Value>,
        sets: &BTreeMap<FieldName, BTreeSet<String>>,
    ) -> Result<()> {
        for (name, value) in values {
            self.field(name)?.validate_value(value)?;
        }
        for name in sets.keys() {
            self.field(name)?.expect_set()?;
        }
        for def in self.fields.iter().filter(|f| f.required && !f.is_set()) {
            match values.get(&def.name) {
                Some(v) if !v.is_null() => {}
                _ => return Err(Error::MissingRequiredField(def.name.clone())),
            }
        }
        Ok(())
    }
}

/// Schema for the entire replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Entity schemas by type name
    pub entity_types: HashMap<EntityType, EntitySchema>,
}

impl Schema {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            entity_types: HashMap::new(),
        }
    }

    /// Add an entity type to the schema.
    pub fn add_entity_type(&mut self, entity: EntitySchema) -> &mut Self {
        self.entity_types.insert(entity.name.clone(), entity);
        self
    }

    /// Builder-style method to add an entity type.
    pub fn with_entity_type(mut self, entity: EntitySchema) -> Self {
        self.add_entity_type(entity);
        self
    }

    /// Get an entity schema by type name.
    pub fn get(&self, name: &str) -> Result<&EntitySchema> {
        self.entity_types
            .get(name)
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    /// Validate an operation against the schema.
    pub fn validate_operation(&self, op: &Operation) -> Result<()> {
        let entity = self.get(&op.entity_type)?;

        match &op.mutation {
            Mutation::Create { fields, sets } => entity.validate_create(fields, sets),
            Mutation::Set { field, value } => entity.field(field)?.validate_value(value),
            Mutation::SetAdd { field, element } | Mutation::SetRemove { field, element } => {
                if element.is_empty() {
                    return Err(Error::InvalidPayload(format!(
                        "empty element for set field '{field}'"
                    )));
                }
                entity.field(field)?.expect_set()
            }
            Mutation::Delete => Ok(()),
        }
    }
}
