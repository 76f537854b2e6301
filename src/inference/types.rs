//! Schema summary produced by analysis

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type of a single observed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Null,
    Boolean,
    /// Whole numbers
    Integer,
    /// Floating point numbers
    Number,
    String,
    Array,
    Object,
}

impl FieldType {
    /// Classify a JSON value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Boolean,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    FieldType::Integer
                } else {
                    FieldType::Number
                }
            }
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::Array,
            Value::Object(_) => FieldType::Object,
        }
    }

    /// Get the JSON Schema type name
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::Null => "null",
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::String => "string",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// One observed type of a field, with its share of the field's values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaType {
    pub field_type: FieldType,
    pub count: u64,
    pub probability: f64,
    /// Nested fields, for objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SchemaField>,
    /// Element types, for arrays
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_types: Vec<SchemaType>,
}

/// A field observed in the sampled documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaField {
    pub name: String,
    /// Dotted path from the document root
    pub path: String,
    /// Number of parent documents containing the field
    pub count: u64,
    /// Share of parent documents containing the field
    pub probability: f64,
    pub types: Vec<SchemaType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
}

impl SchemaField {
    /// Observed type entry for `field_type`, if any
    pub fn type_of(&self, field_type: FieldType) -> Option<&SchemaType> {
        self.types.iter().find(|t| t.field_type == field_type)
    }

    /// Field appeared in every parent document and was never null
    pub fn is_required(&self) -> bool {
        self.probability >= 1.0 - f64::EPSILON && self.type_of(FieldType::Null).is_none()
    }
}

/// Cumulative structural summary of the analyzed documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Number of documents analyzed
    pub count: u64,
    pub fields: Vec<SchemaField>,
}

impl Schema {
    /// Schema of zero documents
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a field by dotted path, descending through object types
    pub fn field(&self, path: &str) -> Option<&SchemaField> {
        let mut fields = &self.fields;
        let mut parts = path.split('.').peekable();
        while let Some(name) = parts.next() {
            let field = fields.iter().find(|f| f.name == name)?;
            if parts.peek().is_none() {
                return Some(field);
            }
            fields = &field.type_of(FieldType::Object)?.fields;
        }
        None
    }

    /// Convert to JSON Schema format
    pub fn to_json_schema(&self) -> Value {
        let mut schema = serde_json::json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema"
        });
        object_to_json_schema(&self.fields, &mut schema);
        schema
    }
}

fn object_to_json_schema(fields: &[SchemaField], schema: &mut Value) {
    schema["type"] = serde_json::json!("object");
    let mut props = serde_json::Map::new();
    let mut required = Vec::new();

    for field in fields {
        let mut prop_schema = serde_json::json!({});
        types_to_json_schema(&field.types, &mut prop_schema);
        if !field.examples.is_empty() {
            prop_schema["examples"] = serde_json::json!(field.examples);
        }
        props.insert(field.name.clone(), prop_schema);

        if field.is_required() {
            required.push(Value::String(field.name.clone()));
        }
    }

    schema["properties"] = Value::Object(props);
    if !required.is_empty() {
        schema["required"] = Value::Array(required);
    }
}

fn types_to_json_schema(types: &[SchemaType], schema: &mut Value) {
    match types {
        // no values observed, accept anything
        [] => {}
        [single] => type_to_json_schema(single, schema),
        _ => {
            let one_of: Vec<Value> = types
                .iter()
                .map(|t| {
                    let mut sub_schema = serde_json::json!({});
                    type_to_json_schema(t, &mut sub_schema);
                    sub_schema
                })
                .collect();
            schema["oneOf"] = Value::Array(one_of);
        }
    }
}

fn type_to_json_schema(schema_type: &SchemaType, schema: &mut Value) {
    match schema_type.field_type {
        FieldType::Object => object_to_json_schema(&schema_type.fields, schema),
        FieldType::Array => {
            schema["type"] = serde_json::json!("array");
            let mut items_schema = serde_json::json!({});
            types_to_json_schema(&schema_type.item_types, &mut items_schema);
            schema["items"] = items_schema;
        }
        other => {
            schema["type"] = serde_json::json!(other.type_name());
        }
    }
}
