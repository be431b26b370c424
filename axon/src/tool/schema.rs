//! Tool input schemas: a JSON-schema-shaped dialect with validation.
//!
//! A [`ToolSchema`] is always an object schema: named properties, a
//! required set, and an additional-properties switch. Validity of the
//! schema itself ([`ToolSchema::validate`]) and validation of inputs
//! against it ([`ToolSchema::validate_input`]) are separate operations;
//! both are idempotent.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::AgentError;

/// Process-wide compiled-pattern cache shared by every schema validation.
static PATTERN_CACHE: Lazy<Mutex<HashMap<String, Regex>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Clears the compiled-pattern cache (process shutdown hook).
pub fn clear_pattern_cache() {
    PATTERN_CACHE.lock().expect("pattern cache lock").clear();
}

fn pattern_matches(pattern: &str, text: &str) -> Result<bool, AgentError> {
    let mut cache = PATTERN_CACHE.lock().expect("pattern cache lock");
    if !cache.contains_key(pattern) {
        let compiled = Regex::new(pattern)
            .map_err(|e| AgentError::Validation(format!("bad pattern {pattern:?}: {e}")))?;
        cache.insert(pattern.to_string(), compiled);
    }
    Ok(cache
        .get(pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false))
}

/// The JSON type of one property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Schema for one named property.
#[derive(Clone, Debug, Default)]
pub struct PropertySchema {
    pub ty: Option<PropertyType>,
    pub description: Option<String>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub format: Option<String>,
    pub enum_values: Option<Vec<Value>>,
    /// Element schema; required when `ty` is Array.
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn of(ty: PropertyType) -> Self {
        Self {
            ty: Some(ty),
            ..Self::default()
        }
    }

    pub fn string() -> Self {
        Self::of(PropertyType::String)
    }

    pub fn number() -> Self {
        Self::of(PropertyType::Number)
    }

    pub fn integer() -> Self {
        Self::of(PropertyType::Integer)
    }

    pub fn boolean() -> Self {
        Self::of(PropertyType::Boolean)
    }

    pub fn object() -> Self {
        Self::of(PropertyType::Object)
    }

    pub fn array(items: PropertySchema) -> Self {
        Self {
            ty: Some(PropertyType::Array),
            items: Some(Box::new(items)),
            ..Self::default()
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.minimum = Some(min);
        self.maximum = Some(max);
        self
    }

    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_length = Some(min);
        self.max_length = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    fn validate(&self, path: &str) -> Result<(), AgentError> {
        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                return Err(AgentError::Validation(format!(
                    "{path}: minimum {min} exceeds maximum {max}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(AgentError::Validation(format!(
                    "{path}: minLength {min} exceeds maxLength {max}"
                )));
            }
        }
        if self.ty == Some(PropertyType::Array) && self.items.is_none() {
            return Err(AgentError::Validation(format!(
                "{path}: array property must define items"
            )));
        }
        if let Some(items) = &self.items {
            items.validate(&format!("{path}.items"))?;
        }
        Ok(())
    }

    fn validate_value(&self, path: &str, value: &Value) -> Result<(), AgentError> {
        if let Some(ty) = self.ty {
            if !ty.accepts(value) {
                return Err(AgentError::Validation(format!(
                    "{path}: expected {}, got {value}",
                    ty.as_str()
                )));
            }
        }
        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(value) {
                return Err(AgentError::Validation(format!(
                    "{path}: {value} is not one of the allowed values"
                )));
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    return Err(AgentError::Validation(format!("{path}: {n} below minimum {min}")));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    return Err(AgentError::Validation(format!("{path}: {n} above maximum {max}")));
                }
            }
        }
        if let Some(s) = value.as_str() {
            let chars = s.chars().count();
            if let Some(min) = self.min_length {
                if chars < min {
                    return Err(AgentError::Validation(format!(
                        "{path}: length {chars} below minLength {min}"
                    )));
                }
            }
            if let Some(max) = self.max_length {
                if chars > max {
                    return Err(AgentError::Validation(format!(
                        "{path}: length {chars} above maxLength {max}"
                    )));
                }
            }
            if let Some(pattern) = &self.pattern {
                if !pattern_matches(pattern, s)? {
                    return Err(AgentError::Validation(format!(
                        "{path}: {s:?} does not match pattern {pattern:?}"
                    )));
                }
            }
        }
        if let (Some(items), Some(elements)) = (&self.items, value.as_array()) {
            for (i, element) in elements.iter().enumerate() {
                items.validate_value(&format!("{path}[{i}]"), element)?;
            }
        }
        Ok(())
    }

    fn to_value(&self) -> Value {
        let mut out = Map::new();
        if let Some(ty) = self.ty {
            out.insert("type".into(), json!(ty.as_str()));
        }
        if let Some(d) = &self.description {
            out.insert("description".into(), json!(d));
        }
        if let Some(v) = self.minimum {
            out.insert("minimum".into(), json!(v));
        }
        if let Some(v) = self.maximum {
            out.insert("maximum".into(), json!(v));
        }
        if let Some(v) = self.min_length {
            out.insert("minLength".into(), json!(v));
        }
        if let Some(v) = self.max_length {
            out.insert("maxLength".into(), json!(v));
        }
        if let Some(v) = &self.pattern {
            out.insert("pattern".into(), json!(v));
        }
        if let Some(v) = &self.format {
            out.insert("format".into(), json!(v));
        }
        if let Some(v) = &self.enum_values {
            out.insert("enum".into(), json!(v));
        }
        if let Some(items) = &self.items {
            out.insert("items".into(), items.to_value());
        }
        Value::Object(out)
    }
}

/// Object schema for a tool's input.
#[derive(Clone, Debug, Default)]
pub struct ToolSchema {
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
    pub additional_properties: bool,
}

impl ToolSchema {
    /// Empty object schema; unknown keys rejected until
    /// [`ToolSchema::allow_additional`].
    pub fn object() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn required_property(self, name: impl Into<String>, schema: PropertySchema) -> Self {
        let name = name.into();
        let mut with = self.property(name.clone(), schema);
        with.required.push(name);
        with
    }

    pub fn allow_additional(mut self) -> Self {
        self.additional_properties = true;
        self
    }

    /// Schema validity per the invariants: required names exist, numeric
    /// and length bounds are ordered, arrays define items.
    pub fn validate(&self) -> Result<(), AgentError> {
        for name in &self.required {
            if !self.properties.contains_key(name) {
                return Err(AgentError::Validation(format!(
                    "required property {name:?} is not declared"
                )));
            }
        }
        for (name, prop) in &self.properties {
            prop.validate(name)?;
        }
        Ok(())
    }

    /// Validates one input document against this schema.
    pub fn validate_input(&self, input: &Value) -> Result<(), AgentError> {
        let object = input
            .as_object()
            .ok_or_else(|| AgentError::Validation(format!("input must be an object, got {input}")))?;

        for name in &self.required {
            if !object.contains_key(name) {
                return Err(AgentError::Validation(format!(
                    "missing required property {name:?}"
                )));
            }
        }
        for (name, value) in object {
            match self.properties.get(name) {
                Some(prop) => prop.validate_value(name, value)?,
                None if self.additional_properties => {}
                None => {
                    return Err(AgentError::Validation(format!(
                        "unknown property {name:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// JSON-schema rendering for prompts and wire formats.
    pub fn to_value(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, prop)| (name.clone(), prop.to_value()))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
            "additionalProperties": self.additional_properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_schema() -> ToolSchema {
        ToolSchema::object()
            .required_property("query", PropertySchema::string().length(1, 200))
            .property("limit", PropertySchema::integer().range(1.0, 50.0))
    }

    #[test]
    fn valid_input_passes_and_validation_is_idempotent() {
        let schema = search_schema();
        let input = json!({"query": "rust", "limit": 5});
        schema.validate_input(&input).unwrap();
        // Validating a value that already passed changes nothing.
        schema.validate_input(&input).unwrap();
    }

    #[test]
    fn missing_required_property_is_rejected() {
        let err = search_schema()
            .validate_input(&json!({"limit": 3}))
            .unwrap_err();
        assert!(err.to_string().contains("query"));
    }

    #[test]
    fn unknown_property_is_rejected_unless_allowed() {
        let input = json!({"query": "x", "extra": true});
        assert!(search_schema().validate_input(&input).is_err());
        let permissive = search_schema().allow_additional();
        permissive.validate_input(&input).unwrap();
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let err = search_schema()
            .validate_input(&json!({"query": 42}))
            .unwrap_err();
        assert!(err.to_string().contains("expected string"));
    }

    #[test]
    fn range_and_length_bounds_are_enforced() {
        let schema = search_schema();
        assert!(schema
            .validate_input(&json!({"query": "x", "limit": 0}))
            .is_err());
        assert!(schema
            .validate_input(&json!({"query": "x", "limit": 51}))
            .is_err());
        assert!(schema.validate_input(&json!({"query": ""})).is_err());
    }

    #[test]
    fn pattern_constraint_uses_cached_regex() {
        let schema = ToolSchema::object()
            .required_property("id", PropertySchema::string().pattern("^[a-z]+-[0-9]+$"));
        schema.validate_input(&json!({"id": "abc-12"})).unwrap();
        assert!(schema.validate_input(&json!({"id": "nope"})).is_err());
        // Second use hits the cache; same outcome.
        schema.validate_input(&json!({"id": "xyz-9"})).unwrap();
    }

    #[test]
    fn enum_membership_is_enforced() {
        let schema = ToolSchema::object().required_property(
            "mode",
            PropertySchema::string().one_of(vec![json!("fast"), json!("slow")]),
        );
        schema.validate_input(&json!({"mode": "fast"})).unwrap();
        assert!(schema.validate_input(&json!({"mode": "medium"})).is_err());
    }

    #[test]
    fn array_items_are_validated_elementwise() {
        let schema = ToolSchema::object()
            .required_property("tags", PropertySchema::array(PropertySchema::string()));
        schema.validate_input(&json!({"tags": ["a", "b"]})).unwrap();
        let err = schema
            .validate_input(&json!({"tags": ["a", 1]}))
            .unwrap_err();
        assert!(err.to_string().contains("tags[1]"));
    }

    #[test]
    fn schema_validity_rejects_undeclared_required() {
        let mut schema = ToolSchema::object();
        schema.required.push("ghost".into());
        assert!(schema.validate().is_err());
    }

    #[test]
    fn schema_validity_rejects_inverted_bounds_and_itemless_arrays() {
        let bad_range =
            ToolSchema::object().property("n", PropertySchema::number().range(10.0, 1.0));
        assert!(bad_range.validate().is_err());

        let bad_len =
            ToolSchema::object().property("s", PropertySchema::string().length(5, 2));
        assert!(bad_len.validate().is_err());

        let mut itemless = PropertySchema::of(PropertyType::Array);
        itemless.items = None;
        let bad_array = ToolSchema::object().property("xs", itemless);
        assert!(bad_array.validate().is_err());
    }

    #[test]
    fn to_value_renders_json_schema_shape() {
        let rendered = search_schema().to_value();
        assert_eq!(rendered["type"], json!("object"));
        assert_eq!(rendered["properties"]["query"]["type"], json!("string"));
        assert_eq!(rendered["required"], json!(["query"]));
        assert_eq!(rendered["additionalProperties"], json!(false));
    }
}
