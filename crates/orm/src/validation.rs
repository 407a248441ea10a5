//! Property validation
//!
//! Validators are attached per property on the schema and run, in declaration
//! order, every time an instance is saved.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::instance::Instance;

/// A single failed check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    /// The property that failed validation
    pub property: String,
    /// The offending value
    pub value: Value,
    /// Human-readable error message
    pub message: String,
    /// Name of the rule that rejected the value
    pub rule: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.message)
    }
}

/// Failures collected while validating one instance, in rule order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&ValidationError> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// Errors reported for `property`
    pub fn for_property<'a>(&'a self, property: &'a str) -> impl Iterator<Item = &'a ValidationError> {
        self.0.iter().filter(move |e| e.property == property)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// What a validator sees besides the value itself.
pub struct ValidationContext<'a> {
    pub property: &'a str,
    pub instance: &'a Instance,
}

/// A check run against one property value.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate `value`; `Err` carries the failure message
    async fn validate(&self, value: &Value, ctx: &ValidationContext<'_>) -> Result<(), String>;

    /// Rule name reported in [`ValidationError::rule`]
    fn rule_name(&self) -> &'static str;
}

pub type SharedValidator = Arc<dyn Validator>;

pub mod validators {
    //! Built-in validators. All but [`required`] accept a null value.

    use regex::Regex;

    use super::*;
    use crate::error::{ModelError, ModelResult};

    #[derive(Debug, Clone, Default)]
    pub struct RequiredValidator {
        message: Option<String>,
    }

    impl RequiredValidator {
        pub fn message(mut self, message: impl Into<String>) -> Self {
            self.message = Some(message.into());
            self
        }
    }

    #[async_trait]
    impl Validator for RequiredValidator {
        async fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> Result<(), String> {
            if value.is_null() {
                return Err(self.message.clone().unwrap_or_else(|| "required".to_string()));
            }
            Ok(())
        }

        fn rule_name(&self) -> &'static str {
            "required"
        }
    }

    pub fn required() -> RequiredValidator {
        RequiredValidator::default()
    }

    /// Numeric bounds, both inclusive.
    #[derive(Debug, Clone)]
    pub struct RangeValidator {
        min: Option<f64>,
        max: Option<f64>,
        message: Option<String>,
    }

    impl RangeValidator {
        pub fn message(mut self, message: impl Into<String>) -> Self {
            self.message = Some(message.into());
            self
        }
    }

    #[async_trait]
    impl Validator for RangeValidator {
        async fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> Result<(), String> {
            if value.is_null() {
                return Ok(());
            }
            let fail = || Err(self.message.clone().unwrap_or_else(|| "out-of-range-number".to_string()));

            let Some(number) = value.as_f64() else {
                return fail();
            };
            if self.min.is_some_and(|min| number < min) || self.max.is_some_and(|max| number > max) {
                return fail();
            }
            Ok(())
        }

        fn rule_name(&self) -> &'static str {
            "range"
        }
    }

    pub fn range(min: Option<f64>, max: Option<f64>) -> RangeValidator {
        RangeValidator {
            min,
            max,
            message: None,
        }
    }

    /// Length bounds for strings (in characters) and arrays.
    #[derive(Debug, Clone)]
    pub struct LengthValidator {
        min: Option<usize>,
        max: Option<usize>,
        message: Option<String>,
    }

    impl LengthValidator {
        pub fn message(mut self, message: impl Into<String>) -> Self {
            self.message = Some(message.into());
            self
        }
    }

    #[async_trait]
    impl Validator for LengthValidator {
        async fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> Result<(), String> {
            let len = match value {
                Value::Null => return Ok(()),
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                _ => return Err("not-a-string".to_string()),
            };
            if self.min.is_some_and(|min| len < min) || self.max.is_some_and(|max| len > max) {
                return Err(self
                    .message
                    .clone()
                    .unwrap_or_else(|| "out-of-range-length".to_string()));
            }
            Ok(())
        }

        fn rule_name(&self) -> &'static str {
            "length"
        }
    }

    pub fn length(min: Option<usize>, max: Option<usize>) -> LengthValidator {
        LengthValidator {
            min,
            max,
            message: None,
        }
    }

    #[derive(Debug, Clone)]
    pub struct PatternValidator {
        regex: Regex,
        message: Option<String>,
    }

    impl PatternValidator {
        pub fn message(mut self, message: impl Into<String>) -> Self {
            self.message = Some(message.into());
            self
        }
    }

    #[async_trait]
    impl Validator for PatternValidator {
        async fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> Result<(), String> {
            match value {
                Value::Null => Ok(()),
                Value::String(s) if self.regex.is_match(s) => Ok(()),
                _ => Err(self
                    .message
                    .clone()
                    .unwrap_or_else(|| "no-pattern-match".to_string())),
            }
        }

        fn rule_name(&self) -> &'static str {
            "pattern"
        }
    }

    /// Fails with a schema error when `pattern` does not compile.
    pub fn pattern(pattern: &str) -> ModelResult<PatternValidator> {
        let regex = Regex::new(pattern)
            .map_err(|e| ModelError::Schema(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(PatternValidator {
            regex,
            message: None,
        })
    }

    #[derive(Debug, Clone)]
    pub struct InsideValidator {
        values: Vec<Value>,
        message: Option<String>,
    }

    impl InsideValidator {
        pub fn message(mut self, message: impl Into<String>) -> Self {
            self.message = Some(message.into());
            self
        }
    }

    #[async_trait]
    impl Validator for InsideValidator {
        async fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> Result<(), String> {
            if value.is_null() || self.values.contains(value) {
                return Ok(());
            }
            Err(self
                .message
                .clone()
                .unwrap_or_else(|| "outside-list".to_string()))
        }

        fn rule_name(&self) -> &'static str {
            "inside"
        }
    }

    pub fn inside<I, V>(values: I) -> InsideValidator
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        InsideValidator {
            values: values.into_iter().map(Into::into).collect(),
            message: None,
        }
    }

    type Check = dyn Fn(&Value, &ValidationContext<'_>) -> Result<(), String> + Send + Sync;

    /// Closure-backed validator.
    pub struct CustomValidator {
        check: Box<Check>,
    }

    #[async_trait]
    impl Validator for CustomValidator {
        async fn validate(&self, value: &Value, ctx: &ValidationContext<'_>) -> Result<(), String> {
            (self.check)(value, ctx)
        }

        fn rule_name(&self) -> &'static str {
            "custom"
        }
    }

    pub fn custom<F>(check: F) -> CustomValidator
    where
        F: Fn(&Value, &ValidationContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        CustomValidator {
            check: Box::new(check),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::validators::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_errors_display_joins_messages() {
        let mut errors = ValidationErrors::new();
        errors.push(ValidationError {
            property: "name".to_string(),
            value: Value::Null,
            message: "required".to_string(),
            rule: "required".to_string(),
        });
        errors.push(ValidationError {
            property: "age".to_string(),
            value: json!(-1),
            message: "out-of-range-number".to_string(),
            rule: "range".to_string(),
        });

        assert_eq!(errors.to_string(), "name: required; age: out-of-range-number");
        assert_eq!(errors.for_property("age").count(), 1);
    }

    #[test]
    fn test_invalid_pattern_is_a_schema_error() {
        assert!(pattern("(unclosed").is_err());
        assert!(pattern("^[a-z]+$").is_ok());
    }

    #[test]
    fn test_rule_names() {
        assert_eq!(required().rule_name(), "required");
        assert_eq!(range(None, None).rule_name(), "range");
        assert_eq!(length(None, None).rule_name(), "length");
        assert_eq!(inside([1]).rule_name(), "inside");
        assert_eq!(custom(|_, _| Ok(())).rule_name(), "custom");
    }
}
