// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Validation
//!
//! Consumers validate raw payloads before any handler runs. A payload rejected
//! here is dead-lettered immediately: redelivering it cannot make it valid.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt, marker::PhantomData};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("payload validation failed: {details}")]
pub struct ValidationError {
    pub details: String,
}

impl ValidationError {
    pub fn new(details: impl fmt::Display) -> Self {
        ValidationError {
            details: details.to_string(),
        }
    }
}

/// Schema collaborator: turns raw bytes into a parsed value or refuses them.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, raw: &[u8]) -> Result<Value, ValidationError>;
}

/// Accepts any well-formed JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonValidator;

impl PayloadValidator for JsonValidator {
    fn validate(&self, raw: &[u8]) -> Result<Value, ValidationError> {
        serde_json::from_slice(raw).map_err(ValidationError::new)
    }
}

/// Accepts JSON documents that deserialize into `T`.
pub struct TypedValidator<T> {
    _schema: PhantomData<fn() -> T>,
}

impl<T> TypedValidator<T> {
    pub fn new() -> Self {
        TypedValidator {
            _schema: PhantomData,
        }
    }
}

impl<T> Default for TypedValidator<T> {
    fn default() -> Self {
        TypedValidator::new()
    }
}

impl<T> PayloadValidator for TypedValidator<T>
where
    T: DeserializeOwned,
{
    fn validate(&self, raw: &[u8]) -> Result<Value, ValidationError> {
        let value: Value = serde_json::from_slice(raw).map_err(ValidationError::new)?;
        serde_json::from_value::<T>(value.clone()).map_err(ValidationError::new)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Order {
        id: u64,
        amount: f64,
    }

    #[test]
    fn json_validator_refuses_malformed_documents() {
        assert!(JsonValidator.validate(br#"{"id": 1"#).is_err());
        assert_eq!(
            JsonValidator.validate(br#"{"id": 1}"#).unwrap(),
            serde_json::json!({"id": 1})
        );
    }

    #[test]
    fn typed_validator_checks_the_shape() {
        let validator = TypedValidator::<Order>::new();

        assert!(validator.validate(br#"{"id": 1, "amount": 9.5}"#).is_ok());

        let err = validator.validate(br#"{"id": "one"}"#).unwrap_err();
        assert!(err.details.contains("invalid type"));
    }
}
