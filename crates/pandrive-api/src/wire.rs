//! Wire-level response shapes
//!
//! The provider wraps every API payload in the same envelope and is loose
//! about JSON types: flags arrive as `true` or `1`, sizes as numbers or
//! strings, and some fields switch between an object and an array depending
//! on the outcome. Everything is normalized here, at the boundary.

use serde::{de, de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;

use crate::ApiError;

// ============================================================================
// Error extraction contract
// ============================================================================

/// Implemented by every response type that can carry an embedded failure
pub trait ApiResponse {
    /// Returns the classified error if the response reports one.
    fn error(&self) -> Option<ApiError>;
}

// ============================================================================
// Envelope
// ============================================================================

/// Common envelope `{state, code, message, data}`
///
/// `data` is kept as raw JSON until the envelope reports success, because
/// failed responses often carry `[]` or `""` where an object is expected.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default, deserialize_with = "opt_bool_lenient")]
    pub state: Option<bool>,
    #[serde(default, deserialize_with = "i64_lenient")]
    pub code: i64,
    #[serde(default, deserialize_with = "i64_lenient")]
    pub errno: i64,
    #[serde(default, deserialize_with = "string_lenient")]
    pub message: String,
    #[serde(default, deserialize_with = "string_lenient")]
    pub error: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    fn effective_code(&self) -> i64 {
        if self.code != 0 {
            self.code
        } else {
            self.errno
        }
    }

    fn effective_message(&self) -> &str {
        if !self.message.is_empty() {
            &self.message
        } else {
            &self.error
        }
    }

    /// Deserializes `data` into the expected payload type.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        serde_json::from_value(self.data)
            .map_err(|e| ApiError::InvalidResponse(format!("unexpected data shape: {}", e)))
    }
}

impl ApiResponse for Envelope {
    fn error(&self) -> Option<ApiError> {
        let code = self.effective_code();
        let ok = self.state.unwrap_or(code == 0);
        if ok {
            return None;
        }
        Some(ApiError::from_provider_code(code, self.effective_message()))
    }
}

// ============================================================================
// OneOrMany
// ============================================================================

/// A field that is either a single value or a list of them
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }

    pub fn into_first(self) -> Option<T> {
        self.into_vec().into_iter().next()
    }
}

// ============================================================================
// Lenient scalar deserializers
// ============================================================================

fn value_to_i64<E: de::Error>(value: Value) -> Result<i64, E> {
    match value {
        Value::Null => Ok(0),
        Value::Bool(b) => Ok(b as i64),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| E::custom(format!("number out of range: {}", n))),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s.trim().parse().map_err(E::custom),
        other => Err(E::custom(format!("expected integer, got {}", other))),
    }
}

pub fn i64_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    value_to_i64(Value::deserialize(d)?)
}

pub fn u64_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let n = value_to_i64::<D::Error>(Value::deserialize(d)?)?;
    u64::try_from(n).map_err(de::Error::custom)
}

fn value_to_bool<E: de::Error>(value: Value) -> Result<bool, E> {
    match value {
        Value::Bool(b) => Ok(b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => value_to_i64::<E>(other).map(|n| n != 0),
    }
}

pub fn bool_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    value_to_bool(Value::deserialize(d)?)
}

/// `null` reads as absent.
pub fn opt_bool_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        other => value_to_bool(other).map(Some),
    }
}

pub fn string_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!("expected string, got {}", other))),
    }
}
