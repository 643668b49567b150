//! Payload models: typed validation of envelope data
//!
//! A subscription names the Rust type its payloads must decode into. Shape
//! checking is serde's job; `Model::validate` adds semantic checks that a
//! type signature cannot express (ranges, non-empty strings, ...).

use crate::error::{BusError, Result};
use serde::de::DeserializeOwned;

/// A payload type a subscription can expect
///
/// ```rust
/// use homebot_bus::Model;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Say {
///     text: String,
/// }
///
/// impl Model for Say {
///     fn validate(&self) -> Result<(), String> {
///         if self.text.trim().is_empty() {
///             return Err("text cannot be blank".to_string());
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Model: DeserializeOwned + Send + 'static {
    /// Semantic checks run after a successful decode
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Name used in validation errors and logs
    fn model_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Untyped payloads accept any JSON
impl Model for serde_json::Value {
    fn model_name() -> &'static str {
        "json"
    }
}

/// Decode and validate a JSON value as `T`
pub fn validate_as<T: Model>(value: &serde_json::Value) -> Result<T> {
    let model = T::deserialize(value).map_err(|e| BusError::validation(T::model_name(), e.to_string()))?;
    model
        .validate()
        .map_err(|reason| BusError::validation(T::model_name(), reason))?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Move {
        angle: i32,
    }

    impl Model for Move {
        fn validate(&self) -> std::result::Result<(), String> {
            if !(-180..=180).contains(&self.angle) {
                return Err(format!("angle {} out of range", self.angle));
            }
            Ok(())
        }

        fn model_name() -> &'static str {
            "Move"
        }
    }

    #[test]
    fn test_valid_payload() {
        let m: Move = validate_as(&json!({"angle": 90})).unwrap();
        assert_eq!(m.angle, 90);
    }

    #[test]
    fn test_wrong_shape() {
        let err = validate_as::<Move>(&json!({"speed": 3})).unwrap_err();
        assert!(matches!(err, BusError::Validation { ref target, .. } if target == "Move"));
    }

    #[test]
    fn test_semantic_check() {
        let err = validate_as::<Move>(&json!({"angle": 400})).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_untyped_accepts_anything() {
        assert!(validate_as::<serde_json::Value>(&json!([1, 2, 3])).is_ok());
        assert!(validate_as::<serde_json::Value>(&json!(null)).is_ok());
    }
}
