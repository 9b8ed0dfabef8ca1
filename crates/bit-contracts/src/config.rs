//! Runtime configuration capability.

use crate::errors::BitError;
use serde_json::Value;

/// A bit whose settings can be read and changed over HTTP.
///
/// Served under `R/config`, `R/config/schema` and `R/config/value`.
/// Implementations use interior mutability; the host only holds shared
/// references.
pub trait Configurable: Send + Sync {
    /// JSON Schema describing the configuration object.
    fn schema(&self) -> Value;

    /// The whole configuration as a JSON object.
    fn get_config(&self) -> Value;

    /// Replace the whole configuration.
    fn set_config(&self, value: Value) -> Result<(), BitError>;

    /// One top-level field of the configuration.
    fn get_value(&self, key: &str) -> Option<Value> {
        self.get_config().get(key).cloned()
    }

    /// Change one top-level field by round-tripping through `set_config`.
    fn set_value(&self, key: &str, value: Value) -> Result<(), BitError> {
        let mut config = self.get_config();
        let Some(fields) = config.as_object_mut() else {
            return Err(BitError::Unsupported(
                "configuration is not an object".to_string(),
            ));
        };
        if !fields.contains_key(key) {
            return Err(BitError::NotFound(format!("config key '{key}'")));
        }
        fields.insert(key.to_string(), value);
        self.set_config(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Settings(Mutex<Value>);

    impl Configurable for Settings {
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }

        fn get_config(&self) -> Value {
            self.0.lock().clone()
        }

        fn set_config(&self, value: Value) -> Result<(), BitError> {
            *self.0.lock() = value;
            Ok(())
        }
    }

    #[test]
    fn test_value_accessors_use_whole_config() {
        let settings = Settings(Mutex::new(json!({ "greeting": "hi", "limit": 3 })));

        assert_eq!(settings.get_value("limit"), Some(json!(3)));
        settings.set_value("limit", json!(5)).unwrap();
        assert_eq!(settings.get_config()["limit"], 5);
        assert_eq!(settings.get_config()["greeting"], "hi");

        assert!(matches!(
            settings.set_value("missing", json!(1)),
            Err(BitError::NotFound(_))
        ));
    }
}
