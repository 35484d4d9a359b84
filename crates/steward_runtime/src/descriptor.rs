//! Start descriptors.
//!
//! A descriptor names an entry point registered on every member and carries its
//! arguments. The supervision engine never looks inside; only the launcher does.

use serde::{Deserialize, Serialize};

/// Instructions to launch one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDescriptor {
    /// Name of the entry point in the [`EntryRegistry`](crate::EntryRegistry)
    pub entry: String,
    /// Arguments handed to the entry point
    #[serde(default)]
    pub args: serde_json::Value,
}

impl StartDescriptor {
    /// Create a descriptor without arguments
    #[must_use]
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            args: serde_json::Value::Null,
        }
    }

    /// Set arguments
    #[must_use]
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults_to_null_args() {
        let descriptor = StartDescriptor::new("idle");
        assert_eq!(descriptor.entry, "idle");
        assert!(descriptor.args.is_null());
    }

    #[test]
    fn test_descriptor_json_without_args() {
        let descriptor: StartDescriptor = serde_json::from_str(r#"{"entry":"idle"}"#).unwrap();
        assert_eq!(descriptor, StartDescriptor::new("idle"));
    }

    #[test]
    fn test_descriptor_with_args() {
        let descriptor = StartDescriptor::new("sleep").with_args(serde_json::json!({"ms": 10}));
        assert_eq!(descriptor.args["ms"], 10);
    }
}
