//! Argument capture for re-invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The arguments a task is re-invoked with: positional values plus a
/// keyword map.
///
/// Values are self-describing JSON so any store can persist them as text and
/// round-trip the primitive types the caller passed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positional(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keyword: Map::new(),
        }
    }

    /// Append one positional argument.
    pub fn arg(mut self, value: Value) -> Self {
        self.positional.push(value);
        self
    }

    /// Set one keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.keyword.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Drop the leading positional argument (the receiver of a bound
    /// method) before persistence.
    pub fn strip_receiver(mut self) -> Self {
        if !self.positional.is_empty() {
            self.positional.remove(0);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builders_accumulate() {
        let args = CallArgs::new()
            .arg(json!(1))
            .arg(json!("two"))
            .kwarg("flag", json!(true));
        assert_eq!(args.positional, vec![json!(1), json!("two")]);
        assert_eq!(args.keyword.get("flag"), Some(&json!(true)));
        assert!(!args.is_empty());
    }

    #[test]
    fn strip_receiver_drops_only_the_head() {
        let args = CallArgs::new().arg(json!("self")).arg(json!(42));
        let stripped = args.strip_receiver();
        assert_eq!(stripped.positional, vec![json!(42)]);

        // Stripping an empty tuple is a no-op.
        assert!(CallArgs::new().strip_receiver().positional.is_empty());
    }

    #[test]
    fn json_round_trip() {
        let args = CallArgs::with_positional(vec![json!(1.5), json!("x")])
            .kwarg("name", json!("redo"));
        let text = serde_json::to_string(&args).unwrap();
        let back: CallArgs = serde_json::from_str(&text).unwrap();
        assert_eq!(back, args);
    }
}
