//! String identifiers used across the router.
//!
//! Workflow and activity names are compared byte-for-byte. A correlation key
//! taken from an inbound message doubles as the workflow instance id, so that
//! redelivery of the same message resolves to the same instance.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps the given string without validation.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the underlying string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the wrapper, returning the owned string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_newtype!(
    /// Unique name of a registered workflow (orchestrator).
    WorkflowName
);

string_newtype!(
    /// Name under which an activity is registered in the activity catalog.
    ActivityName
);

string_newtype!(
    /// Key correlating an inbound message with its workflow instance.
    CorrelationKey
);

string_newtype!(
    /// Identifier of a started workflow instance.
    InstanceId
);

impl CorrelationKey {
    /// Returns `true` if the key is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// The instance id a dispatch with this key starts.
    #[must_use]
    pub fn to_instance_id(&self) -> InstanceId {
        InstanceId(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn workflow_name_borrows_as_str_for_map_lookup() {
        let mut map = HashMap::new();
        map.insert(WorkflowName::from("sn-sub-orchestrator"), 1);
        assert_eq!(map.get("sn-sub-orchestrator"), Some(&1));
    }

    #[test]
    fn correlation_key_becomes_instance_id_verbatim() {
        let key = CorrelationKey::from("ORDER-42");
        assert_eq!(key.to_instance_id().as_str(), "ORDER-42");
    }

    #[test]
    fn blank_correlation_keys_are_detected() {
        assert!(CorrelationKey::from("").is_blank());
        assert!(CorrelationKey::from("   ").is_blank());
        assert!(!CorrelationKey::from("k").is_blank());
    }

    #[test]
    fn names_serialize_as_plain_strings() {
        let name = ActivityName::from("validate-document");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"validate-document\"");
        let back: ActivityName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
