//! Strongly-typed identifiers used across the APM core.
//!
//! Identifiers are caller-chosen strings (e.g. `"pack-station-1"`), not
//! generated UUIDs: templates, agents and processes are addressed by the names
//! the configuring layer gives them.

use core::borrow::Borrow;

use serde::{Deserialize, Serialize};

/// Identifier of a registered agent (worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

/// Identifier of a step inside a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

/// Identifier of a process template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(String);

/// Identifier of a process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&$t> for $t {
            fn from(value: &$t) -> Self {
                value.clone()
            }
        }

        impl Borrow<str> for $t {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $t {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $t {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

impl_string_newtype!(AgentId);
impl_string_newtype!(StepId);
impl_string_newtype!(TemplateId);
impl_string_newtype!(ProcessId);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn ids_can_be_looked_up_by_plain_str() {
        let mut map = HashMap::new();
        map.insert(TemplateId::from("T1"), 1);

        assert_eq!(map.get("T1"), Some(&1));
        assert_eq!(map.get("T2"), None);
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = AgentId::new("A1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"A1\"");
        assert_eq!(id, "A1");
        assert_eq!(id.to_string(), "A1");
    }
}
