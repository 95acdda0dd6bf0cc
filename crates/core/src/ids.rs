use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
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

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(LocalId);
string_id!(GlobalId);
string_id!(W3Id);

impl LocalId {
    /// Fresh time-ordered id for rows created by the engine's own adapters.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl GlobalId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl W3Id {
    /// Registry lookups expect the `@`-prefixed form.
    pub fn normalized(&self) -> String {
        if self.0.starts_with('@') {
            self.0.clone()
        } else {
            format!("@{}", self.0)
        }
    }
}

impl From<GlobalId> for W3Id {
    fn from(value: GlobalId) -> Self {
        Self(value.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_adds_prefix_once() {
        assert_eq!(W3Id::new("alice").normalized(), "@alice");
        assert_eq!(W3Id::new("@alice").normalized(), "@alice");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = GlobalId::new("global-m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"global-m1\"");
        let back: GlobalId = serde_json::from_str("\"global-m1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(LocalId::generate(), LocalId::generate());
    }
}
