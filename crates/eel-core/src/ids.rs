use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation key shared by a Command and its Response.
///
/// Generated ids look like `"<function>|<random fraction>"`; ids received
/// from the peer are kept verbatim whatever their shape.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn generate(function: &str) -> Self {
        Self(format!("{}|{}", function, rand::random::<f64>()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Function name encoded in the id prefix. The random suffix never
    /// holds a `|`, so names that do are kept whole.
    pub fn function(&self) -> &str {
        self.0.rsplit_once('|').map_or(self.0.as_str(), |(function, _)| function)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies one accepted duplex connection.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
