//! Node, topic and service name handling
//!
//! Names in the graph are slash-rooted paths. Relative names are resolved
//! against the root namespace; there is no remapping.

use crate::error::SessionError;
use crate::time::current_time_millis;

/// Resolve a node name to its slash-rooted form
pub fn validate_node_name(name: &str) -> Result<String, SessionError> {
    resolve_name(name)
}

/// Resolve a topic or service name to its slash-rooted form.
///
/// `chatter` becomes `/chatter`; `/chatter` is returned unchanged.
pub fn resolve_name(name: &str) -> Result<String, SessionError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Err(SessionError::InvalidName(format!("'{}' is empty", name)));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(SessionError::InvalidName(format!(
            "'{}' contains whitespace",
            name
        )));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{}", trimmed))
    }
}

/// Make a node name unique to this process and instant
pub fn anonymize_node_name(name: &str) -> String {
    format!("{}_{}_{}", name, std::process::id(), current_time_millis())
}
