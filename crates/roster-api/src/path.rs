//! Coordination tree layout
//!
//! ```text
//! base path
//! |_______ service A name
//!              |__________ instance 1 id --> (serialized InstanceRecord)
//!              |__________ instance 2 id --> (serialized InstanceRecord)
//! |_______ service B name
//!              |__________ ...
//! ```

/// A path that is not an absolute, normalized tree path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid path '{path}': {reason}")]
pub struct InvalidPath {
    pub path: String,
    pub reason: &'static str,
}

/// Check that `path` is absolute with no empty segments or trailing slash.
pub fn validate(path: &str) -> Result<(), InvalidPath> {
    let invalid = |reason| InvalidPath {
        path: path.to_string(),
        reason,
    };

    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("must not end with '/'"));
    }
    if path[1..].split('/').any(str::is_empty) {
        return Err(invalid("empty path segment"));
    }
    Ok(())
}

/// Check that `name` can be used as a single path segment.
pub fn validate_segment(name: &str) -> Result<(), InvalidPath> {
    if name.is_empty() {
        return Err(InvalidPath {
            path: name.to_string(),
            reason: "empty name",
        });
    }
    if name.contains('/') {
        return Err(InvalidPath {
            path: name.to_string(),
            reason: "name must not contain '/'",
        });
    }
    Ok(())
}

/// Join a child segment onto a parent path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Path of the node holding all instances of `service_name`.
pub fn service_path(base_path: &str, service_name: &str) -> String {
    join(base_path, service_name)
}

/// Path of a single instance node.
pub fn instance_path(base_path: &str, service_name: &str, instance_id: &str) -> String {
    join(&service_path(base_path, service_name), instance_id)
}

/// Parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
