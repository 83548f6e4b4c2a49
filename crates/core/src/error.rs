/// Typed cluster-side failures. They travel inside `anyhow::Error` and are
/// recovered with `downcast_ref` where a caller needs to branch on them.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} \"{name}\" was not found")]
    NotFound { kind: String, name: String },

    #[error(
        "{kind} \"{name}\" already exists although its name was generated with the `many` strategy; \
         random names must never collide, resource naming is broken"
    )]
    NameCollision { kind: String, name: String },

    #[error("inconsistent cluster state: {0}")]
    InconsistentClusterState(String),

    #[error("timed out after {timeout_secs}s waiting for {kind} \"{name}\" (namespace: {namespace}, api: {api_path})")]
    WatchTimeout {
        api_path: String,
        kind: String,
        name: String,
        namespace: String,
        timeout_secs: u64,
    },

    #[error("cancelled while waiting for {0}")]
    Cancelled(String),
}

fn find(err: &anyhow::Error) -> Option<&ResourceError> {
    err.chain().find_map(|e| e.downcast_ref::<ResourceError>())
}

/// True when the error (or anything it wraps) is an "already exists" conflict.
pub fn is_already_exists(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(ResourceError::AlreadyExists { .. }))
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(ResourceError::NotFound { .. }))
}
