use ulid::Ulid;

use crate::model::ConflictEntry;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// One or more requested resources are already booked in the window.
    Conflict(Vec<ConflictEntry>),
    /// The resource is already allocated to this event.
    DuplicateAllocation {
        resource_id: Ulid,
        event_id: Ulid,
    },
    /// The resource still has allocations and cannot be deleted.
    ResourceInUse(Ulid),
    Validation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(entries) => {
                write!(f, "conflict:")?;
                for e in entries {
                    write!(
                        f,
                        " {} is busy with '{}' ({});",
                        e.resource_name, e.event_title, e.event_id
                    )?;
                }
                Ok(())
            }
            EngineError::DuplicateAllocation {
                resource_id,
                event_id,
            } => {
                write!(
                    f,
                    "resource {resource_id} already allocated to event {event_id}"
                )
            }
            EngineError::ResourceInUse(id) => {
                write!(f, "cannot delete resource {id}: still allocated to events")
            }
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
