//! Registry error types

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A connection with this id is already registered
    DuplicateConnection(u64),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateConnection(id) => {
                write!(f, "Connection already registered: {}", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
