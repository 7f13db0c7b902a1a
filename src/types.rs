pub mod missing;
pub mod timestamp;

// Re-export types for convenience.
pub use crate::types::missing::Missing;
pub use crate::types::timestamp::Timestamp;
