// Error handling framework
// One enum per domain; nothing in the core is fatal, every caught
// condition continues the loop or rearms the next trigger.

use thiserror::Error;

/// Durable store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Filesystem error: {0}")]
    Io(String),

    #[error("Serialization failed for key '{key}': {reason}")]
    Serialization { key: String, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Schedule-related errors (business hours, daily bulk, slot entries)
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid time '{0}': expected HH:MM")]
    InvalidTimeFormat(String),

    #[error("A schedule entry already exists for {0}")]
    DuplicateEntry(String),

    #[error("No schedule entry found for {0}")]
    EntryNotFound(String),

    #[error("Invalid business hours window: start {start} must be before end {end}")]
    InvalidWindow { start: u32, end: u32 },

    #[error("Schedule calculation failed: {0}")]
    CalculationFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Alarm error: {0}")]
    Alarm(#[from] AlarmError),
}

/// Actuation errors at the external collaborator boundary.
/// The job runner treats every variant as a plain failure for that
/// iteration; none of them propagate out of the loop.
#[derive(Error, Debug)]
pub enum ActuationError {
    #[error("Failed to acquire execution context for {url}: {reason}")]
    ContextAcquisitionFailed { url: String, reason: String },

    #[error("Actuator request failed: {0}")]
    RequestFailed(String),

    #[error("Actuator returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Durable alarm errors
#[derive(Error, Debug)]
pub enum AlarmError {
    #[error("Invalid alarm spec for '{name}': {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidTimeFormat("9am".to_string());
        assert!(err.to_string().contains("expected HH:MM"));
    }

    #[test]
    fn test_duplicate_entry_names_the_time() {
        let err = ScheduleError::DuplicateEntry("09:00".to_string());
        assert!(err.to_string().contains("09:00"));
    }

    #[test]
    fn test_store_error_converts_into_schedule_error() {
        let err: ScheduleError = StoreError::Io("disk full".to_string()).into();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_actuation_error_display() {
        let err = ActuationError::ContextAcquisitionFailed {
            url: "https://example.com".to_string(),
            reason: "no free tab".to_string(),
        };
        assert!(err.to_string().contains("no free tab"));
    }
}
