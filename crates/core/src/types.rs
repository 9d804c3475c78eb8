/// Job identifiers are opaque strings assigned by the backend.
pub type JobId = String;

/// The backend reports naive local timestamps (no offset).
pub type Timestamp = chrono::NaiveDateTime;
