//! Well-known operation tags.

/// Operation tags understood out of the box by a server stub.
pub mod operation_names {
    /// Fire a notification; always answered with a canned success body.
    pub const NOTIFY: &str = "NOTIFY";
}

/// Message of the success body returned for `NOTIFY`.
pub const NOTIFY_SUCCESS_MESSAGE: &str = "Notification sent successfully.";
