use std::fmt;

/// Machine-readable error codes shared by producer and consumer paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    IncarnationStoreFailed,
    InvalidBundleVersion,
    InvalidTransportKey,
    PayloadDecodeFailed,
    PayloadEncodeFailed,
    IdentityUnresolved,
    StaleBundle,
    BaseVersionMismatch,
    StorageWriteFailed,
    StorageOpenFailed,
    TransportSendFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::IncarnationStoreFailed => "E1002",
            Self::InvalidBundleVersion => "E2001",
            Self::InvalidTransportKey => "E2002",
            Self::PayloadDecodeFailed => "E2003",
            Self::PayloadEncodeFailed => "E2004",
            Self::IdentityUnresolved => "E3001",
            Self::StaleBundle => "E4001",
            Self::BaseVersionMismatch => "E4002",
            Self::StorageWriteFailed => "E5001",
            Self::StorageOpenFailed => "E5002",
            Self::TransportSendFailed => "E6001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::IncarnationStoreFailed => "Incarnation file could not be updated",
            Self::InvalidBundleVersion => "Invalid bundle version",
            Self::InvalidTransportKey => "Invalid transport key",
            Self::PayloadDecodeFailed => "Bundle payload decode failed",
            Self::PayloadEncodeFailed => "Bundle payload encode failed",
            Self::IdentityUnresolved => "Object identity could not be resolved",
            Self::StaleBundle => "Bundle is not newer than stored state",
            Self::BaseVersionMismatch => "Delta base version does not match",
            Self::StorageWriteFailed => "Store write failed",
            Self::StorageOpenFailed => "Store could not be opened",
            Self::TransportSendFailed => "Transport send failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the hubsync config.toml and retry."),
            Self::IncarnationStoreFailed => {
                Some("Check write permissions on the incarnation file directory.")
            }
            Self::InvalidBundleVersion => {
                Some("Versions are encoded as `<incarnation>.<generation>`.")
            }
            Self::InvalidTransportKey => Some("Transport keys are `<leafHub>.<messageKind>`."),
            Self::PayloadDecodeFailed => {
                Some("Check that producer and consumer run compatible versions.")
            }
            Self::PayloadEncodeFailed | Self::IdentityUnresolved => None,
            Self::StaleBundle => Some("No action needed; a newer bundle was already applied."),
            Self::BaseVersionMismatch => {
                Some("Wait for the next complete bundle from the leaf hub.")
            }
            Self::StorageWriteFailed => Some("The message will be retried by the delivery layer."),
            Self::StorageOpenFailed => Some("Check the database path and disk permissions."),
            Self::TransportSendFailed => Some("The bundle is re-sent on the next sync tick."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigParseError,
            ErrorCode::IncarnationStoreFailed,
            ErrorCode::InvalidBundleVersion,
            ErrorCode::InvalidTransportKey,
            ErrorCode::PayloadDecodeFailed,
            ErrorCode::PayloadEncodeFailed,
            ErrorCode::IdentityUnresolved,
            ErrorCode::StaleBundle,
            ErrorCode::BaseVersionMismatch,
            ErrorCode::StorageWriteFailed,
            ErrorCode::StorageOpenFailed,
            ErrorCode::TransportSendFailed,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::BaseVersionMismatch.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }
}
