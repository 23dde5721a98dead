//! Error taxonomy and the classifier that maps driver errors onto it.
//!
//! [`DriverError`] is the single boundary where raw store failures are
//! described: codes, code names, messages, labels and per-field validation
//! detail. [`classify`] turns one into a [`Classification`] that drives retry
//! policy, breaker accounting and the user-facing response. Nothing else in
//! the crate looks at driver error shapes.
//!
//! Classification is pure and total. Priority order:
//!
//! 1. Known store error codes
//! 2. Network/timeout/server-selection failures (by kind, label or message)
//! 3. Transaction error labels
//! 4. Validation shapes (field errors)
//! 5. Fallback: persistent / unknown / medium / not retryable

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum::{AsRefStr, Display};

/// How an error is expected to behave if the operation is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorType {
    /// Likely to succeed if retried after a short wait
    Transient,
    /// Will fail the same way until the input or data changes
    Persistent,
    /// Requires operator intervention
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Query,
    Transaction,
    Validation,
    Schema,
    Authentication,
    Authorization,
    Input,
    BusinessLogic,
    Network,
    Resource,
    Configuration,
    Dependency,
    Unknown,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// Blast radius of an error as seen by end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserImpact {
    None,
    Individual,
    Group,
    All,
}

/// Validation failure for one document field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Structured verdict for a raised error. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub error_type: ErrorType,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    pub user_impact: UserImpact,
    /// Stable text safe to show to end users, independent of store wording
    pub user_friendly_message: String,
    /// Internal explanation for logs
    pub reason: String,
    /// Machine-readable code, e.g. `DUPLICATE_KEY`
    pub code: String,
    /// Native store error code, when there was one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_code: Option<i32>,
    #[serde(
        rename = "retry_after_ms",
        with = "crate::common::opt_duration_ms",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub retry_after: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

impl Classification {
    pub(crate) fn build(
        error_type: ErrorType,
        category: ErrorCategory,
        severity: Severity,
        retryable: bool,
        code: &str,
        reason: impl Into<String>,
    ) -> Self {
        let user_impact = if severity == Severity::Critical {
            UserImpact::All
        } else if category == ErrorCategory::Connection {
            UserImpact::Group
        } else {
            UserImpact::Individual
        };

        let retry_after = retryable.then(|| match category {
            ErrorCategory::Connection | ErrorCategory::Network => Duration::from_secs(5),
            ErrorCategory::Transaction => Duration::from_secs(1),
            _ => Duration::from_secs(2),
        });

        Self {
            error_type,
            category,
            severity,
            retryable,
            user_impact,
            user_friendly_message: user_message(code, category).to_string(),
            reason: reason.into(),
            code: code.to_string(),
            store_code: None,
            retry_after,
            field_errors: Vec::new(),
        }
    }

    pub(crate) fn with_store_code(mut self, code: Option<i32>) -> Self {
        self.store_code = code;
        self
    }

    pub(crate) fn with_fields(mut self, fields: Vec<FieldError>) -> Self {
        self.field_errors = fields;
        self
    }

    pub(crate) fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.error_type == ErrorType::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.error_type == ErrorType::Fatal
    }
}

/// Types that can describe themselves as a [`Classification`].
pub trait Classify {
    fn classify(&self) -> Classification;
}

/// Coarse shape of a driver failure, independent of any store code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DriverErrorKind {
    /// Server replied with a command error
    Command,
    /// Write or write-concern failure
    Write,
    Network,
    ServerSelection,
    Authentication,
    Timeout,
    /// Client-side document/schema validation
    Validation,
    InvalidArgument,
    Io,
    Other,
}

/// Driver-agnostic description of a store failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub code: Option<i32>,
    pub code_name: Option<String>,
    pub message: String,
    pub labels: Vec<String>,
    pub field_errors: Vec<FieldError>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            code_name: None,
            message: message.into(),
            labels: Vec::new(),
            field_errors: Vec::new(),
        }
    }

    /// Server command error with a numeric code.
    pub fn command(code: i32, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Command, message).with_code(code)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_code_name(mut self, name: impl Into<String>) -> Self {
        self.code_name = Some(name.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_field_error(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.field_errors.push(FieldError::new(field, message));
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.code_name) {
            (Some(code), Some(name)) => write!(f, "{} ({} {}): {}", self.kind, code, name, self.message),
            (Some(code), None) => write!(f, "{} ({}): {}", self.kind, code, self.message),
            _ => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for DriverError {}

impl Classify for DriverError {
    fn classify(&self) -> Classification {
        classify(self)
    }
}

/// Store codes that mean the connection or the primary went away.
const CONNECTION_LOSS_CODES: &[i32] = &[
    6,     // HostUnreachable
    7,     // HostNotFound
    43,    // CursorNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

const DUPLICATE_KEY_CODES: &[i32] = &[11000, 11001];

const TRANSACTION_CODES: &[i32] = &[
    24,  // LockTimeout
    112, // WriteConflict
    225, // TransactionTooOld
    244, // TransactionAborted
    251, // NoSuchTransaction
];

const INPUT_CODES: &[i32] = &[
    2,  // BadValue
    9,  // FailedToParse
    14, // TypeMismatch
];

const SCHEMA_CODES: &[i32] = &[
    26, // NamespaceNotFound
    85, // IndexOptionsConflict
    86, // IndexKeySpecsConflict
];

const CHANGE_STREAM_CODES: &[i32] = &[
    280, // ChangeStreamFatalError
    286, // ChangeStreamHistoryLost
];

const NETWORK_MESSAGE_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "econnreset",
    "econnrefused",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "socket",
    "server selection",
    "no available servers",
];

const TRANSACTION_LABELS: &[&str] = &["TransientTransactionError", "UnknownTransactionCommitResult"];

const NETWORK_LABELS: &[&str] = &["NetworkError", "RetryableWriteError"];

/// Map a driver error onto the taxonomy.
pub fn classify(error: &DriverError) -> Classification {
    use ErrorCategory as C;
    use ErrorType as T;
    use Severity as S;

    if let Some(code) = error.code {
        if let Some(classification) = classify_code(code, error) {
            return classification.with_store_code(Some(code));
        }
    }

    if error.kind == DriverErrorKind::Authentication {
        return Classification::build(
            T::Fatal,
            C::Authentication,
            S::Critical,
            false,
            "AUTHENTICATION_FAILED",
            error.message.clone(),
        );
    }

    let message = error.message.to_lowercase();
    let network_kind = matches!(
        error.kind,
        DriverErrorKind::Network
            | DriverErrorKind::ServerSelection
            | DriverErrorKind::Timeout
            | DriverErrorKind::Io
    );
    if network_kind
        || NETWORK_LABELS.iter().any(|l| error.has_label(l))
        || NETWORK_MESSAGE_PATTERNS.iter().any(|p| message.contains(p))
    {
        return Classification::build(
            T::Transient,
            C::Connection,
            S::High,
            true,
            "CONNECTION_LOST",
            format!("network failure: {}", error.message),
        )
        .with_store_code(error.code);
    }

    if TRANSACTION_LABELS.iter().any(|l| error.has_label(l)) {
        return Classification::build(
            T::Transient,
            C::Transaction,
            S::Medium,
            true,
            "TRANSACTION_CONFLICT",
            format!("transient transaction failure: {}", error.message),
        )
        .with_store_code(error.code);
    }

    if error.kind == DriverErrorKind::Validation || !error.field_errors.is_empty() {
        return Classification::build(
            T::Persistent,
            C::Validation,
            S::Medium,
            false,
            "VALIDATION_FAILED",
            error.message.clone(),
        )
        .with_fields(error.field_errors.clone())
        .with_store_code(error.code);
    }

    if error.kind == DriverErrorKind::InvalidArgument {
        return Classification::build(
            T::Persistent,
            C::Input,
            S::Low,
            false,
            "INVALID_INPUT",
            error.message.clone(),
        );
    }

    Classification::build(
        T::Persistent,
        C::Unknown,
        S::Medium,
        false,
        "UNKNOWN_ERROR",
        error.message.clone(),
    )
    .with_store_code(error.code)
}

fn classify_code(code: i32, error: &DriverError) -> Option<Classification> {
    use ErrorCategory as C;
    use ErrorType as T;
    use Severity as S;

    let reason = || match &error.code_name {
        Some(name) => format!("{} ({}): {}", name, code, error.message),
        None => format!("code {}: {}", code, error.message),
    };

    let classification = if CONNECTION_LOSS_CODES.contains(&code) {
        Classification::build(T::Transient, C::Connection, S::High, true, "CONNECTION_LOST", reason())
    } else if code == 18 {
        Classification::build(T::Fatal, C::Authentication, S::Critical, false, "AUTHENTICATION_FAILED", reason())
    } else if code == 13 {
        Classification::build(T::Fatal, C::Authorization, S::High, false, "UNAUTHORIZED", reason())
    } else if DUPLICATE_KEY_CODES.contains(&code) {
        Classification::build(T::Persistent, C::Validation, S::Medium, false, "DUPLICATE_KEY", reason())
            .with_fields(duplicate_key_fields(&error.message))
    } else if code == 121 {
        Classification::build(T::Persistent, C::Validation, S::Medium, false, "VALIDATION_FAILED", reason())
            .with_fields(error.field_errors.clone())
    } else if TRANSACTION_CODES.contains(&code) {
        Classification::build(T::Transient, C::Transaction, S::Medium, true, "TRANSACTION_CONFLICT", reason())
    } else if code == 50 {
        Classification::build(T::Transient, C::Query, S::Medium, true, "QUERY_TIMEOUT", reason())
    } else if INPUT_CODES.contains(&code) {
        Classification::build(T::Persistent, C::Input, S::Low, false, "INVALID_INPUT", reason())
    } else if SCHEMA_CODES.contains(&code) {
        Classification::build(T::Persistent, C::Schema, S::Medium, false, "SCHEMA_MISMATCH", reason())
    } else if CHANGE_STREAM_CODES.contains(&code) {
        Classification::build(T::Persistent, C::Dependency, S::High, false, "CHANGE_STREAM_FAILED", reason())
    } else if code == 146 {
        // ExceededMemoryLimit
        Classification::build(T::Persistent, C::Resource, S::High, false, "RESOURCE_EXHAUSTED", reason())
    } else {
        return None;
    };

    Some(classification)
}

/// Pull the offending key names out of an E11000 message such as
/// `... index: email_1 dup key: { email: "a@b.c" }`.
///
/// Only top-level keys are reported. Quoted strings and nested documents or
/// arrays in the values are skipped whole.
fn duplicate_key_fields(message: &str) -> Vec<FieldError> {
    const MARKER: &str = "dup key: {";
    let Some(start) = message.find(MARKER) else {
        return Vec::new();
    };

    let mut fields = Vec::new();
    let mut key = String::new();
    let mut in_key = true;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in message[start + MARKER.len()..].chars() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
                continue;
            } else if ch == open {
                quote = None;
                continue;
            }
            if in_key {
                key.push(ch);
            }
            continue;
        }

        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' | '[' | '(' => depth += 1,
            '}' | ']' | ')' if depth > 0 => depth -= 1,
            '}' => break,
            ':' if in_key => {
                let field = key.trim();
                if !field.is_empty() {
                    fields.push(FieldError::new(field, "must be unique"));
                }
                in_key = false;
            }
            ',' if depth == 0 => {
                key.clear();
                in_key = true;
            }
            _ if in_key => key.push(ch),
            _ => {}
        }
    }

    fields
}

fn user_message(code: &str, category: ErrorCategory) -> &'static str {
    match code {
        "DUPLICATE_KEY" => return "A record with the same unique value already exists.",
        "QUERY_TIMEOUT" | "OPERATION_TIMEOUT" => {
            return "The request took too long to complete. Please try again.";
        }
        "CIRCUIT_OPEN" => {
            return "The service is temporarily unavailable. Please try again shortly.";
        }
        _ => {}
    }

    match category {
        ErrorCategory::Connection => {
            "The service is temporarily unable to reach the database. Please try again shortly."
        }
        ErrorCategory::Query => "The request could not be processed. Please try again.",
        ErrorCategory::Transaction => "The operation conflicted with another update. Please retry.",
        ErrorCategory::Validation => "The submitted data is invalid.",
        ErrorCategory::Schema => "The requested data set is not available.",
        ErrorCategory::Authentication => "The service could not authenticate with the database.",
        ErrorCategory::Authorization => "The service is not permitted to perform this operation.",
        ErrorCategory::Input => "The request contains malformed values.",
        ErrorCategory::BusinessLogic => "The request could not be completed.",
        ErrorCategory::Network => "A network problem interrupted the request. Please try again.",
        ErrorCategory::Resource => "The database does not have enough resources to complete this request.",
        ErrorCategory::Configuration => "The service is misconfigured.",
        ErrorCategory::Dependency => "A dependent service is unavailable.",
        ErrorCategory::Unknown => "An unexpected error occurred.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_codes_are_transient_and_retryable() {
        for code in CONNECTION_LOSS_CODES {
            let c = classify(&DriverError::command(*code, "not primary"));
            assert!(c.retryable, "code {code}");
            assert_eq!(c.error_type, ErrorType::Transient, "code {code}");
            assert_eq!(c.category, ErrorCategory::Connection);
            assert_eq!(c.severity, Severity::High);
            assert_eq!(c.user_impact, UserImpact::Group);
            assert_eq!(c.retry_after, Some(Duration::from_secs(5)));
            assert_eq!(c.store_code, Some(*code));
        }
    }

    #[test]
    fn test_duplicate_key_is_not_retryable() {
        for code in DUPLICATE_KEY_CODES {
            let c = classify(&DriverError::command(
                *code,
                r#"E11000 duplicate key error collection: app.users index: email_1 dup key: { email: "a@b.c" }"#,
            ));
            assert!(!c.retryable);
            assert_eq!(c.error_type, ErrorType::Persistent);
            assert_eq!(c.category, ErrorCategory::Validation);
            assert_eq!(c.code, "DUPLICATE_KEY");
            assert_eq!(c.retry_after, None);
            assert_eq!(c.field_errors, vec![FieldError::new("email", "must be unique")]);
        }
    }

    #[test]
    fn test_compound_duplicate_key_lists_top_level_fields() {
        let c = classify(&DriverError::command(
            11000,
            r#"E11000 duplicate key error collection: app.users index: tenant_1_profile_1 dup key: { tenant: "a,b}", profile: { handle: "x", tags: [1, 2] }, "meta.tag": 1 }"#,
        ));
        let fields: Vec<String> = c.field_errors.iter().map(|f| f.field.clone()).collect();
        assert_eq!(fields, vec!["tenant", "profile", "meta.tag"]);
    }

    #[test]
    fn test_unnamed_duplicate_key_has_no_fields() {
        let c = classify(&DriverError::command(11000, r#"E11000 duplicate key error index: email_1 dup key: { : "a@b.c" }"#));
        assert!(c.field_errors.is_empty());
        assert_eq!(c.code, "DUPLICATE_KEY");
    }

    #[test]
    fn test_auth_failure_is_fatal_and_critical() {
        let c = classify(&DriverError::command(18, "Authentication failed."));
        assert_eq!(c.error_type, ErrorType::Fatal);
        assert_eq!(c.category, ErrorCategory::Authentication);
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.user_impact, UserImpact::All);
        assert!(!c.retryable);
    }

    #[test]
    fn test_write_conflict_is_retryable_transaction() {
        let c = classify(&DriverError::command(112, "WriteConflict"));
        assert_eq!(c.category, ErrorCategory::Transaction);
        assert_eq!(c.severity, Severity::Medium);
        assert!(c.retryable);
        assert_eq!(c.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(c.user_impact, UserImpact::Individual);
    }

    #[test]
    fn test_message_patterns_classify_as_connection() {
        for msg in ["connection reset by peer", "ECONNREFUSED", "Server selection timeout"] {
            let c = classify(&DriverError::new(DriverErrorKind::Other, msg));
            assert_eq!(c.category, ErrorCategory::Connection, "{msg}");
            assert!(c.retryable);
        }
    }

    #[test]
    fn test_transaction_label_without_code() {
        let c = classify(
            &DriverError::new(DriverErrorKind::Other, "commit outcome unknown")
                .with_label("UnknownTransactionCommitResult"),
        );
        assert_eq!(c.category, ErrorCategory::Transaction);
        assert!(c.retryable);
    }

    #[test]
    fn test_code_takes_priority_over_message() {
        // A duplicate key whose text happens to mention a timeout stays a validation error
        let c = classify(&DriverError::command(11000, "dup key after timeout"));
        assert_eq!(c.code, "DUPLICATE_KEY");
    }

    #[test]
    fn test_validation_shape_extracts_fields() {
        let err = DriverError::new(DriverErrorKind::Validation, "document failed validation")
            .with_field_error("age", "must be positive")
            .with_field_error("name", "is required");
        let c = classify(&err);
        assert_eq!(c.category, ErrorCategory::Validation);
        assert_eq!(c.field_errors.len(), 2);
        assert_eq!(c.field_errors[0].field, "age");
    }

    #[test]
    fn test_fallback_is_persistent_unknown() {
        let c = classify(&DriverError::new(DriverErrorKind::Other, "something odd"));
        assert_eq!(c.error_type, ErrorType::Persistent);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert_eq!(c.severity, Severity::Medium);
        assert!(!c.retryable);
        assert_eq!(c.user_friendly_message, "An unexpected error occurred.");
    }

    #[test]
    fn test_unknown_code_falls_through_to_patterns() {
        let c = classify(&DriverError::command(99999, "socket closed"));
        assert_eq!(c.category, ErrorCategory::Connection);
        assert_eq!(c.store_code, Some(99999));
    }

    #[test]
    fn test_user_message_is_stable_regardless_of_wording() {
        let a = classify(&DriverError::command(6, "host unreachable: 10.0.0.1"));
        let b = classify(&DriverError::command(89, "NetworkTimeout after 30s"));
        assert_eq!(a.user_friendly_message, b.user_friendly_message);
    }

    #[test]
    fn test_serialization_uses_snake_case_and_millis() {
        let c = classify(&DriverError::command(112, "WriteConflict"));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["error_type"], "transient");
        assert_eq!(json["category"], "transaction");
        assert_eq!(json["retry_after_ms"], 1000);
    }
}
