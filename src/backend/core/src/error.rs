//! Error handling for Keystone Core.
//!
//! This module provides:
//! - A single crate error type with context and chaining
//! - Stable machine-readable error codes
//! - Caller-safe messages vs detailed internal messages
//! - HTTP status hints for the external routing layer
//! - Error logging with tracing integration and a metrics counter
//!
//! Three families matter to callers:
//!
//! | Family                | When                      | Recoverable |
//! |-----------------------|---------------------------|-------------|
//! | Configuration errors  | building registries       | no (fatal)  |
//! | Authorization denials | per request               | yes         |
//! | Validation errors     | per request (payloads)    | yes         |
//!
//! # Usage
//!
//! ```rust,ignore
//! use keystone_core::error::{KeystoneError, Result, ErrorContext};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("manifest.toml").context("Failed to read manifest")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Keystone operations.
pub type Result<T> = std::result::Result<T, KeystoneError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration Errors (1000-1099)
    ConfigurationError,
    MissingScope,
    ConflictingAttributeOverride,
    MissingBinding,
    DuplicateBinding,
    InvalidNotificationKey,
    UnknownResource,
    UnknownAttribute,
    UnknownParentPolicy,
    PolicyCycle,
    InvalidSchema,
    InvalidConfiguration,

    // Authorization (2000-2099)
    AuthorizationDenied,
    RecordNotFound,
    Forbidden,

    // Validation Errors (3000-3099)
    UnpermittedAttributes,
    InvalidInput,

    // Notification Errors (4000-4099)
    QueueError,
    QueueConnectionFailed,
    QueueFull,
    DeliveryFailed,

    // Serialization Errors (5000-5099)
    SerializationError,
    DeserializationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ConfigurationError => 1000,
            Self::MissingScope => 1001,
            Self::ConflictingAttributeOverride => 1002,
            Self::MissingBinding => 1003,
            Self::DuplicateBinding => 1004,
            Self::InvalidNotificationKey => 1005,
            Self::UnknownResource => 1006,
            Self::UnknownAttribute => 1007,
            Self::UnknownParentPolicy => 1008,
            Self::PolicyCycle => 1009,
            Self::InvalidSchema => 1010,
            Self::InvalidConfiguration => 1011,

            Self::AuthorizationDenied => 2000,
            Self::RecordNotFound => 2001,
            Self::Forbidden => 2002,

            Self::UnpermittedAttributes => 3001,
            Self::InvalidInput => 3002,

            Self::QueueError => 4000,
            Self::QueueConnectionFailed => 4001,
            Self::QueueFull => 4002,
            Self::DeliveryFailed => 4003,

            Self::SerializationError => 5000,
            Self::DeserializationError => 5001,

            Self::InternalError => 9000,
        }
    }

    /// HTTP status the external routing layer should answer with.
    ///
    /// A record-level denial maps to 404 so that "exists but forbidden" and
    /// "does not exist" look the same on the wire.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::RecordNotFound => 404,
            Self::AuthorizationDenied | Self::Forbidden => 403,
            Self::UnpermittedAttributes | Self::InvalidInput => 422,
            Self::QueueConnectionFailed | Self::QueueFull => 503,
            _ => 500,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueError | Self::QueueConnectionFailed | Self::QueueFull | Self::DeliveryFailed
        )
    }

    /// Whether this error is a startup-time configuration failure.
    pub const fn is_configuration(&self) -> bool {
        matches!(self.numeric_code(), 1000..=1099)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "configuration",
            2000..=2099 => "authorization",
            3000..=3099 => "validation",
            4000..=4099 => "notification",
            5000..=5099 => "serialization",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (denials, bad payloads)
    Low,
    /// Operational issues (queue pressure, delivery retries)
    Medium,
    /// Broken configuration or serialization
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code.numeric_code() {
            2000..=3099 => Self::Low,
            4000..=4099 => Self::Medium,
            1000..=1099 | 5000..=5099 => Self::High,
            _ => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (policy key, record id, notification key)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Offending attribute names for payload validation errors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Keystone Core.
#[derive(Error, Debug)]
pub struct KeystoneError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Caller-safe error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for KeystoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl KeystoneError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a startup-time configuration error.
    pub fn configuration(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        debug_assert!(code.is_configuration());
        Self::new(code, message)
    }

    /// The uniform record-level denial.
    ///
    /// Used both for records that do not exist and for records outside the
    /// principal's scope. The message only names the resource type and id the
    /// caller already supplied.
    pub fn not_found(resource_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let record_id = record_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", resource_type, record_id),
        )
        .with_details(ErrorDetails::new().with_entity(&resource_type, &record_id))
    }

    /// Collection-level capability denial.
    pub fn denied(resource_type: impl Into<String>, verb: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let verb = verb.into();
        Self::new(
            ErrorCode::AuthorizationDenied,
            format!("Not permitted to {} {}", verb, resource_type),
        )
        .with_details(
            ErrorDetails::new()
                .with_context("verb", &verb)
                .with_context("resource_type", &resource_type),
        )
    }

    /// Denial produced by a policy's own record condition.
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// A write payload carried attributes outside the permitted surface.
    pub fn unpermitted_attributes(resource_type: &str, attributes: Vec<String>) -> Self {
        Self::new(
            ErrorCode::UnpermittedAttributes,
            format!(
                "Unpermitted attributes for {}: {}",
                resource_type,
                attributes.join(", ")
            ),
        )
        .with_details(ErrorDetails::new().with_attributes(attributes))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the caller-safe message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status hint.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "keystone_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| KeystoneError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| KeystoneError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| KeystoneError::new(ErrorCode::InternalError, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| KeystoneError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for KeystoneError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::QueueConnectionFailed, "Unable to connect to notification queue")
        } else if error.is_timeout() {
            (ErrorCode::QueueError, "Notification queue operation timed out")
        } else {
            (ErrorCode::QueueError, "A notification queue error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for KeystoneError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<toml::de::Error> for KeystoneError {
    fn from(error: toml::de::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Failed to parse TOML manifest",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_yaml::Error> for KeystoneError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Failed to parse YAML manifest",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for KeystoneError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Invalid configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for KeystoneError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
