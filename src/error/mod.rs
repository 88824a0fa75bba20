use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

pub mod crash_id;

pub use crash_id::CrashId;

/// Message returned to clients in place of internal failure details.
pub const GENERIC_FAIL_MESSAGE: &str = "Something went wrong, please try again.";

/// Codes that are client mistakes but do not follow the `VALIDATION/` prefix.
const BAD_REQUEST_CODES: &[&str] = &[
    "HOUSEHOLD/OWNER_CANNOT_LEAVE",
    "HOUSEHOLD/OWNER_ROLE_LOCKED",
    "TASK/INACTIVE",
    "FAVOR/INVALID_STATE",
];

const BAD_REQUEST_PREFIXES: &[&str] = &["VALIDATION/", "JSON/", "REQUEST/", "LETS/"];

/// A structured application error that can be serialized and returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the user.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
    #[serde(default, rename = "crashId", skip_serializing_if = "Option::is_none")]
    pub crash_id: Option<CrashId>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";
    pub const UNAUTHORIZED_CODE: &'static str = "AUTH/UNAUTHORIZED";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
            crash_id: None,
        }
    }

    /// `<AREA>/NOT_FOUND`, rendered as 404.
    pub fn not_found(area: &str, message: impl Into<String>) -> Self {
        AppError::new(format!("{area}/NOT_FOUND"), message)
    }

    /// `<AREA>/FORBIDDEN`, rendered as 403.
    pub fn forbidden(area: &str, message: impl Into<String>) -> Self {
        AppError::new(format!("{area}/FORBIDDEN"), message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        AppError::new(Self::UNAUTHORIZED_CODE, message)
    }

    /// `VALIDATION/INVALID` tagged with the offending field.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::new("VALIDATION/INVALID", message).with_context("field", field.to_string())
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn crash_id(&self) -> Option<&CrashId> {
        self.crash_id.as_ref()
    }

    pub fn set_crash_id(&mut self, crash_id: CrashId) {
        self.crash_id = Some(crash_id);
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// HTTP status derived from the error code.
    pub fn status(&self) -> StatusCode {
        let code = self.code.as_str();
        if code.ends_with("/NOT_FOUND") || code == "SQLX/ROW_NOT_FOUND" {
            StatusCode::NOT_FOUND
        } else if code.ends_with("/FORBIDDEN") {
            StatusCode::FORBIDDEN
        } else if code.ends_with("/CONFLICT") || code.ends_with("_TAKEN") {
            StatusCode::CONFLICT
        } else if code.starts_with("AUTH/") {
            StatusCode::UNAUTHORIZED
        } else if code == "RUNTIME/PANIC" {
            StatusCode::INTERNAL_SERVER_ERROR
        } else if BAD_REQUEST_CODES.contains(&code)
            || BAD_REQUEST_PREFIXES
                .iter()
                .any(|prefix| code.starts_with(prefix))
        {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    /// Emit the error through `tracing` under the given event name.
    pub fn log_with_event(&self, event: &'static str) {
        let crash_id = self.crash_id.as_ref().map(ToString::to_string);
        if self.status().is_server_error() {
            tracing::error!(
                target: "kamehouse",
                event,
                code = %self.code,
                message = %self.message,
                context = ?self.context,
                cause = ?self.cause.as_ref().map(|c| c.to_string()),
                crash_id = crash_id.as_deref()
            );
        } else {
            tracing::debug!(
                target: "kamehouse",
                event,
                code = %self.code,
                message = %self.message,
                context = ?self.context
            );
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        self.log_with_event("request_failed");
        let body = if status.is_server_error() {
            let mut public = AppError::new(self.code.clone(), GENERIC_FAIL_MESSAGE);
            public.crash_id = self.crash_id.clone();
            public
        } else {
            AppError {
                cause: None,
                ..self
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

// `From<AppError> for anyhow::Error` is provided by anyhow's blanket impl.

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::new("JSON/REJECTED", rejection.body_text())
            .with_context("status", rejection.status().as_u16().to_string())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::new("REQUEST/INVALID_QUERY", rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::new("REQUEST/INVALID_PATH", rejection.body_text())
    }
}
