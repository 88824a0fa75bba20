use std::collections::HashMap;
use std::time::Instant;

use anyhow::Context;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{Config, LogFormat};
use crate::AppError;

const DEFAULT_FILTER: &str = "info,kamehouse=info,tower_http=info,sqlx=warn";

/// Install the global subscriber: stdout in the configured format plus, when
/// `log_dir` is set, a daily-rotated JSON file sink.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stdout_layer = match config.log_format {
        LogFormat::Text => fmt::layer().with_target(true).with_filter(filter()).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_filter(filter())
            .boxed(),
    };

    let (file_layer, guard) = match config.log_dir.as_deref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {dir}"))?;
            let appender = tracing_appender::rolling::daily(dir, "kamehouse.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok(guard)
}

fn context_to_json(context: &HashMap<String, String>) -> Option<Value> {
    if context.is_empty() {
        None
    } else {
        let mut map = Map::with_capacity(context.len());
        for (key, value) in context {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Some(Value::Object(map))
    }
}

fn is_client_error(err: &AppError) -> bool {
    err.status().is_client_error()
}

fn wrap_details(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "value": value })
    }
}

/// Structured enter/exit logging around one service operation.
pub struct LogScope {
    area: &'static str,
    op: &'static str,
    household_id: Option<String>,
    user_id: Option<String>,
    start: Instant,
}

impl LogScope {
    pub fn new(
        area: &'static str,
        op: &'static str,
        household_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Self {
        let scope = Self {
            area,
            op,
            household_id: household_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
            start: Instant::now(),
        };
        debug!(
            target: "kamehouse",
            area = scope.area,
            op = scope.op,
            household_id = scope.household_id.as_deref(),
            user_id = scope.user_id.as_deref(),
            details = %json!({ "stage": "enter" })
        );
        scope
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn success(&self, details: Value) {
        info!(
            target: "kamehouse",
            area = self.area,
            op = self.op,
            household_id = self.household_id.as_deref(),
            user_id = self.user_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %wrap_details(details)
        );
    }

    pub fn fail(&self, err: &AppError) {
        let mut map = Map::new();
        map.insert("code".into(), Value::String(err.code().to_string()));
        map.insert("message".into(), Value::String(err.message().to_string()));
        if let Some(context) = context_to_json(err.context()) {
            map.insert("context".into(), context);
        }

        if is_client_error(err) {
            warn!(
                target: "kamehouse",
                area = self.area,
                op = self.op,
                household_id = self.household_id.as_deref(),
                user_id = self.user_id.as_deref(),
                duration_ms = self.elapsed_ms(),
                details = %serde_json::Value::Object(map)
            );
            return;
        }

        if let Some(crash) = err.crash_id() {
            map.insert("crash_id".into(), Value::String(crash.to_string()));
        }
        error!(
            target: "kamehouse",
            area = self.area,
            op = self.op,
            household_id = self.household_id.as_deref(),
            user_id = self.user_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %serde_json::Value::Object(map)
        );
    }

    /// Log the outcome of `result` and hand it back unchanged.
    pub fn finish<T>(&self, result: Result<T, AppError>, details: impl FnOnce(&T) -> Value) -> Result<T, AppError> {
        match &result {
            Ok(value) => self.success(details(value)),
            Err(err) => self.fail(err),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_details_keeps_objects_and_boxes_scalars() {
        assert_eq!(wrap_details(json!({ "a": 1 })), json!({ "a": 1 }));
        assert_eq!(wrap_details(json!(5)), json!({ "value": 5 }));
    }

    #[test]
    fn finish_passes_results_through() {
        let scope = LogScope::new("test", "finish", Some("hh-1"), None);
        let ok: Result<i32, AppError> = scope.finish(Ok(3), |v| json!({ "v": v }));
        assert_eq!(ok.expect("ok"), 3);
        let err = scope
            .finish::<i32>(Err(AppError::validation("x", "bad")), |_| Value::Null)
            .expect_err("err");
        assert_eq!(err.code(), "VALIDATION/INVALID");
    }
}
