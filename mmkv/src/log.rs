// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logging setup. `mmkv-core` only ever emits `tracing` events; this module
//! installs the subscriber that turns them into output, the way the
//! original project's `OpenOptions::log_level`/`log_func` let a caller
//! either pick a verbosity or supply its own sink.
//!
//! Grounded in `datadog-log`'s reload-layer logger: a process-wide
//! subscriber installed once, with a [`tracing_subscriber::reload::Layer`]
//! handle kept around so the level can be changed later without tearing
//! the subscriber down.

use std::sync::{Arc, Mutex, Once};
use tracing::field::{Field, Visit};
use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{reload, EnvFilter, Layer};

/// Verbosity level, mirroring the upstream `LogLevel` enum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// A caller-supplied sink, replacing the upstream `LoggerFunc*` callback.
/// Receives the event's level and its formatted message.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logging configuration: a minimum level, and either stderr output (the
/// default) or a caller-supplied callback.
#[derive(Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub callback: Option<LogCallback>,
}

impl std::fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogConfig")
            .field("level", &self.level)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: LogLevel::Info, callback: None }
    }
}

struct CallbackVisitor {
    message: Option<String>,
}

impl Visit for CallbackVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

/// Forwards every event that passes the filter to a [`LogCallback`].
struct CallbackLayer {
    callback: LogCallback,
}

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = CallbackVisitor { message: None };
        event.record(&mut visitor);
        let message = visitor.message.unwrap_or_else(|| event.metadata().target().to_string());
        (self.callback)(level_of(event.metadata()), &message);
    }
}

fn level_of(metadata: &Metadata<'_>) -> LogLevel {
    match *metadata.level() {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static FILTER_HANDLE: Mutex<Option<FilterHandle>> = Mutex::new(None);
static INSTALL: Once = Once::new();

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::from(level).to_string().to_lowercase()))
}

/// Installs the global `tracing` subscriber on first call; subsequent
/// calls (from a second [`crate::Store::open`] in the same process) only
/// update the reloadable filter to the new `level`.
///
/// A callback takes the place of the default `fmt`/stderr layer entirely,
/// matching the upstream "either a level or your own sink" choice.
pub(crate) fn install(config: &LogConfig) {
    let level = config.level;
    INSTALL.call_once(|| {
        let (filter_layer, handle) = reload::Layer::new(env_filter(level));
        let registry = tracing_subscriber::registry().with(filter_layer);
        *FILTER_HANDLE.lock().expect("log filter mutex poisoned") = Some(handle);

        if let Some(callback) = &config.callback {
            let _ = tracing::subscriber::set_global_default(
                registry.with(CallbackLayer { callback: Arc::clone(callback) }),
            );
        } else {
            let _ = tracing::subscriber::set_global_default(
                registry.with(tracing_subscriber::fmt::layer().with_target(true).with_ansi(false)),
            );
        }
    });

    if let Some(handle) = FILTER_HANDLE.lock().expect("log filter mutex poisoned").as_ref() {
        let _ = handle.modify(|filter| *filter = env_filter(level));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_receives_events_at_or_above_its_level() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let config = LogConfig {
            level: LogLevel::Warn,
            callback: Some(Arc::new(move |_level, _msg| {
                count2.fetch_add(1, Ordering::SeqCst);
            })),
        };
        install(&config);
        tracing::warn!("a warning mmkv emits during this test");
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
