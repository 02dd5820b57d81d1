//! Subscriber setup and the layer that mirrors records onto the dashboard.

use std::fmt;

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt as tfmt, EnvFilter, Layer};

use crate::dashboard::{LogEntry, PushEvent, PushHub};

/// Targets used by this crate's log statements.
pub const TARGETS: &[(&str, &str)] = &[
    ("scanner", "SCANNER"),
    ("trade", "TRADE"),
    ("circuit_breaker", "CIRCUIT_BREAKER"),
    ("binance_ws", "BINANCE_WS"),
    ("binance_api", "BINANCE_API"),
];

/// Installs the global subscriber. `RUST_LOG` filters (default `info`),
/// `LOG_FORMAT=json` switches to JSON lines. With a hub, records from this
/// crate are also pushed as `LOG_ENTRY`.
pub fn init(hub: Option<PushHub>) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let output = if json {
        tfmt::layer().json().with_target(true).boxed()
    } else {
        tfmt::layer().with_target(true).boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .with(hub.map(PushLayer::new))
        .try_init()
}

/// Dashboard category for a record: `ERROR`/`WARN` by level, otherwise the
/// subsystem named by the target.
pub fn category(level: &Level, target: &str) -> &'static str {
    if *level == Level::ERROR {
        return "ERROR";
    }
    if *level == Level::WARN {
        return "WARN";
    }
    TARGETS.iter().find(|(t, _)| *t == target).map(|(_, c)| *c).unwrap_or("INFO")
}

fn is_own_target(target: &str) -> bool {
    target.starts_with("squeezefx") || TARGETS.iter().any(|(t, _)| *t == target)
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.fields.join(", "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// Forwards this crate's records to the push hub at INFO and above.
pub struct PushLayer {
    hub: PushHub,
}

impl PushLayer {
    pub fn new(hub: PushHub) -> Self {
        Self { hub }
    }
}

impl<S: Subscriber> Layer<S> for PushLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::INFO || !is_own_target(meta.target()) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.hub.publish(PushEvent::LogEntry(LogEntry {
            timestamp: Utc::now(),
            level: category(meta.level(), meta.target()).to_string(),
            message: visitor.finish(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_category_mapping() {
        assert_eq!(category(&Level::ERROR, "trade"), "ERROR");
        assert_eq!(category(&Level::WARN, "scanner"), "WARN");
        assert_eq!(category(&Level::INFO, "circuit_breaker"), "CIRCUIT_BREAKER");
        assert_eq!(category(&Level::INFO, "squeezefx::storage"), "INFO");
    }

    #[test]
    fn test_layer_pushes_own_records_only() {
        let hub = PushHub::new(16);
        let mut rx = hub.subscribe();
        let subscriber = tracing_subscriber::registry().with(PushLayer::new(hub.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "trade", id = 3, "position opened");
            tracing::debug!(target: "trade", "too verbose");
            tracing::info!(target: "hyper::client", "foreign");
        });

        let PushEvent::LogEntry(entry) = rx.try_recv().unwrap() else {
            panic!("expected a log entry");
        };
        assert_eq!(entry.level, "TRADE");
        assert_eq!(entry.message, "position opened (id=3)");
        assert!(rx.try_recv().is_err());
    }
}
