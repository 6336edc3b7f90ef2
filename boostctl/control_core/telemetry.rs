use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};

/// Builder for control telemetry sinks.
pub struct ControlTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ControlTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ControlTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        let event = match self.event_publisher {
            Some(publisher) => Some(EventHandle::new(publisher)?),
            None => None,
        };
        Ok(ControlTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                event,
            }),
        })
    }
}

/// Telemetry handle shared across control components.
#[derive(Clone)]
pub struct ControlTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ControlTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlTelemetry")
            .field("module", &self.inner.module)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

enum Executor {
    Ambient(Handle),
    Owned(Runtime),
}

struct EventHandle {
    executor: Executor,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let executor = match Handle::try_current() {
            Ok(handle) => Executor::Ambient(handle),
            Err(_) => Executor::Owned(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?,
            ),
        };
        Ok(Self {
            executor,
            publisher,
        })
    }

    // Never blocks when called from inside a runtime: the control loop
    // publishes from async context.
    fn publish(&self, record: EventRecord) -> Result<()> {
        let handle = match &self.executor {
            Executor::Ambient(handle) => Some(handle.clone()),
            Executor::Owned(_) => Handle::try_current().ok(),
        };
        if let Some(handle) = handle {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!(error = ?err, "telemetry event publish failed");
                }
            });
            Ok(())
        } else if let Executor::Owned(runtime) = &self.executor {
            runtime.block_on(self.publisher.publish(record))
        } else {
            Ok(())
        }
    }
}

impl ControlTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ControlTelemetryBuilder {
        ControlTelemetryBuilder::new(module)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.write(LogRecord::new(&self.inner.module, level, message), metadata)
    }

    /// Logs structured metadata tagged with the control cycle.
    pub fn log_cycle(
        &self,
        cycle: u64,
        level: LogLevel,
        message: &str,
        metadata: Value,
    ) -> Result<()> {
        self.write(
            LogRecord::new(&self.inner.module, level, message).with_cycle(cycle),
            metadata,
        )
    }

    fn write(&self, mut record: LogRecord, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            if let Value::Object(map) = metadata {
                record.metadata = map;
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(EventRecord::new(&self.inner.module, event_type, payload))?;
        }
        Ok(())
    }

    /// Emits an event tagged with the control cycle.
    pub fn event_cycle(&self, cycle: u64, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(
                EventRecord::new(&self.inner.module, event_type, payload).with_cycle(cycle),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("control.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = ControlTelemetry::builder("control")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log_cycle(12, LogLevel::Warn, "fault latched", json!({ "kind": "Overboost" }))
            .unwrap();
        telemetry
            .log(LogLevel::Trace, "duty", json!({ "percent": 12.0 }))
            .unwrap();
        telemetry
            .event_cycle(12, "control.fault.latched", json!({ "kind": "Overboost" }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("fault latched"));
        assert!(content.contains("\"cycle\":12"));
        assert!(!content.contains("\"duty\""));
        let events = bus.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cycle, Some(12));
    }

    #[tokio::test]
    async fn publishes_from_async_context_without_blocking() {
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = ControlTelemetry::builder("control")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .event("control.command.applied", json!({ "command": "set_aggression" }))
            .unwrap();
        for _ in 0..10 {
            if !bus.snapshot().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.events_of("control.command.applied").len(), 1);
    }
}
