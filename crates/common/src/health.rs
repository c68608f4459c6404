//! Service health events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(crate::Error::invalid_input(format!(
                "unknown severity '{}'",
                other
            ))),
        }
    }
}

/// Pipeline stage that raised an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Ingestion,
    HeartbeatMonitor,
    Persistence,
    Broadcaster,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Ingestion => "ingestion",
            Component::HeartbeatMonitor => "heartbeat_monitor",
            Component::Persistence => "persistence",
            Component::Broadcaster => "broadcaster",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Component {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "ingestion" => Ok(Component::Ingestion),
            "heartbeat_monitor" => Ok(Component::HeartbeatMonitor),
            "persistence" => Ok(Component::Persistence),
            "broadcaster" => Ok(Component::Broadcaster),
            other => Err(crate::Error::invalid_input(format!(
                "unknown component '{}'",
                other
            ))),
        }
    }
}

/// Append-only health record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub component: Component,
    pub message: String,
    pub reconnect_attempt: u32,
}

impl HealthEvent {
    pub fn new(component: Component, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            component,
            message: message.into(),
            reconnect_attempt: 0,
        }
    }

    pub fn info(component: Component, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Info, message)
    }

    pub fn warning(component: Component, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Warning, message)
    }

    pub fn error(component: Component, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Error, message)
    }

    pub fn critical(component: Component, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Critical, message)
    }

    pub fn with_reconnect_attempt(mut self, attempt: u32) -> Self {
        self.reconnect_attempt = attempt;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_round_trip_names() {
        for severity in [
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ] {
            assert_eq!(severity.as_str().parse::<Severity>().unwrap(), severity);
        }
        assert_eq!(
            "heartbeat_monitor".parse::<Component>().unwrap(),
            Component::HeartbeatMonitor
        );
        assert!("bogus".parse::<Component>().is_err());
    }

    #[test]
    fn test_builder() {
        let event =
            HealthEvent::warning(Component::Ingestion, "reconnecting").with_reconnect_attempt(3);
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.reconnect_attempt, 3);
    }
}
