//! Liveness of a long-running process, folded from the reports of the loops
//! it depends on.
//!
//! Each loop (a database monitor, a heartbeat, ...) registers a component with
//! a reporting deadline and reports through its [`HealthHandle`]. The process
//! is alive while every component has reported healthy within its deadline.
//! A registry without components is not alive: nothing has proven the
//! process works yet.
//!
//! The status renders as an HTTP response so that a supervisor probing the
//! process over HTTP can decide to restart it.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered, no report yet.
    Starting,
    /// Must report again before `until`.
    Healthy { until: OffsetDateTime },
    Unhealthy,
    /// Healthy once, then missed its deadline.
    Stalled,
}

impl ComponentStatus {
    /// Resolve an expired healthy report into `Stalled`.
    fn at(self, now: OffsetDateTime) -> Self {
        match self {
            ComponentStatus::Healthy { until } if until <= now => ComponentStatus::Stalled,
            other => other,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::Healthy { .. })
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentStatus::Starting => write!(f, "starting"),
            ComponentStatus::Healthy { .. } => write!(f, "healthy"),
            ComponentStatus::Unhealthy => write!(f, "unhealthy"),
            ComponentStatus::Stalled => write!(f, "stalled"),
        }
    }
}

/// Point-in-time status of a registry.
#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Body answered while healthy.
    pub summary: String,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.healthy {
            return write!(f, "{}", self.summary);
        }
        write!(f, "unhealthy:")?;
        if self.components.is_empty() {
            return write!(f, " no component registered");
        }
        for (name, status) in &self.components {
            write!(f, " {name}={status}")?;
        }
        Ok(())
    }
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = match self.healthy {
            true => StatusCode::OK,
            false => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, self.to_string()).into_response()
    }
}

type Components = Arc<RwLock<BTreeMap<String, ComponentStatus>>>;

/// Reporting side of one component.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Healthy until the component's deadline from now.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::Healthy {
            until: OffsetDateTime::now_utc() + self.deadline,
        });
    }

    pub fn report_unhealthy(&self) {
        self.report_status(ComponentStatus::Unhealthy);
    }

    pub fn report_status(&self, status: ComponentStatus) {
        // the map only holds plain values, a poisoned lock is still consistent
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        _ = components.insert(self.component.clone(), status);
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    summary: String,
    components: Components,
}

impl HealthRegistry {
    /// `summary` is the body answered while every component is healthy.
    pub fn new(name: &str, summary: &str) -> Self {
        Self {
            name: name.to_owned(),
            summary: summary.to_owned(),
            components: Components::default(),
        }
    }

    /// Add a component, in `Starting` until its first report. It has to
    /// report healthy at least once per `deadline`.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components: BTreeMap<_, _> = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, status)| (name.clone(), status.at(now)))
            .collect();

        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy());
        let status = HealthStatus {
            healthy,
            summary: self.summary.clone(),
            components,
        };
        match healthy {
            true => debug!(registry = %self.name, "healthy"),
            false => warn!(registry = %self.name, %status, "not healthy"),
        }
        status
    }
}
