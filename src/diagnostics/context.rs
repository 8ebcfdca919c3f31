use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::ClientSideRequestStatistics;
use super::DiagnosticsThresholds;
use super::OperationType;
use super::ResourceType;
use crate::Clock;
use crate::ConsistencyLevel;
use crate::SystemClock;

/// What a logical operation is about.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct OperationSpec {
    pub database: String,
    pub container: String,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub operation_id: Option<String>,
    pub consistency_level: Option<ConsistencyLevel>,
}

impl OperationSpec {
    pub fn new(
        database: impl Into<String>,
        container: impl Into<String>,
        operation_type: OperationType,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            database: database.into(),
            container: container.into(),
            operation_type,
            resource_type,
            operation_id: None,
            consistency_level: None,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
struct Completion {
    status_code: u16,
    sub_status_code: u32,
    error: Option<String>,
    item_count: Option<u64>,
    end_ms: u64,
}

#[derive(Debug)]
struct ContextState {
    diagnostics: Vec<Arc<ClientSideRequestStatistics>>,
    completion: Option<Completion>,
    version: u64,
    rendered: Option<(u64, String)>,
}

/// Diagnostics of one logical operation, across all its retries and pages.
///
/// Created by [`DiagnosticsContext::start_operation`], so an operation is
/// started exactly once. [`DiagnosticsContext::end_operation`] finalizes it;
/// the first call wins and later calls are ignored.
#[derive(Debug)]
pub struct DiagnosticsContext {
    spec: OperationSpec,
    thresholds: DiagnosticsThresholds,
    clock: Arc<dyn Clock>,
    start_ms: u64,
    state: Mutex<ContextState>,
}

impl DiagnosticsContext {
    pub fn start_operation(
        spec: OperationSpec,
        thresholds: DiagnosticsThresholds,
    ) -> Self {
        Self::start_operation_with_clock(spec, thresholds, Arc::new(SystemClock))
    }

    pub fn start_operation_with_clock(
        spec: OperationSpec,
        thresholds: DiagnosticsThresholds,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let start_ms = clock.now_millis();
        Self {
            spec,
            thresholds,
            clock,
            start_ms,
            state: Mutex::new(ContextState {
                diagnostics: Vec::new(),
                completion: None,
                version: 0,
                rendered: None,
            }),
        }
    }

    pub fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    /// Attaches the statistics of one request (a retry, a page).
    pub fn add_diagnostics(
        &self,
        statistics: Arc<ClientSideRequestStatistics>,
    ) {
        let mut state = self.state.lock();
        if state.diagnostics.iter().any(|d| Arc::ptr_eq(d, &statistics)) {
            return;
        }
        state.diagnostics.push(statistics);
        state.version += 1;
    }

    /// Finalizes the operation. Returns false when it had already ended.
    pub fn end_operation(
        &self,
        status_code: u16,
        sub_status_code: u32,
        error: Option<String>,
        item_count: Option<u64>,
    ) -> bool {
        let end_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        if state.completion.is_some() {
            return false;
        }
        state.completion = Some(Completion {
            status_code,
            sub_status_code,
            error,
            item_count,
            end_ms,
        });
        state.version += 1;
        true
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completion.is_some()
    }

    /// `None` until the operation ended.
    pub fn duration(&self) -> Option<Duration> {
        self.state
            .lock()
            .completion
            .as_ref()
            .map(|c| Duration::from_millis(c.end_ms.saturating_sub(self.start_ms)))
    }

    pub fn status_code(&self) -> Option<u16> {
        self.state.lock().completion.as_ref().map(|c| c.status_code)
    }

    pub fn sub_status_code(&self) -> Option<u32> {
        self.state.lock().completion.as_ref().map(|c| c.sub_status_code)
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().completion.as_ref().and_then(|c| c.error.clone())
    }

    pub fn item_count(&self) -> Option<u64> {
        self.state.lock().completion.as_ref().and_then(|c| c.item_count)
    }

    fn statistics(&self) -> Vec<Arc<ClientSideRequestStatistics>> {
        self.state.lock().diagnostics.clone()
    }

    pub fn total_request_charge(&self) -> f64 {
        self.statistics().iter().map(|d| d.total_request_charge()).sum()
    }

    pub fn max_request_payload_bytes(&self) -> u64 {
        self.statistics()
            .iter()
            .map(|d| d.max_request_payload_bytes())
            .max()
            .unwrap_or(0)
    }

    pub fn max_response_payload_bytes(&self) -> u64 {
        self.statistics()
            .iter()
            .map(|d| d.max_response_payload_bytes())
            .max()
            .unwrap_or(0)
    }

    pub fn contacted_regions(&self) -> BTreeSet<String> {
        self.statistics().iter().flat_map(|d| d.regions_contacted()).collect()
    }

    pub fn retry_count(&self) -> u32 {
        self.statistics().iter().map(|d| d.retry_count()).sum()
    }

    /// Client errors that callers expect in normal operation (not found,
    /// conflict, precondition failed) do not count as failures.
    pub fn is_failure(&self) -> bool {
        match self.status_code() {
            None => false,
            Some(status) => match status {
                404 | 409 | 412 => false,
                s => s >= 400,
            },
        }
    }

    /// True once ended and slower, more expensive or larger than the thresholds allow.
    pub fn is_threshold_violated(&self) -> bool {
        let Some(duration) = self.duration() else {
            return false;
        };
        let latency_threshold = if self.spec.operation_type.is_point_operation() {
            self.thresholds.point_operation_latency_threshold()
        } else {
            self.thresholds.non_point_operation_latency_threshold()
        };

        duration > latency_threshold
            || self.total_request_charge() > self.thresholds.request_charge_threshold
            || self.max_request_payload_bytes() > self.thresholds.payload_size_threshold_bytes
            || self.max_response_payload_bytes() > self.thresholds.payload_size_threshold_bytes
    }

    /// Detailed logging is warranted for failed or threshold-violating operations.
    pub fn should_log(&self) -> bool {
        self.is_failure() || self.is_threshold_violated()
    }

    /// JSON rendering, stable until the context or one of its requests changes.
    pub fn to_json(&self) -> String {
        let (key, completion, diagnostics) = {
            let state = self.state.lock();
            let key = render_key(&state);
            if let Some((cached, rendered)) = &state.rendered {
                if *cached == key {
                    return rendered.clone();
                }
            }
            (key, state.completion.clone(), state.diagnostics.clone())
        };

        let requests: Vec<Value> = diagnostics
            .iter()
            .map(|d| serde_json::from_str(&d.request_diagnostics()).unwrap_or(Value::Null))
            .collect();
        let body = serde_json::json!({
            "operation": &self.spec,
            "start_ms": self.start_ms,
            "completion": completion,
            "duration_ms": completion.as_ref().map(|c| c.end_ms.saturating_sub(self.start_ms)),
            "request_charge": diagnostics.iter().map(|d| d.total_request_charge()).sum::<f64>(),
            "requests": requests,
        });
        let rendered = body.to_string();

        let mut state = self.state.lock();
        if render_key(&state) == key {
            state.rendered = Some((key, rendered.clone()));
        }
        rendered
    }
}

/// Every version only grows, so the sum changes on any mutation.
fn render_key(state: &ContextState) -> u64 {
    state
        .diagnostics
        .iter()
        .fold(state.version, |acc, d| acc.wrapping_add(d.version()))
}

impl fmt::Display for DiagnosticsContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}
