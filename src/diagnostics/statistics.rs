use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::OperationType;
use super::ResourceType;
use crate::Clock;
use crate::DiagnosticsError;
use crate::Result;
use crate::SystemClock;

/// Supplemental (metadata / HEAD) attempts kept per request
pub const MAX_SUPPLEMENTAL_REQUESTS: usize = 10;

/// One attempt against a replica or the gateway.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StoreResponseStatistics {
    pub request_start_ms: u64,
    pub response_end_ms: u64,
    pub region: String,
    pub endpoint: String,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub status_code: u16,
    pub sub_status_code: u32,
    pub request_charge: f64,
    pub request_payload_bytes: u64,
    pub response_payload_bytes: u64,
}

impl StoreResponseStatistics {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.response_end_ms.saturating_sub(self.request_start_ms))
    }

    fn is_supplemental(&self) -> bool {
        self.resource_type.is_metadata()
            || matches!(self.operation_type, OperationType::Head | OperationType::HeadFeed)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct AddressResolutionStatistics {
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub target_endpoint: String,
    pub forced_refresh: bool,
    pub error_message: Option<String>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct RetryContext {
    pub retry_count: u32,
    /// `(status, sub_status)` of every retried attempt, in order
    pub status_and_sub_status_codes: Vec<(u16, u32)>,
    pub retry_start_ms: Option<u64>,
    pub retry_end_ms: Option<u64>,
}

#[derive(Serialize, Clone, Debug, Default)]
struct StatisticsSnapshot {
    request_start_ms: u64,
    request_end_ms: Option<u64>,
    responses: Vec<StoreResponseStatistics>,
    gateway_responses: Vec<StoreResponseStatistics>,
    supplemental_responses: VecDeque<StoreResponseStatistics>,
    address_resolutions: BTreeMap<String, AddressResolutionStatistics>,
    retry_context: RetryContext,
    regions_contacted: BTreeSet<String>,
    endpoints_contacted: BTreeSet<String>,
}

#[derive(Debug)]
struct StatisticsState {
    snapshot: StatisticsSnapshot,
    version: u64,
    rendered: Option<(u64, String)>,
}

/// Thread-safe statistics of one request across all of its attempts.
///
/// A single mutex guards all state. Rendering copies the state under the lock
/// and serializes the copy outside of it; the rendered string is cached until
/// the next mutation.
#[derive(Debug)]
pub struct ClientSideRequestStatistics {
    clock: Arc<dyn Clock>,
    state: Mutex<StatisticsState>,
}

impl Default for ClientSideRequestStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSideRequestStatistics {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let start = clock.now_millis();
        Self {
            clock,
            state: Mutex::new(StatisticsState {
                snapshot: StatisticsSnapshot {
                    request_start_ms: start,
                    ..Default::default()
                },
                version: 0,
                rendered: None,
            }),
        }
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StatisticsSnapshot) -> R,
    ) -> R {
        let mut state = self.state.lock();
        state.version += 1;
        state.rendered = None;
        f(&mut state.snapshot)
    }

    /// Records a direct (replica) attempt. Metadata and HEAD attempts are
    /// kept as supplemental responses.
    pub fn record_response(
        &self,
        response: StoreResponseStatistics,
    ) {
        if response.is_supplemental() {
            return self.record_supplemental_response(response);
        }
        self.mutate(|s| {
            s.observe(&response);
            s.responses.push(response);
        })
    }

    pub fn record_gateway_response(
        &self,
        response: StoreResponseStatistics,
    ) {
        self.mutate(|s| {
            s.observe(&response);
            s.gateway_responses.push(response);
        })
    }

    /// Keeps only the latest `MAX_SUPPLEMENTAL_REQUESTS` records.
    pub fn record_supplemental_response(
        &self,
        response: StoreResponseStatistics,
    ) {
        self.mutate(|s| {
            s.observe(&response);
            if s.supplemental_responses.len() == MAX_SUPPLEMENTAL_REQUESTS {
                s.supplemental_responses.pop_front();
            }
            s.supplemental_responses.push_back(response);
        })
    }

    /// Starts timing an address lookup and returns the token that ends it.
    pub fn record_address_resolution_start(
        &self,
        target_endpoint: &str,
        forced_refresh: bool,
    ) -> String {
        let token = nanoid::nanoid!();
        let now = self.clock.now_millis();
        self.mutate(|s| {
            s.address_resolutions.insert(
                token.clone(),
                AddressResolutionStatistics {
                    start_ms: now,
                    end_ms: None,
                    target_endpoint: target_endpoint.to_string(),
                    forced_refresh,
                    error_message: None,
                },
            );
        });
        token
    }

    /// Fails without touching the state when `token` was never started.
    pub fn record_address_resolution_end(
        &self,
        token: &str,
        error_message: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let Some(resolution) = state.snapshot.address_resolutions.get_mut(token) else {
            return Err(DiagnosticsError::UnknownAddressResolution { id: token.to_string() }.into());
        };
        resolution.end_ms = Some(now);
        resolution.error_message = error_message;
        state.snapshot.extend_end(now);
        state.version += 1;
        state.rendered = None;
        Ok(())
    }

    pub fn record_retry(
        &self,
        status_code: u16,
        sub_status_code: u32,
    ) {
        let now = self.clock.now_millis();
        self.mutate(|s| {
            let retry = &mut s.retry_context;
            retry.retry_count += 1;
            retry.status_and_sub_status_codes.push((status_code, sub_status_code));
            retry.retry_start_ms.get_or_insert(now);
            retry.retry_end_ms = Some(now);
        })
    }

    /// Replaces the retry context with one tracked elsewhere.
    pub fn record_retry_context(
        &self,
        retry_context: RetryContext,
    ) {
        self.mutate(|s| s.retry_context = retry_context)
    }

    pub fn record_contacted_region(
        &self,
        region: &str,
    ) {
        self.mutate(|s| {
            s.regions_contacted.insert(region.to_string());
        })
    }

    pub fn request_start_ms(&self) -> u64 {
        self.state.lock().snapshot.request_start_ms
    }

    pub fn request_end_ms(&self) -> Option<u64> {
        self.state.lock().snapshot.request_end_ms
    }

    /// Time from creation to the latest recorded attempt end.
    pub fn duration(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .snapshot
            .request_end_ms
            .map(|end| Duration::from_millis(end.saturating_sub(state.snapshot.request_start_ms)))
    }

    pub fn regions_contacted(&self) -> BTreeSet<String> {
        self.state.lock().snapshot.regions_contacted.clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().snapshot.retry_context.retry_count
    }

    pub fn response_count(&self) -> usize {
        let state = self.state.lock();
        state.snapshot.responses.len() + state.snapshot.gateway_responses.len()
    }

    pub fn supplemental_response_count(&self) -> usize {
        self.state.lock().snapshot.supplemental_responses.len()
    }

    pub fn total_request_charge(&self) -> f64 {
        self.state.lock().snapshot.all_responses().map(|r| r.request_charge).sum()
    }

    pub fn max_request_payload_bytes(&self) -> u64 {
        self.state
            .lock()
            .snapshot
            .all_responses()
            .map(|r| r.request_payload_bytes)
            .max()
            .unwrap_or(0)
    }

    pub fn max_response_payload_bytes(&self) -> u64 {
        self.state
            .lock()
            .snapshot
            .all_responses()
            .map(|r| r.response_payload_bytes)
            .max()
            .unwrap_or(0)
    }

    /// Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// JSON rendering of the statistics, stable until the next mutation.
    pub fn request_diagnostics(&self) -> String {
        let (version, snapshot) = {
            let state = self.state.lock();
            if let Some((version, rendered)) = &state.rendered {
                if *version == state.version {
                    return rendered.clone();
                }
            }
            (state.version, state.snapshot.clone())
        };

        let rendered = serde_json::to_string(&snapshot)
            .unwrap_or_else(|e| format!("{{\"error\":\"diagnostics not serializable: {e}\"}}"));

        let mut state = self.state.lock();
        if state.version == version {
            state.rendered = Some((version, rendered.clone()));
        }
        rendered
    }
}

impl fmt::Display for ClientSideRequestStatistics {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.request_diagnostics())
    }
}

impl StatisticsSnapshot {
    fn observe(
        &mut self,
        response: &StoreResponseStatistics,
    ) {
        if !response.region.is_empty() {
            self.regions_contacted.insert(response.region.clone());
        }
        if !response.endpoint.is_empty() {
            self.endpoints_contacted.insert(response.endpoint.clone());
        }
        self.extend_end(response.response_end_ms);
    }

    /// Attempts may finish out of order; the request ends with the latest one.
    fn extend_end(
        &mut self,
        end_ms: u64,
    ) {
        if self.request_end_ms.map_or(true, |current| end_ms > current) {
            self.request_end_ms = Some(end_ms);
        }
    }

    fn all_responses(&self) -> impl Iterator<Item = &StoreResponseStatistics> {
        self.responses
            .iter()
            .chain(self.gateway_responses.iter())
            .chain(self.supplemental_responses.iter())
    }
}
