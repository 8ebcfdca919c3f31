use std::collections::BTreeMap;
use std::time::Duration;

use crate::ConsistencyLevel;
use crate::DiagnosticsThresholds;
use crate::RequestOptions;

/// Fields every request option struct shares.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommonRequestOptions {
    pub consistency_level: Option<ConsistencyLevel>,
    pub session_token: Option<String>,
    pub excluded_regions: Vec<String>,
    pub throughput_control_group_name: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
    pub end_to_end_timeout: Option<Duration>,
    pub content_response_on_write_enabled: Option<bool>,
    pub diagnostics_thresholds: Option<DiagnosticsThresholds>,
}

impl CommonRequestOptions {
    pub fn with_consistency_level(
        mut self,
        level: ConsistencyLevel,
    ) -> Self {
        self.consistency_level = Some(level);
        self
    }

    pub fn with_session_token(
        mut self,
        token: impl Into<String>,
    ) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_excluded_regions(
        mut self,
        regions: Vec<String>,
    ) -> Self {
        self.excluded_regions = regions;
        self
    }

    pub fn with_throughput_control_group(
        mut self,
        group: impl Into<String>,
    ) -> Self {
        self.throughput_control_group_name = Some(group.into());
        self
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_end_to_end_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.end_to_end_timeout = Some(timeout);
        self
    }

    pub fn with_diagnostics_thresholds(
        mut self,
        thresholds: DiagnosticsThresholds,
    ) -> Self {
        self.diagnostics_thresholds = Some(thresholds);
        self
    }

    /// Starts wire-level options from the shared fields.
    pub(crate) fn apply(
        &self,
        target: &mut RequestOptions,
    ) {
        target.consistency_level = self.consistency_level;
        target.session_token = self.session_token.clone();
        target.excluded_regions = self.excluded_regions.clone();
        target.throughput_control_group_name = self.throughput_control_group_name.clone();
        target.custom_headers = self.custom_headers.clone();
        target.properties = self.properties.clone();
        target.end_to_end_timeout_ms = self.end_to_end_timeout.map(|d| d.as_millis() as u64);
        target.content_response_on_write_enabled = self.content_response_on_write_enabled;
        target.diagnostics_thresholds = self.diagnostics_thresholds.clone();
    }
}

impl From<&CommonRequestOptions> for RequestOptions {
    fn from(options: &CommonRequestOptions) -> Self {
        let mut request = RequestOptions::default();
        options.apply(&mut request);
        request
    }
}
