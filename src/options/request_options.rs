use std::collections::BTreeMap;

use crate::ChangeFeedMode;
use crate::ConsistencyLevel;
use crate::DiagnosticsThresholds;
use crate::IndexingDirective;

/// Flattened per-request options handed to the transport layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOptions {
    pub consistency_level: Option<ConsistencyLevel>,
    pub session_token: Option<String>,
    pub if_match_etag: Option<String>,
    pub if_none_match_etag: Option<String>,
    pub partition_key: Option<String>,
    pub max_item_count: Option<u32>,
    pub continuation: Option<String>,
    pub content_response_on_write_enabled: Option<bool>,
    pub excluded_regions: Vec<String>,
    pub throughput_control_group_name: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
    pub end_to_end_timeout_ms: Option<u64>,
    pub indexing_directive: Option<IndexingDirective>,
    pub pre_triggers: Vec<String>,
    pub post_triggers: Vec<String>,
    pub filter_predicate: Option<String>,
    pub diagnostics_thresholds: Option<DiagnosticsThresholds>,
    pub change_feed_mode: Option<ChangeFeedMode>,
    pub scan_in_query_enabled: Option<bool>,
    pub max_degree_of_parallelism: Option<i32>,
    pub max_buffered_item_count: Option<u32>,
    pub query_metrics_enabled: Option<bool>,
}
