use crate::ChangeFeedMode;
use crate::ChangeFeedRequest;
use crate::ChangeFeedStartFrom;
use crate::CommonRequestOptions;
use crate::RequestOptions;

/// Options of a query or read-feed operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRequestOptions {
    pub common: CommonRequestOptions,
    pub partition_key: Option<String>,
    pub max_item_count: Option<u32>,
    pub continuation: Option<String>,
    pub scan_in_query_enabled: Option<bool>,
    pub max_degree_of_parallelism: Option<i32>,
    pub max_buffered_item_count: Option<u32>,
    pub query_metrics_enabled: Option<bool>,
}

impl From<&QueryRequestOptions> for RequestOptions {
    fn from(options: &QueryRequestOptions) -> Self {
        let mut request = RequestOptions::from(&options.common);
        request.partition_key = options.partition_key.clone();
        request.max_item_count = options.max_item_count;
        request.continuation = options.continuation.clone();
        request.scan_in_query_enabled = options.scan_in_query_enabled;
        request.max_degree_of_parallelism = options.max_degree_of_parallelism;
        request.max_buffered_item_count = options.max_buffered_item_count;
        request.query_metrics_enabled = options.query_metrics_enabled;
        request
    }
}

/// Options of a one-off change feed read outside the processor.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeFeedRequestOptions {
    pub common: CommonRequestOptions,
    pub start_from: ChangeFeedStartFrom,
    pub mode: ChangeFeedMode,
    pub max_item_count: Option<u32>,
}

impl ChangeFeedRequestOptions {
    pub fn new(start_from: ChangeFeedStartFrom) -> Self {
        Self {
            common: CommonRequestOptions::default(),
            start_from,
            mode: ChangeFeedMode::Incremental,
            max_item_count: None,
        }
    }

    pub fn with_mode(
        mut self,
        mode: ChangeFeedMode,
    ) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_item_count(
        mut self,
        max_item_count: u32,
    ) -> Self {
        self.max_item_count = Some(max_item_count);
        self
    }

    /// Request for one partition of the monitored container.
    pub fn to_change_feed_request(
        &self,
        partition_key_range_id: impl Into<String>,
        default_max_item_count: usize,
    ) -> ChangeFeedRequest {
        ChangeFeedRequest {
            partition_key_range_id: partition_key_range_id.into(),
            start_from: self.start_from.clone(),
            max_item_count: self
                .max_item_count
                .map(|n| n as usize)
                .unwrap_or(default_max_item_count),
            mode: self.mode,
        }
    }
}

impl From<&ChangeFeedRequestOptions> for RequestOptions {
    fn from(options: &ChangeFeedRequestOptions) -> Self {
        let mut request = RequestOptions::from(&options.common);
        request.max_item_count = options.max_item_count;
        request.change_feed_mode = Some(options.mode);
        if let ChangeFeedStartFrom::Continuation(token) = &options.start_from {
            request.continuation = Some(token.clone());
        }
        request
    }
}
