use crate::CommonRequestOptions;
use crate::RequestOptions;

/// Per-operation options inside a bulk execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BulkItemRequestOptions {
    pub if_match_etag: Option<String>,
    pub content_response_on_write_enabled: Option<bool>,
}

/// Bulk patch adds a filter predicate to the shared bulk item fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BulkPatchItemRequestOptions {
    pub base: BulkItemRequestOptions,
    pub filter_predicate: Option<String>,
}

/// Options of a whole bulk execution.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkExecutionOptions {
    pub common: CommonRequestOptions,
    pub initial_micro_batch_size: u32,
    pub max_micro_batch_size: u32,
    pub max_micro_batch_concurrency: u32,
    pub max_concurrent_partitions: Option<u32>,
}

impl Default for BulkExecutionOptions {
    fn default() -> Self {
        Self {
            common: CommonRequestOptions::default(),
            initial_micro_batch_size: 100,
            max_micro_batch_size: 100,
            max_micro_batch_concurrency: 1,
            max_concurrent_partitions: None,
        }
    }
}

impl From<&BulkItemRequestOptions> for RequestOptions {
    fn from(options: &BulkItemRequestOptions) -> Self {
        RequestOptions {
            if_match_etag: options.if_match_etag.clone(),
            content_response_on_write_enabled: options.content_response_on_write_enabled,
            ..Default::default()
        }
    }
}

impl From<&BulkPatchItemRequestOptions> for RequestOptions {
    fn from(options: &BulkPatchItemRequestOptions) -> Self {
        let mut request = RequestOptions::from(&options.base);
        request.filter_predicate = options.filter_predicate.clone();
        request
    }
}

impl From<&BulkExecutionOptions> for RequestOptions {
    fn from(options: &BulkExecutionOptions) -> Self {
        RequestOptions::from(&options.common)
    }
}
