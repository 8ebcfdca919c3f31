use crate::CommonRequestOptions;
use crate::IndexingDirective;
use crate::RequestOptions;

/// Options of a single-item operation (read, create, replace, upsert, delete, patch).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemRequestOptions {
    pub common: CommonRequestOptions,
    pub if_match_etag: Option<String>,
    pub if_none_match_etag: Option<String>,
    pub partition_key: Option<String>,
    pub indexing_directive: Option<IndexingDirective>,
    pub pre_triggers: Vec<String>,
    pub post_triggers: Vec<String>,
    /// Patch only: apply the patch only if the document matches
    pub filter_predicate: Option<String>,
}

impl ItemRequestOptions {
    pub fn with_common(
        mut self,
        common: CommonRequestOptions,
    ) -> Self {
        self.common = common;
        self
    }

    pub fn with_if_match_etag(
        mut self,
        etag: impl Into<String>,
    ) -> Self {
        self.if_match_etag = Some(etag.into());
        self
    }

    pub fn with_if_none_match_etag(
        mut self,
        etag: impl Into<String>,
    ) -> Self {
        self.if_none_match_etag = Some(etag.into());
        self
    }

    pub fn with_partition_key(
        mut self,
        partition_key: impl Into<String>,
    ) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

impl From<&ItemRequestOptions> for RequestOptions {
    fn from(options: &ItemRequestOptions) -> Self {
        let mut request = RequestOptions::from(&options.common);
        request.if_match_etag = options.if_match_etag.clone();
        request.if_none_match_etag = options.if_none_match_etag.clone();
        request.partition_key = options.partition_key.clone();
        request.indexing_directive = options.indexing_directive;
        request.pre_triggers = options.pre_triggers.clone();
        request.post_triggers = options.post_triggers.clone();
        request.filter_predicate = options.filter_predicate.clone();
        request
    }
}
