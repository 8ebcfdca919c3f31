use std::sync::Arc;

use changefeed_processor::BuilderError;
use changefeed_processor::ChangeFeedProcessorBuilder;
use changefeed_processor::ChangeFeedProcessorContext;
use changefeed_processor::ChangeFeedProcessorItem;
use changefeed_processor::ChangeFeedProcessorOptions;
use changefeed_processor::Error;
use changefeed_processor::InMemoryFeedContainer;
use changefeed_processor::InMemoryLeaseContainer;
use serde_json::Value;

fn message(builder: ChangeFeedProcessorBuilder) -> BuilderError {
    match builder.build() {
        Err(Error::Builder(e)) => e,
        other => panic!("expected a builder error, got {other:?}"),
    }
}

fn with_containers() -> ChangeFeedProcessorBuilder {
    ChangeFeedProcessorBuilder::new()
        .host_name("host")
        .feed_container(Arc::new(InMemoryFeedContainer::new("orders")))
        .lease_container(Arc::new(InMemoryLeaseContainer::new("leases")))
}

#[test]
fn validation_messages_are_stable() {
    assert_eq!(
        message(ChangeFeedProcessorBuilder::new()),
        BuilderError::InvalidArgument("hostName cannot be null or empty".to_string())
    );
    assert_eq!(
        message(ChangeFeedProcessorBuilder::new().host_name("host")),
        BuilderError::InvalidArgument("feedContainer cannot be null".to_string())
    );
    assert_eq!(
        message(
            ChangeFeedProcessorBuilder::new()
                .host_name("host")
                .feed_container(Arc::new(InMemoryFeedContainer::new("orders")))
        ),
        BuilderError::InvalidArgument("leaseContainer cannot be null".to_string())
    );
    assert_eq!(
        message(with_containers()),
        BuilderError::InvalidArgument("Change feed processor consumer is not set".to_string())
    );
    assert_eq!(
        message(
            with_containers()
                .handle_changes(|_: Vec<Value>, _: &ChangeFeedProcessorContext| Ok(()))
                .handle_full_fidelity_changes(|_: Vec<ChangeFeedProcessorItem>, _: &ChangeFeedProcessorContext| Ok(()))
        ),
        BuilderError::InvalidArgument("expecting either incremental or full fidelity consumer, not both".to_string())
    );
}

#[test]
fn renew_interval_must_outpace_expiration() {
    let err = message(
        with_containers()
            .handle_changes(|_: Vec<Value>, _: &ChangeFeedProcessorContext| Ok(()))
            .options(ChangeFeedProcessorOptions {
                lease_renew_interval_ms: 70_000,
                ..Default::default()
            }),
    );
    assert!(matches!(err, BuilderError::InvalidArgument(_)));
}

#[test]
fn full_fidelity_rejects_start_from_beginning() {
    let err = message(
        with_containers()
            .handle_full_fidelity_changes(|_: Vec<ChangeFeedProcessorItem>, _: &ChangeFeedProcessorContext| Ok(()))
            .options(ChangeFeedProcessorOptions {
                start_from_beginning: true,
                ..Default::default()
            }),
    );
    assert!(matches!(err, BuilderError::InvalidState(_)));
}
