//! End to end tests for importing from a (mocked) Mixpanel account
//!
//! These tests verify that:
//! 1. Schemas are built from the top fields of every configured event
//! 2. Export lines are mapped onto that schema and reach the sink in order
//! 3. Failures abort the run and carry a message we can show the user

use std::collections::BTreeSet;

use httpmock::{Method::POST, MockServer};
use mixpanel_import::{
    emit::MemoryEmitter,
    error::{get_user_message, ImportError},
    job::{config::IngestionConfig, ImportJob},
    parse::schema::{infer_schema, OutputSchema},
    source::MixpanelApi,
};

const CONFLICTING_1: &str = include_str!("top_fields_conflicting_1.json");
const CONFLICTING_2: &str = include_str!("top_fields_conflicting_2.json");
const CUSTOM_EVENT_FIELDS: &str = include_str!("top_fields_custom_event.json");
const EXPORT_EXAMPLE: &str = include_str!("mixpanel_export_example.jsonl");

const TOP_FIELDS_PATH: &str = "/api/2.0/events/properties/top/";
const EXPORT_PATH: &str = "/api/2.0/export";
// base64("secret:")
const AUTH_HEADER: &str = "Basic c2VjcmV0Og==";

fn by_events_config(server: &MockServer, events: &str) -> IngestionConfig {
    IngestionConfig::builder()
        .api_secret("secret")
        .from_date("2024-01-01")
        .to_date("2024-01-01")
        .events(events)
        .schema_by_events(true)
        .rest_api_url(server.url("/"))
        .data_url(server.url(EXPORT_PATH))
        .build()
        .unwrap()
}

fn field_set(schema: &OutputSchema) -> BTreeSet<String> {
    schema.field_names().into_iter().map(String::from).collect()
}

#[tokio::test]
async fn test_get_schema() {
    let server = MockServer::start();
    let _mock = server.mock(|when, then| {
        when.method(POST)
            .path(TOP_FIELDS_PATH)
            .header("Authorization", AUTH_HEADER)
            .body_contains("event=event1");
        then.status(200).body(CONFLICTING_1);
    });

    let config = by_events_config(&server, "event1");
    let api = MixpanelApi::from_config(&config);
    let schema = infer_schema(&config, &api).await.unwrap();

    let expected: BTreeSet<String> = [
        "conflict",
        "distinct_id",
        "event",
        "event_name",
        "regular_field",
        "time",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(field_set(&schema), expected);
}

#[tokio::test]
async fn test_get_schema_conflicting_fields() {
    let server = MockServer::start();
    let _first = server.mock(|when, then| {
        when.method(POST)
            .path(TOP_FIELDS_PATH)
            .header("Authorization", AUTH_HEADER)
            .body_contains("event=event1");
        then.status(200).body(CONFLICTING_1);
    });
    let _second = server.mock(|when, then| {
        when.method(POST)
            .path(TOP_FIELDS_PATH)
            .header("Authorization", AUTH_HEADER)
            .body_contains("event=event2");
        then.status(200).body(CONFLICTING_2);
    });

    let config = by_events_config(&server, "event1,event2");
    let api = MixpanelApi::from_config(&config);
    let err = infer_schema(&config, &api).await.unwrap_err();

    assert!(err.is_schema_conflict());
    assert_eq!(
        err.to_string(),
        "'$$conflict$$$$' escaped to 'conflict', but '$conflict$' was previously escaped to same value"
    );
}

#[tokio::test]
async fn test_raw_import_makes_no_metadata_calls() {
    let server = MockServer::start();
    let top = server.mock(|when, then| {
        when.method(POST).path(TOP_FIELDS_PATH);
        then.status(200).body("{}");
    });
    let export = server.mock(|when, then| {
        when.method(POST)
            .path(EXPORT_PATH)
            .header("Authorization", AUTH_HEADER)
            .body_contains("from_date=2024-01-01")
            .body_contains("event=%5B%22Signup%22%5D");
        then.status(200).body("data1\ndata2\n");
    });

    let config = IngestionConfig::builder()
        .api_secret("secret")
        .from_date("2024-01-01")
        .to_date("2024-01-01")
        .events("Signup")
        .rest_api_url(server.url("/"))
        .data_url(server.url(EXPORT_PATH))
        .build()
        .unwrap();

    let sink = MemoryEmitter::new();
    let summary = ImportJob::new(config, Box::new(sink.clone()))
        .run()
        .await
        .unwrap();

    top.assert_hits(0);
    export.assert();
    assert_eq!(summary.records_emitted, 2);

    let records = sink.records().await;
    assert_eq!(records[0].get("raw_event"), Some("data1"));
    assert_eq!(records[1].get("raw_event"), Some("data2"));
    assert_eq!(records[0].fields().count(), 1);
}

#[tokio::test]
async fn test_by_events_import() {
    let server = MockServer::start();
    let _top = server.mock(|when, then| {
        when.method(POST)
            .path(TOP_FIELDS_PATH)
            .body_contains("event=Custom+Event");
        then.status(200).body(CUSTOM_EVENT_FIELDS);
    });
    let _export = server.mock(|when, then| {
        when.method(POST).path(EXPORT_PATH);
        then.status(200).body(EXPORT_EXAMPLE);
    });

    let sink = MemoryEmitter::new();
    let summary = ImportJob::new(
        by_events_config(&server, "Custom Event"),
        Box::new(sink.clone()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.lines_read, 3);
    let records = sink.records().await;
    assert_eq!(records.len(), 3);

    let first = &records[0];
    assert_eq!(first.get("event_name"), Some("Custom Event"));
    assert_eq!(first.get("distinct_id"), Some("user-1"));
    assert_eq!(first.get("time"), Some("1704067200"));
    assert_eq!(first.get("data_1"), Some("data 1 value"));
    assert_eq!(first.get("lib_version"), Some("1.0"));
    assert_eq!(first.get("New_Plan"), None);
    // Not a top field of any configured event, so not in the schema
    assert!(!first.contains_field("insert_id"));

    assert_eq!(records[1].get("New_Plan"), Some("pro"));
    assert_eq!(records[2].get("data_1"), None);
    assert_eq!(records[2].get("distinct_id"), Some("user-3"));
}

#[tokio::test]
async fn test_malformed_line_aborts_by_events_import() {
    let server = MockServer::start();
    let _top = server.mock(|when, then| {
        when.method(POST).path(TOP_FIELDS_PATH);
        then.status(200).body(CUSTOM_EVENT_FIELDS);
    });
    let _export = server.mock(|when, then| {
        when.method(POST).path(EXPORT_PATH);
        then.status(200).body(
            "{\"event\":\"Custom Event\",\"properties\":{}}\nthis is not json\n{\"event\":\"Custom Event\",\"properties\":{}}\n",
        );
    });

    let sink = MemoryEmitter::new();
    let err = ImportJob::new(
        by_events_config(&server, "Custom Event"),
        Box::new(sink.clone()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(
        get_user_message(&err),
        "Mixpanel export contained a line that is not a valid event"
    );
    let cause = err
        .chain()
        .find_map(|c| c.downcast_ref::<ImportError>())
        .unwrap();
    assert!(matches!(cause, ImportError::MalformedEvent { line, .. } if line == "this is not json"));
    // Nothing was committed - the bad line was in the first batch
    assert!(sink.records().await.is_empty());
}

#[tokio::test]
async fn test_metadata_failure_aborts_before_export() {
    let server = MockServer::start();
    let _top = server.mock(|when, then| {
        when.method(POST).path(TOP_FIELDS_PATH);
        then.status(500).body("oops");
    });
    let export = server.mock(|when, then| {
        when.method(POST).path(EXPORT_PATH);
        then.status(200).body("");
    });

    let err = ImportJob::new(
        by_events_config(&server, "event1"),
        Box::new(MemoryEmitter::new()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(get_user_message(&err), "Remote server error");
    assert!(format!("{err:#}").contains("Failed to fetch fields event: 'event1', code: 500, output: oops"));
    export.assert_hits(0);
}

#[tokio::test]
async fn test_separate_hosts_each_authenticated() {
    let rest_server = MockServer::start();
    let data_server = MockServer::start();

    let top = rest_server.mock(|when, then| {
        when.method(POST)
            .path(TOP_FIELDS_PATH)
            .header("Authorization", AUTH_HEADER);
        then.status(200).body(r#"{"$os": {}}"#);
    });
    let export = data_server.mock(|when, then| {
        when.method(POST)
            .path(EXPORT_PATH)
            .header("Authorization", AUTH_HEADER);
        then.status(200)
            .body("{\"event\":\"Signup\",\"properties\":{\"$os\":\"Linux\"}}\n");
    });

    let config = IngestionConfig::builder()
        .api_secret("secret")
        .from_date("2024-01-01")
        .to_date("2024-01-01")
        .events("Signup")
        .schema_by_events(true)
        .rest_api_url(rest_server.url("/"))
        .data_url(data_server.url(EXPORT_PATH))
        .build()
        .unwrap();

    let sink = MemoryEmitter::new();
    ImportJob::new(config, Box::new(sink.clone()))
        .run()
        .await
        .unwrap();

    top.assert();
    export.assert();
    let records = sink.records().await;
    assert_eq!(records[0].get("os"), Some("Linux"));
    assert_eq!(records[0].get("event_name"), Some("Signup"));
}
