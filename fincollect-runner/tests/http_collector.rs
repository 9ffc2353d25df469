//! Collector runs against a local HTTP server through the real HTTP source and
//! circuit breaker.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, Mutex};

use fincollect_core::data::{partition_key, HttpJsonConfig, ParquetStore, RetryPolicy};
use fincollect_core::domain::{DatasetType, Frequency};
use fincollect_runner::orchestrator::KIND_PROVIDER_UNAVAILABLE;
use fincollect_runner::{Collector, Defaults, ItemConfig, ProviderConfig, RunStatus, SourceConfig, Stage};

const OBSERVATIONS: &str = r#"{"observations": [
    {"timestamp": "2024-04-01", "value": "3.9"},
    {"timestamp": "2024-05-01", "value": "4.0"},
    {"timestamp": "2024-06-01", "value": "4.1"}
]}"#;

/// Minimal HTTP/1.1 server: the first path segment after `/series/` picks the
/// status code. Counts requests per entity.
struct StubServer {
    addr: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl StubServer {
    fn start(statuses: &[(&str, u16)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let statuses: HashMap<String, u16> =
            statuses.iter().map(|(e, s)| (e.to_string(), *s)).collect();
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let counter = hits.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf);
                let path = request.split_whitespace().nth(1).unwrap_or("/");
                let entity = path
                    .trim_start_matches("/series/")
                    .split('?')
                    .next()
                    .unwrap_or("")
                    .to_string();
                *counter.lock().unwrap().entry(entity.clone()).or_insert(0) += 1;

                let status = statuses.get(&entity).copied().unwrap_or(200);
                let body = if status == 200 { OBSERVATIONS } else { "{}" };
                let response = format!(
                    "HTTP/1.1 {status} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        Self { addr, hits }
    }

    fn hits(&self, entity: &str) -> usize {
        self.hits.lock().unwrap().get(entity).copied().unwrap_or(0)
    }
}

fn as_of() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()
}

fn collector(server: &StubServer, entities: &[&str], root: &Path) -> Collector {
    let mut http = HttpJsonConfig::new(format!(
        "http://{}/series/{{entity}}?from={{start}}&to={{end}}",
        server.addr
    ));
    http.records_path = Some("observations".into());
    http.entity_field = Some("indicator_code".into());
    http.timeout_secs = 5;

    let mut config = ProviderConfig::new(DatasetType::EconomicIndicator, SourceConfig::Http(http));
    config.items = entities.iter().map(|e| ItemConfig::new(*e, 3)).collect();
    let source = config.build_source("stub").unwrap();

    Collector::new("stub", config, &Defaults::default(), source, ParquetStore::new(root))
        .unwrap()
        .with_retry(RetryPolicy::immediate(3))
        .as_of(as_of())
}

#[test]
fn one_failing_entity_does_not_trip_the_provider() {
    let server = StubServer::start(&[("BAD", 500)]);
    let dir = tempfile::tempdir().unwrap();
    let c = collector(&server, &["BAD", "GOOD"], dir.path());

    let summary = c.run();

    assert_eq!(server.hits("BAD"), 3);
    assert_eq!(server.hits("GOOD"), 1);
    assert_eq!(summary.items_succeeded, 1);
    assert_eq!(summary.items_failed, 1);
    assert_eq!(summary.status, RunStatus::PartialFailure);
    assert_eq!(summary.retries_for("BAD").count(), 2);

    let err = &summary.errors[0];
    assert_eq!(err.item, "BAD");
    assert_eq!(err.stage, Stage::Fetching);
    assert_eq!(err.kind, "server_error");

    let stored = c
        .store()
        .load(
            DatasetType::EconomicIndicator,
            &partition_key("GOOD", DatasetType::EconomicIndicator),
        )
        .unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].entity_id, "GOOD");
    assert_eq!(stored[0].frequency, Frequency::Monthly);
}

#[test]
fn ban_response_halts_remaining_items() {
    let server = StubServer::start(&[("BANNED", 403)]);
    let dir = tempfile::tempdir().unwrap();
    let c = collector(&server, &["BANNED", "GOOD"], dir.path());

    let summary = c.run();

    assert_eq!(server.hits("BANNED"), 1, "a ban is not retried");
    assert_eq!(server.hits("GOOD"), 0);
    assert_eq!(summary.items_succeeded, 0);
    assert_eq!(summary.status, RunStatus::Unreachable);
    assert_eq!(summary.exit_code(), 2);

    let good = summary.errors.iter().find(|e| e.item == "GOOD").unwrap();
    assert_eq!(good.kind, KIND_PROVIDER_UNAVAILABLE);
    assert!(summary.errors.iter().any(|e| e.item == "BANNED" && e.kind == "circuit_breaker"));
}

#[test]
fn several_failing_entities_trip_the_breaker() {
    let server = StubServer::start(&[("BAD1", 503), ("BAD2", 503), ("BAD3", 503)]);
    let dir = tempfile::tempdir().unwrap();
    let c = collector(&server, &["BAD1", "BAD2", "BAD3", "GOOD"], dir.path());

    let summary = c.run();

    assert_eq!(server.hits("BAD1"), 3);
    assert_eq!(server.hits("BAD2"), 3);
    // The third distinct failure trips the breaker; its retry never leaves the client.
    assert_eq!(server.hits("BAD3"), 1);
    assert_eq!(server.hits("GOOD"), 0);
    assert_eq!(summary.items_failed, 4);
    assert_eq!(summary.status, RunStatus::Unreachable);
    let good = summary.errors.iter().find(|e| e.item == "GOOD").unwrap();
    assert_eq!(good.kind, KIND_PROVIDER_UNAVAILABLE);
}
