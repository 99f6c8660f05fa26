#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Cold start against a ranged HTTP server

mod common;

use std::fs;
use std::time::Duration;

use superpack_client::{DlcEvent, DlcManager, fragment_path};
use superpack_formats::unpack_lite;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use common::{Fixture, hints, run_until};

/// Serves `Range: bytes=a-b` requests from an in-memory archive
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let Some(range) = request
            .headers
            .get("Range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };
        let Some((first, last)) = range.split_once('-') else {
            return ResponseTemplate::new(416);
        };
        let (Ok(first), Ok(last)) = (first.parse::<u64>(), last.parse::<u64>()) else {
            return ResponseTemplate::new(416);
        };
        if first > last || last >= total {
            return ResponseTemplate::new(416);
        }
        ResponseTemplate::new(206)
            .insert_header("Content-Range", format!("bytes {first}-{last}/{total}").as_str())
            .set_body_bytes(self.body[first as usize..=last as usize].to_vec())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_over_http() {
    superpack_protocol::ensure_crypto_provider();
    let server = MockServer::start().await;
    let fixture = Fixture::new();

    Mock::given(method("GET"))
        .and(path("/content/superpack.dvpk"))
        .respond_with(RangeResponder {
            body: fixture.built.bytes.clone(),
        })
        .mount(&server)
        .await;

    let url = format!("{}/content/superpack.dvpk", server.uri());
    let dir = TempDir::new().expect("Operation should succeed");
    let dir_path = dir.path().to_path_buf();

    let events = tokio::task::spawn_blocking(move || {
        let hints = hints().with_downloader_max_handles(2);
        let mut manager = DlcManager::http(&hints).expect("Operation should succeed");
        let top = manager.request_pack("top").expect("Operation should succeed");
        manager
            .initialize(&dir_path, url, hints)
            .expect("Operation should succeed");

        let mut events = run_until(&mut manager, |m| {
            m.request(top).is_some_and(|r| r.is_downloaded())
        });
        events.extend(manager.drain_events());
        assert!(manager.is_pack_downloaded("top"));
        assert!(!manager.is_pack_downloaded("extra"));
        std::thread::sleep(Duration::from_millis(10));
        events
    })
    .await
    .expect("Operation should succeed");

    assert!(events.contains(&DlcEvent::NetworkReady(true)));
    assert!(events.contains(&DlcEvent::InitializeFinished {
        already_downloaded: 0,
        total_files: 6
    }));

    for name in ["common/a.bin", "common/b.bin", "mid/m.bin", "top/t.bin", "top/empty.bin"] {
        let path = fragment_path(dir.path(), name).expect("Operation should succeed");
        let bytes = fs::read(&path).expect("Operation should succeed");
        assert_eq!(
            unpack_lite(&bytes).expect("Operation should succeed"),
            fixture.original(name),
            "{name}"
        );
    }
    assert!(
        !fragment_path(dir.path(), "extra/x.bin")
            .expect("Operation should succeed")
            .exists()
    );
}
