use std::time::{Duration, Instant};

use mirror_sync::test_support::sample_site;
use mirror_sync::{FetchMethod, MarkerProbe, PrecheckError, SiteConfig, SiteKind};
use mirror_sync_tools::HttpMarkerProbe;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn epel_on(server: &MockServer) -> SiteConfig {
    let mut site = sample_site("epel");
    site.kind = SiteKind::Reposync {
        method: FetchMethod::Http,
    };
    site.host = server.address().to_string();
    site.remote_dir = "epel/9".into();
    site.precheck_file = Some("repodata/repomd.xml".into());
    site
}

fn probe() -> HttpMarkerProbe {
    HttpMarkerProbe::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn etag_becomes_the_marker() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/epel/9/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"5f3a-61c2\""))
        .mount(&server)
        .await;

    let marker = probe().fetch_marker(&epel_on(&server)).await.unwrap();
    assert_eq!(marker, "etag:\"5f3a-61c2\"");
}

#[tokio::test]
async fn last_modified_is_used_without_etag() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/epel/9/repodata/repomd.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Last-Modified", "Sun, 01 Mar 2026 04:00:00 GMT"),
        )
        .mount(&server)
        .await;

    let marker = probe().fetch_marker(&epel_on(&server)).await.unwrap();
    assert!(marker.starts_with("last-modified:Sun, 01 Mar 2026 04:00:00 GMT"));
}

#[tokio::test]
async fn unchanged_upstream_yields_identical_markers() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/epel/9/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v1\""))
        .expect(2)
        .mount(&server)
        .await;

    let site = epel_on(&server);
    let first = probe().fetch_marker(&site).await.unwrap();
    let second = probe().fetch_marker(&site).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn missing_file_is_unreachable() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = probe().fetch_marker(&epel_on(&server)).await.unwrap_err();
    let PrecheckError::Unreachable(message) = err;
    assert!(message.contains("404"));
}

#[tokio::test]
async fn response_without_validators_is_unreachable() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(probe().fetch_marker(&epel_on(&server)).await.is_err());
}

#[tokio::test]
async fn client_carries_configured_timeout_and_user_agent() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/epel/9/repodata/repomd.xml"))
        .and(header(
            "user-agent",
            concat!("mirror-sync/", env!("CARGO_PKG_VERSION")),
        ))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"fast\""))
        .mount(&server)
        .await;

    let marker = probe().fetch_marker(&epel_on(&server)).await.unwrap();
    assert_eq!(marker, "etag:\"fast\"");

    let slow = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"slow\"")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&slow)
        .await;

    let impatient = HttpMarkerProbe::new(Duration::from_millis(200)).unwrap();
    let started = Instant::now();
    assert!(impatient.fetch_marker(&epel_on(&slow)).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(2));
}
