mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{basic_request, exchange, EnvGuard};
use extproc::{admin, build_processor, AppConfig, ExtProcessor};
use reqwest::Client;
use tokio::net::TcpListener;
use tower::ServiceExt;

async fn spawn_admin(processor: ExtProcessor) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = admin::router(processor);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn healthz_reports_the_chain() {
    let mut env = EnvGuard::new();
    env.set("EXTPROC_FILTERS", "access_log,same_site_lax");
    env.remove("EXTPROC_FILTER_CONFIG");
    let config = AppConfig::from_env().unwrap();
    drop(env);

    let processor = build_processor(&config);
    let base = spawn_admin(processor).await;
    let resp = Client::new()
        .get(format!("{}/healthz", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["status"], "ok");
    assert_eq!(v["filterCount"], 2);
    assert_eq!(v["streamFilterCount"], 1);
    assert_eq!(v["activeStreams"], 0);
    assert_eq!(v["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn metrics_reflect_served_streams() {
    let processor = ExtProcessor::builder()
        .filter(std::sync::Arc::new(extproc::filter::NoOpFilter))
        .build();
    let (_, result) = exchange(&processor, vec![basic_request()]).await;
    result.unwrap();

    let resp = admin::router(processor)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"],
        "text/plain; version=0.0.4"
    );
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    for series in [
        "extproc_streams_total 1",
        "extproc_streams_active 0",
        "extproc_messages_total{phase=\"request_headers\"} 1",
        "extproc_filter_invocations_total{filter=\"noop\"} 1",
        "extproc_stream_duration_ms_count 1",
        "extproc_build_info{version=",
    ] {
        assert!(text.contains(series), "missing {series} in:\n{text}");
    }
}
