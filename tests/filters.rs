mod common;

use common::{basic_request, exchange, removed_headers, response_headers, set_headers};
use extproc::filters::{register, FilterConfig};
use extproc::proto::processing_response::Response;
use extproc::ExtProcessor;

fn config() -> FilterConfig {
    serde_json::from_value(serde_json::json!({
        "headerRules": [
            {
                "name": "tag",
                "requestHeaders": {
                    "headerMutation": {
                        "remove": ["x-debug"],
                        "set": { "x-env": "prod" },
                        "append": { "x-via": "extproc" }
                    }
                },
                "responseHeaders": {
                    "headerMutation": { "set": { "x-served-by": "edge" } }
                }
            },
            {
                "name": "maintenance",
                "requestHeaders": {
                    "immediateResponse": { "status": 503, "body": "down for maintenance" }
                }
            }
        ]
    }))
    .unwrap()
}

fn processor(names: &[&str]) -> ExtProcessor {
    let order: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    register(ExtProcessor::builder(), &order, &config()).build()
}

#[tokio::test]
async fn header_rules_apply_per_phase() {
    let processor = processor(&["tag"]);
    let (replies, result) = exchange(
        &processor,
        vec![basic_request(), response_headers(&[(":status", "200")])],
    )
    .await;
    result.unwrap();

    let request: Vec<(String, String)> = set_headers(&replies[0])
        .into_iter()
        .map(|(k, v, _)| (k, v))
        .collect();
    assert_eq!(
        request,
        vec![
            ("x-env".to_string(), "prod".to_string()),
            ("x-via".to_string(), "extproc".to_string()),
        ]
    );
    assert_eq!(removed_headers(&replies[0]), vec!["x-debug"]);

    let response: Vec<String> = set_headers(&replies[1]).into_iter().map(|(k, _, _)| k).collect();
    assert_eq!(response, vec!["x-served-by"]);
}

#[tokio::test]
async fn header_rules_can_short_circuit() {
    let processor = processor(&["tag", "maintenance"]);
    let (replies, result) = exchange(&processor, vec![basic_request()]).await;
    result.unwrap();

    assert_eq!(replies.len(), 1);
    let Some(Response::ImmediateResponse(resp)) = &replies[0].response else {
        panic!("expected an immediate response");
    };
    assert_eq!(resp.status.as_ref().map(|s| s.code), Some(503));
    assert_eq!(resp.body, b"down for maintenance");
}

#[tokio::test]
async fn same_site_lax_rewrites_every_cookie() {
    let processor = processor(&["same_site_lax"]);
    let (replies, result) = exchange(
        &processor,
        vec![
            basic_request(),
            response_headers(&[
                (":status", "200"),
                ("set-cookie", "sid=abc; Path=/; SameSite=None; Secure"),
                ("set-cookie", "theme=dark"),
            ]),
        ],
    )
    .await;
    result.unwrap();

    assert!(set_headers(&replies[0]).is_empty());
    let cookies = set_headers(&replies[1]);
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().all(|(k, _, _)| k == "set-cookie"));
    assert!(cookies[0].1.starts_with("sid=abc; Path=/"));
    assert!(cookies[0].1.contains("Secure"));
    assert!(cookies[0].1.contains("HttpOnly"));
    assert!(cookies[0].1.contains("SameSite=Lax"));
    assert!(!cookies[0].1.contains("SameSite=None"));
    assert!(cookies[1].1.starts_with("theme=dark"));
    assert!(cookies[1].1.contains("SameSite=Lax"));
}

#[tokio::test]
async fn access_log_completes_every_stream() {
    let processor = processor(&["access_log", "unknown_filter"]);
    assert_eq!(processor.filter_names(), vec!["access_log"]);
    assert_eq!(processor.stream_filter_count(), 1);

    let (replies, result) = exchange(
        &processor,
        vec![basic_request(), response_headers(&[(":status", "404")])],
    )
    .await;
    result.unwrap();
    assert_eq!(replies.len(), 2);
}
