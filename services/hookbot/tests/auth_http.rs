// End-to-end checks of the token and unsafe-header gates.
mod common;

use common::{TEST_KEY, spawn_server};
use hookbot_auth::sha1_hmac;
use reqwest::StatusCode;

fn token(path: &str) -> String {
    sha1_hmac(TEST_KEY, path.as_bytes())
}

#[tokio::test]
async fn publish_without_authorization_is_unauthorized() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/pub/"))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("www-authenticate")
        .expect("challenge header")
        .to_str()
        .expect("ascii");
    assert_eq!(challenge, "Basic realm=\"hookbot\"");
}

#[tokio::test]
async fn publish_with_wrong_token_is_unauthorized() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/pub/"))
        .basic_auth(token("/pub/not/the/same/as/above"), Some(""))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn publish_with_exact_token_succeeds() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/pub/place"))
        .basic_auth(token("/pub/place"), Some(""))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "OK\n");
}

#[tokio::test]
async fn bearer_token_is_accepted() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/pub/place"))
        .bearer_auth(token("/pub/place"))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::OK);
}

// A token minted for a "/"-terminated path covers the subtree below it.
#[tokio::test]
async fn prefix_token_covers_subtree() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/pub/place/sub/sub/sub"))
        .basic_auth(token("/pub/place/"), Some(""))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::OK);
}

// "/pub/po" is not an entire step up from "/pub/post".
#[tokio::test]
async fn non_boundary_prefix_is_rejected() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/pub/post"))
        .basic_auth(token("/pub/po"), Some(""))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// A verbless token works for publishing and subscribing alike.
#[tokio::test]
async fn verbless_token_is_valid_for_publish() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/pub/place"))
        .basic_auth(token("/place"), Some(""))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unsafe_subscribe_without_header_is_bad_request() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/unsafe/sub/"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.text().await.expect("body"),
        "400 Bad Request. X-Hookbot-Unsafe-Is-Ok header required.\n"
    );
}

#[tokio::test]
async fn unknown_extra_metadata_is_bad_request() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/unsafe/pub/topic?extra-metadata=gitlab"))
        .body("MESSAGE")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_answers_ok() {
    let (addr, _broker) = spawn_server().await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "OK\n");
}
