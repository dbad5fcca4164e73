//! End-to-end sign-in flow over a real listener: form submission, live
//! channel subscription, and the pushed progress messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use cookie_relay::{
    auth::AuthGate,
    build_router,
    jobs::{JobOrchestrator, JobSettings},
    provider::ProviderError,
    refresh::RefreshOrchestrator,
    storage::{InMemoryRefreshStore, DEFAULT_RETENTION},
    testing::ScriptedProvider,
    websocket::LiveChannel,
    AppState,
};

async fn spawn_relay(provider: ScriptedProvider) -> SocketAddr {
    let channel = LiveChannel::new();
    let jobs = JobOrchestrator::new(
        Arc::new(provider.clone()),
        channel.clone(),
        JobSettings {
            start_delay: Duration::from_millis(300),
            ..JobSettings::default()
        },
    );
    let refresh = RefreshOrchestrator::new(
        Arc::new(provider),
        Arc::new(InMemoryRefreshStore::new(DEFAULT_RETENTION)),
        false,
    );
    let app = build_router(AppState {
        jobs,
        refresh,
        channel,
        auth: AuthGate::disabled(),
        metrics: None,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn submit_form(addr: SocketAddr) -> String {
    let page = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .form(&[
            ("username", "me@example.com"),
            ("password", "secret"),
            ("amazonSite", "alexa.amazon.co.uk|en-GB"),
        ])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let start = page.find("/ws/").expect("waiting page links a live session") + 4;
    let end = start + page[start..].find('"').unwrap();
    page[start..end].to_string()
}

async fn next_html<S>(ws: &mut S) -> String
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("live message in time")
        .expect("channel open")
        .unwrap();
    let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(frame["type"], "text");
    frame["html"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn sign_in_pushes_error_then_result() {
    let provider = ScriptedProvider::new().with_rounds(vec![
        Err(ProviderError::Negotiation(
            "Please open http://127.0.0.1:9000/ in your browser".into(),
        )),
        Ok(json!({"loginCookie": "partial"})),
        Ok(json!({"csrf": "abc", "localCookie": "session=1"})),
    ]);
    let addr = spawn_relay(provider.clone()).await;

    let session = submit_form(addr).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{session}"))
        .await
        .unwrap();

    let first = next_html(&mut ws).await;
    assert!(first.starts_with("ERROR: "));
    assert!(first.contains(r#"<a href="http://127.0.0.1:9000/""#));
    assert!(first.contains("please wait..."));

    let second = next_html(&mut ws).await;
    assert!(second.contains("RefreshURL"));
    assert!(second.contains(&format!("http://{addr}/refreshCookie")));
    assert!(second.contains("localCookie"));

    assert_eq!(provider.negotiate_calls(), 1);
    assert_eq!(provider.stop_proxy_calls(), 1);
    let config = provider.last_negotiation().unwrap();
    assert_eq!(config.target_site, "alexa.amazon.co.uk");
    assert_eq!(config.accept_language, "en-GB");
    assert_eq!(config.proxy_own_host, "127.0.0.1");
}

#[tokio::test]
async fn concurrent_sessions_receive_only_their_own_messages() {
    let provider = ScriptedProvider::new().with_rounds(vec![Ok(json!({"csrf": "abc"}))]);
    let addr = spawn_relay(provider.clone()).await;

    let first = submit_form(addr).await;
    let second = submit_form(addr).await;
    assert_ne!(first, second);

    let (mut ws_first, _) = connect_async(format!("ws://{addr}/ws/{first}"))
        .await
        .unwrap();
    let (mut ws_second, _) = connect_async(format!("ws://{addr}/ws/{second}"))
        .await
        .unwrap();

    assert!(next_html(&mut ws_first).await.contains("RefreshURL"));
    assert!(next_html(&mut ws_second).await.contains("RefreshURL"));

    // Each job completed once; nothing else is queued for either tab.
    let extra = tokio::time::timeout(Duration::from_millis(200), ws_first.next()).await;
    assert!(extra.is_err());
    assert_eq!(provider.stop_proxy_calls(), 2);
}
