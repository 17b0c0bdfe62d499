// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket endpoint tests for the hook and schedule streams.

use cvn_config::StudioConfig;
use cvn_daemon::{build_app, build_state, AppState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_server() -> (tempfile::TempDir, SocketAddr, Arc<AppState>) {
    let tmp = tempfile::tempdir().unwrap();
    let config = StudioConfig {
        root: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let state = build_state(config).unwrap();
    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (tmp, addr, state)
}

async fn next_json<S>(stream: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("ws message within timeout")
            .expect("stream open")
            .expect("ws frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn hooks_ws_streams_matching_envelopes_in_order() {
    let (_tmp, addr, state) = spawn_server().await;
    let url = format!("ws://{addr}/api/modder/hooks/ws?topics=on_scene_enter");
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut sink, mut rx) = stream.split();
    // Give the upgrade handler a beat to register its subscription.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Published after subscribe: one matching, one filtered out.
    let mut payload = std::collections::BTreeMap::new();
    payload.insert("scene".to_string(), json!("intro"));
    payload.insert("run".to_string(), json!("r1"));
    state.bus.publish("on_scene_enter", "scenario", payload.clone()).unwrap();
    let mut flag_payload = std::collections::BTreeMap::new();
    flag_payload.insert("name".to_string(), json!("x"));
    state.bus.publish("on_flag_changed", "flags", flag_payload).unwrap();
    payload.insert("scene".to_string(), json!("chapter2"));
    state.bus.publish("on_scene_enter", "scenario", payload).unwrap();

    let first = next_json(&mut rx).await;
    assert_eq!(first["event"], "on_scene_enter");
    assert_eq!(first["payload"]["scene"], "intro");

    let second = next_json(&mut rx).await;
    assert_eq!(second["payload"]["scene"], "chapter2");
    assert!(second["seq"].as_u64() > first["seq"].as_u64());

    sink.send(Message::Close(None)).await.unwrap();
}

#[tokio::test]
async fn schedule_ws_streams_full_records() {
    let (_tmp, addr, state) = spawn_server().await;
    let url = format!("ws://{addr}/api/schedule/ws");
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (_sink, mut rx) = stream.split();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let spec: cvn_core::JobSpec = serde_json::from_value(json!({"kind": "render"})).unwrap();
    let job = state.scheduler.submit(spec, None).await.unwrap();

    // First delta is the admission transition, as a full record.
    let record = next_json(&mut rx).await;
    assert_eq!(record["id"], job.id.as_str());
    assert_eq!(record["state"], "queued");
    assert!(record["trace"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn hooks_ws_connection_upgrades() {
    let (_tmp, addr, _state) = spawn_server().await;
    let url = format!("ws://{addr}/api/modder/hooks/ws");
    let (stream, resp) = tokio_tungstenite::connect_async(&url).await.unwrap();
    assert_eq!(resp.status().as_u16(), 101);
    drop(stream);
}
