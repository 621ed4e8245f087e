//! Provisioning progress over a real socket

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use fleetd::app::options::ServerOptions;
use fleetd::progress::{consumer, ProgressConsumer, ProgressHub, Update};
use fleetd::providers::ScriptedRunner;
use fleetd::server::serve::serve;
use openapi_server::{ClientEvent, LogStream, ProgressStatus, ServerEvent, StepStatus};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::common::{docker_rules, test_app, TestApp};

async fn start_server() -> (TestApp, SocketAddr) {
    let t = test_app(docker_rules(ScriptedRunner::new()));
    let options = ServerOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
    };
    let (addr, _handle) = serve(&options, t.server.clone(), std::future::pending()).await.unwrap();
    (t, addr)
}

fn hub(t: &TestApp) -> &ProgressHub {
    &t.app.progress
}

async fn next_event<S>(ws: &mut S) -> ServerEvent
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_subscribe_replays_backlog_then_streams() {
    let (t, addr) = start_server().await;
    let hub = hub(&t);
    hub.begin("i-1", &[("deploy", "Deploy")]);
    hub.step("i-1", "deploy", StepStatus::InProgress, None);
    for line in ["pulling image", "creating container", "starting"] {
        hub.log("i-1", Some("deploy"), LogStream::Stdout, line);
    }

    let (mut ws, _) = connect_async(format!("ws://{}/api/provisioning/ws", addr)).await.unwrap();
    let subscribe = serde_json::to_string(&ClientEvent::Subscribe {
        instance_id: "i-1".to_string(),
    })
    .unwrap();
    ws.send(Message::Text(subscribe.into())).await.unwrap();

    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::Subscribed {
            instance_id: "i-1".to_string()
        }
    );
    match next_event(&mut ws).await {
        ServerEvent::ProvisioningLogsBuffer { instance_id, logs } => {
            assert_eq!(instance_id, "i-1");
            let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
            assert_eq!(lines, vec!["pulling image", "creating container", "starting"]);
            assert_eq!(logs.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        }
        other => panic!("expected the log backlog, got {:?}", other),
    }
    match next_event(&mut ws).await {
        ServerEvent::Progress(progress) => {
            assert_eq!(progress.status, ProgressStatus::InProgress);
            assert_eq!(progress.current_step.as_deref(), Some("deploy"));
        }
        other => panic!("expected a snapshot, got {:?}", other),
    }

    // Live events follow the backlog
    hub.log("i-1", Some("deploy"), LogStream::Stderr, "healthcheck passed");
    match next_event(&mut ws).await {
        ServerEvent::ProvisioningLog(line) => {
            assert_eq!(line.seq, 3);
            assert_eq!(line.stream, LogStream::Stderr);
        }
        other => panic!("expected a live log line, got {:?}", other),
    }
    hub.step("i-1", "deploy", StepStatus::Completed, None);
    hub.finish("i-1", ProgressStatus::Completed, None);
    loop {
        if let ServerEvent::Progress(progress) = next_event(&mut ws).await {
            if progress.status == ProgressStatus::Completed {
                assert_eq!(progress.steps[0].status, StepStatus::Completed);
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_malformed_client_event_gets_error() {
    let (_t, addr) = start_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/api/provisioning/ws", addr)).await.unwrap();
    ws.send(Message::Text(r#"{"event":"dance"}"#.into())).await.unwrap();

    match next_event(&mut ws).await {
        ServerEvent::Error(error) => assert_eq!(error.error_type, "VALIDATION"),
        other => panic!("expected an error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_consumer_follows_until_terminal() {
    let (t, addr) = start_server().await;
    let hub = hub(&t);
    hub.begin("i-2", &[("provider", "Resolve provider"), ("deploy", "Deploy")]);
    hub.log("i-2", Some("provider"), LogStream::Stdout, "resolved docker");

    let options = consumer::Options {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let consumer = ProgressConsumer::new(&format!("http://{}", addr), "i-2", options).unwrap();
    let (mut rx, handle) = consumer.watch(32);

    // The first update comes from the subscription, so the socket is live
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(first, Update::Log(ref line) if line.line == "resolved docker"));

    hub.step("i-2", "provider", StepStatus::InProgress, None);
    hub.step("i-2", "provider", StepStatus::Completed, None);
    hub.step("i-2", "deploy", StepStatus::Skipped, Some("nothing to do".to_string()));
    hub.finish("i-2", ProgressStatus::Completed, None);

    let mut last = None;
    while let Some(update) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        if let Update::Progress(progress) = update {
            last = Some(progress);
        }
    }
    let last = last.unwrap();
    assert_eq!(last.status, ProgressStatus::Completed);
    assert_eq!(last.steps[1].status, StepStatus::Skipped);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_status_endpoint_reports_reconcile_outcome() {
    let (t, addr) = start_server().await;
    let manifest = fleetd::models::Manifest::from_value(serde_json::json!({})).unwrap();
    let instance = t
        .app
        .engine
        .create_instance(fleetd::models::Instance::new("bot", "ws", &manifest, None), None)
        .await
        .unwrap();
    t.app.engine.reconcile_instance(&instance.id).await.unwrap();

    let response = reqwest::get(format!("http://{}/api/provisioning/{}/status", addr, instance.id))
        .await
        .unwrap();
    let progress: openapi_server::ProvisioningProgress = response.json().await.unwrap();
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert!(progress.steps.iter().all(|s| s.status == StepStatus::Completed));
}
