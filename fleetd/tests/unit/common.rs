//! Shared test wiring

use std::sync::Arc;

use fleetd::app::state::AppState;
use fleetd::audit::MemoryAuditSink;
use fleetd::providers::{CommandOutput, ScriptedRunner};
use fleetd::server::state::ServerState;

pub const INSPECT: &str = r#"[{
    "Id": "abc123",
    "Name": "/fleet-bot-12345678",
    "Created": "2026-03-01T10:00:00.000000000Z",
    "State": {"Status": "running", "Restarting": false},
    "Config": {"Image": "fleet/bot:1", "Labels": {"managed-by": "fleetd"}},
    "NetworkSettings": {"IPAddress": "172.17.0.2"}
}]"#;

/// Docker CLI answers for a first deploy, appended after any rules on `runner`
pub fn docker_rules(runner: ScriptedRunner) -> ScriptedRunner {
    runner
        .on("inspect --type container fleet-", CommandOutput::failed(1, "Error: No such object"))
        .on("run -d", CommandOutput::ok("abc123\n"))
        .on("inspect --type container abc123", CommandOutput::ok(INSPECT))
}

pub struct TestApp {
    pub app: AppState,
    pub server: Arc<ServerState>,
    pub audit: Arc<MemoryAuditSink>,
    pub runner: Arc<ScriptedRunner>,
}

pub fn test_app(runner: ScriptedRunner) -> TestApp {
    let runner = Arc::new(runner);
    let (app, audit) = AppState::in_memory(runner.clone()).unwrap();
    let server = Arc::new(ServerState::from_app(&app));
    TestApp {
        app,
        server,
        audit,
        runner,
    }
}
