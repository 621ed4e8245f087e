//! Client-side progress consumer
//!
//! Follows one instance's provisioning over the push channel, falling back
//! to the polling endpoint whenever no push connection is up. Exactly one
//! delivery mode is active at a time.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use openapi_server::{ClientEvent, ProvisioningLogLine, ProvisioningProgress, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::FleetError;
use crate::retry::{calc_exp_backoff, RetryOptions};

#[derive(Debug, Clone)]
pub struct Options {
    pub poll_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Reconnect attempts after a dropped or failed push connection
    pub max_reconnect_attempts: u32,
    /// Consecutive failed polls before giving up
    pub max_poll_failures: u32,
    pub connect_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            max_poll_failures: 3,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// What the consumer hands to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Progress(ProvisioningProgress),
    Log(ProvisioningLogLine),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Push,
    Poll,
}

enum PushEnd {
    /// A terminal snapshot arrived or the caller went away
    Finished,
    /// `received` is set when the connection delivered any progress or log
    Disconnected { received: bool },
}

pub struct ProgressConsumer {
    instance_id: String,
    status_url: Url,
    ws_url: Url,
    http: reqwest::Client,
    options: Options,
    mode: DeliveryMode,
    last_seq: Option<u64>,
    last_progress: Option<ProvisioningProgress>,
}

impl ProgressConsumer {
    pub fn new(base_url: &str, instance_id: &str, options: Options) -> Result<Self, FleetError> {
        let base = Url::parse(base_url).map_err(|e| FleetError::ConfigError(e.to_string()))?;
        let root = base.path().trim_end_matches('/').to_string();

        let mut status_url = base.clone();
        status_url.set_path(&format!("{}/api/provisioning/{}/status", root, instance_id));

        let mut ws_url = base;
        let scheme = match ws_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(FleetError::ConfigError(format!("unsupported scheme {}", other))),
        };
        ws_url
            .set_scheme(scheme)
            .map_err(|_| FleetError::ConfigError("failed to set websocket scheme".to_string()))?;
        ws_url.set_path(&format!("{}/api/provisioning/ws", root));

        let http = reqwest::Client::builder()
            .timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            instance_id: instance_id.to_string(),
            status_url,
            ws_url,
            http,
            options,
            mode: DeliveryMode::Poll,
            last_seq: None,
            last_progress: None,
        })
    }

    /// Run until the operation finishes, the connection is lost for good, or
    /// the receiver is dropped
    pub fn watch(self, buffer: usize) -> (mpsc::Receiver<Update>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let retry = RetryOptions {
            max_attempts: self.options.max_reconnect_attempts,
            base_delay: self.options.reconnect_base,
            max_delay: self.options.reconnect_max,
            multiplier: 2.0,
        };
        calc_exp_backoff(&retry, attempt.saturating_sub(1))
    }

    fn set_mode(&mut self, mode: DeliveryMode) {
        if self.mode != mode {
            debug!(instance_id = %self.instance_id, "Progress delivery switched to {:?}", mode);
            self.mode = mode;
        }
    }

    async fn run(mut self, tx: mpsc::Sender<Update>) {
        // Push connections tried so far since the last successful one
        let mut attempts: u32 = 0;
        let mut poll_failures: u32 = 0;

        loop {
            if attempts <= self.options.max_reconnect_attempts {
                match self.push(&tx).await {
                    Ok(PushEnd::Finished) => return,
                    Ok(PushEnd::Disconnected { received }) => {
                        info!(instance_id = %self.instance_id, "Push channel dropped, polling");
                        // A server that accepts and hangs up straight away uses up attempts
                        if received {
                            attempts = 0;
                        }
                    }
                    Err(e) => debug!(instance_id = %self.instance_id, "Push connect failed: {}", e),
                }
                attempts += 1;
            }
            self.set_mode(DeliveryMode::Poll);

            let reconnect_at = (attempts <= self.options.max_reconnect_attempts)
                .then(|| Instant::now() + self.backoff(attempts));
            loop {
                match self.poll().await {
                    Ok(progress) => {
                        poll_failures = 0;
                        let terminal = progress.status.is_terminal();
                        if !self.emit_progress(&tx, progress).await || terminal {
                            return;
                        }
                    }
                    Err(e) => {
                        poll_failures += 1;
                        warn!(
                            instance_id = %self.instance_id,
                            "Status poll failed ({}/{}): {}",
                            poll_failures,
                            self.options.max_poll_failures,
                            e
                        );
                        if poll_failures >= self.options.max_poll_failures {
                            let lost = ProvisioningProgress::lost_connection(&self.instance_id);
                            let _ = tx.send(Update::Progress(lost)).await;
                            return;
                        }
                    }
                }
                if reconnect_at.is_some_and(|at| Instant::now() >= at) {
                    break;
                }
                tokio::time::sleep(self.options.poll_interval).await;
            }
        }
    }

    async fn poll(&self) -> Result<ProvisioningProgress, FleetError> {
        let response = self.http.get(self.status_url.clone()).send().await?;
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn push(&mut self, tx: &mpsc::Sender<Update>) -> Result<PushEnd, FleetError> {
        let connect = connect_async(self.ws_url.as_str());
        let (mut ws, _) = tokio::time::timeout(self.options.connect_timeout, connect)
            .await
            .map_err(|_| FleetError::Internal("push connect timed out".to_string()))?
            .map_err(|e| FleetError::Internal(e.to_string()))?;

        let subscribe = serde_json::to_string(&ClientEvent::Subscribe {
            instance_id: self.instance_id.clone(),
        })?;
        ws.send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| FleetError::Internal(e.to_string()))?;
        self.set_mode(DeliveryMode::Push);

        let mut received = false;
        while let Some(message) = ws.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let event: ServerEvent = match serde_json::from_str(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Ignoring malformed progress event: {}", e);
                    continue;
                }
            };
            if matches!(
                event,
                ServerEvent::Progress(_) | ServerEvent::ProvisioningLogsBuffer { .. } | ServerEvent::ProvisioningLog(_)
            ) {
                received = true;
            }
            let keep_going = match event {
                ServerEvent::Progress(progress) => {
                    let terminal = progress.status.is_terminal();
                    self.emit_progress(tx, progress).await && !terminal
                }
                ServerEvent::ProvisioningLogsBuffer { logs, .. } => {
                    let mut open = true;
                    for line in logs {
                        open = self.emit_log(tx, line).await;
                        if !open {
                            break;
                        }
                    }
                    open
                }
                ServerEvent::ProvisioningLog(line) => self.emit_log(tx, line).await,
                ServerEvent::Subscribed { .. } => true,
                ServerEvent::Error(error) => {
                    warn!("Progress server error: {}", error.message);
                    true
                }
            };
            if !keep_going {
                let unsubscribe = serde_json::to_string(&ClientEvent::Unsubscribe {
                    instance_id: self.instance_id.clone(),
                })?;
                let _ = ws.send(Message::Text(unsubscribe.into())).await;
                let _ = ws.close(None).await;
                return Ok(PushEnd::Finished);
            }
        }
        Ok(PushEnd::Disconnected { received })
    }

    /// Returns false when the caller has gone away
    async fn emit_progress(&mut self, tx: &mpsc::Sender<Update>, progress: ProvisioningProgress) -> bool {
        if self.last_progress.as_ref() == Some(&progress) {
            return true;
        }
        self.last_progress = Some(progress.clone());
        tx.send(Update::Progress(progress)).await.is_ok()
    }

    /// Lines replayed after a reconnect are dropped by sequence number
    async fn emit_log(&mut self, tx: &mpsc::Sender<Update>, line: ProvisioningLogLine) -> bool {
        if self.last_seq.is_some_and(|seq| line.seq <= seq) {
            return true;
        }
        self.last_seq = Some(line.seq);
        tx.send(Update::Log(line)).await.is_ok()
    }
}
