//! OCPP WebSocket client
//!
//! Keeps one logical connection to the central system alive:
//! - WebSocket connection with the `ocpp1.6` subprotocol
//! - Reconnection after a fixed interval, forever, until stopped
//! - BootNotification handshake and heartbeat maintenance
//! - Request/response correlation through the [`Mailbox`]
//!
//! Outbound messages are queued on a FIFO that survives reconnects, so
//! callers never block on the network; they only wait for replies.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderName, HeaderValue},
        Message as WsMessage,
    },
};
use tracing::{debug, error, info, warn};

use super::mailbox::Mailbox;
use super::messages::*;
use super::types::*;

/// OCPP 1.6 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// When to send BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootPolicy {
    /// On every successful connection
    #[default]
    EveryConnection,
    /// Only until the first one is accepted in this process
    OncePerProcess,
}

/// Configuration for the OCPP client
#[derive(Debug, Clone)]
pub struct OcppClientConfig {
    /// Central system WebSocket URL (including the charge point identity)
    pub endpoint: String,
    /// Vendor id, also used as DataTransfer vendor id
    pub vendor_id: String,
    pub model_id: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Extra handshake headers (e.g. Authorization)
    pub headers: Vec<(String, String)>,
    /// Reply budget for the engine's own calls and for [`OcppClient::call`]
    pub call_timeout: Duration,
    /// Pause between a dropped connection and the next attempt
    pub reconnect_interval: Duration,
    /// Heartbeat interval used until a BootNotification reply supplies one
    pub default_heartbeat_interval: Duration,
    pub boot_policy: BootPolicy,
}

impl Default for OcppClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8180/steve/websocket/CentralSystemService/ONFLEX-001".to_string(),
            vendor_id: "OnFlex".to_string(),
            model_id: "OnFlex-AC".to_string(),
            serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            headers: Vec::new(),
            call_timeout: Duration::from_secs(8),
            reconnect_interval: Duration::from_secs(8),
            default_heartbeat_interval: Duration::from_secs(60),
            boot_policy: BootPolicy::default(),
        }
    }
}

impl OcppClientConfig {
    fn boot_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_vendor: self.vendor_id.clone(),
            charge_point_model: self.model_id.clone(),
            charge_point_serial_number: self.serial_number.clone(),
            firmware_version: self.firmware_version.clone(),
        }
    }
}

type OutboundRx = mpsc::UnboundedReceiver<OcppMessage>;

struct Shared {
    config: OcppClientConfig,
    mailbox: Mailbox,
    outbound_tx: mpsc::UnboundedSender<OcppMessage>,
    /// Held by whoever currently transports messages: a live connection or a loopback
    outbound_rx: Arc<AsyncMutex<OutboundRx>>,
    boot_accepted: AtomicBool,
    heartbeat_secs: AtomicU64,
    connected: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// OCPP client handle; clones share the same connection and mailbox
#[derive(Clone)]
pub struct OcppClient {
    shared: Arc<Shared>,
}

impl OcppClient {
    pub fn new(config: OcppClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let heartbeat_secs = config.default_heartbeat_interval.as_secs().max(1);

        Self {
            shared: Arc::new(Shared {
                config,
                mailbox: Mailbox::new(),
                outbound_tx,
                outbound_rx: Arc::new(AsyncMutex::new(outbound_rx)),
                boot_accepted: AtomicBool::new(false),
                heartbeat_secs: AtomicU64::new(heartbeat_secs),
                connected,
                task: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OcppClientConfig {
        &self.shared.config
    }

    /// Queue a message for sending; never waits for the network
    pub fn send(&self, message: OcppMessage) -> Result<(), OcppError> {
        self.shared
            .outbound_tx
            .send(message)
            .map_err(|_| OcppError::ConnectionClosed)
    }

    /// Send a Call and wait for the reply with the same id.
    ///
    /// There is no timeout here; wrap it or use [`OcppClient::call`].
    pub async fn request(&self, call: Call) -> Result<OcppMessage, OcppError> {
        let reply = self.shared.mailbox.receive(&call.message_id);
        self.send(OcppMessage::Call(call))?;
        Ok(reply.await)
    }

    /// `request` under the configured call timeout, returning the
    /// CallResult payload
    pub async fn call(&self, call: Call) -> Result<Value, OcppError> {
        let action = call.action.clone();
        match tokio::time::timeout(self.shared.config.call_timeout, self.request(call)).await {
            Ok(reply) => reply?.into_result_payload(),
            Err(_) => {
                debug!("{} timed out after {:?}", action, self.shared.config.call_timeout);
                Err(OcppError::Timeout)
            }
        }
    }

    /// [`OcppClient::call`] with the payload parsed into a response type
    pub async fn call_as<T: DeserializeOwned>(&self, call: Call) -> Result<T, OcppError> {
        let payload = self.call(call).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Wait for the oldest unanswered Call from the central system
    pub async fn receive_call(&self) -> Call {
        self.shared.mailbox.receive_call().await
    }

    /// Answer a central system Call
    pub fn respond(&self, result: CallResult) -> Result<(), OcppError> {
        self.send(OcppMessage::CallResult(result))
    }

    pub fn respond_error(&self, error: CallError) -> Result<(), OcppError> {
        self.send(OcppMessage::CallError(error))
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Observe connection up/down transitions
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.shared.heartbeat_secs.load(Ordering::Relaxed))
    }

    /// Start the background connection loop; no-op if already running
    pub fn start(&self) {
        let mut task = self.shared.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let client = self.clone();
        *task = Some(tokio::spawn(async move { client.run().await }));
    }

    /// Stop the connection loop and wait until it has shut down; no-op if
    /// not running
    pub async fn stop(&self) {
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            self.shared.connected.send_replace(false);
            info!("OCPP client stopped");
        }
    }

    /// Take over the transport with an in-process loopback.
    ///
    /// Waits while a live connection holds the outbound queue, so it must not
    /// be combined with [`OcppClient::start`].
    pub async fn loopback(&self) -> Loopback {
        Loopback {
            outbound: self.shared.outbound_rx.clone().lock_owned().await,
            mailbox: self.shared.mailbox.clone(),
        }
    }

    async fn run(self) {
        loop {
            info!("Connecting to central system: {}", self.shared.config.endpoint);

            if let Err(e) = self.connect_and_run().await {
                error!("OCPP connection failed ({:?}): {}", e.kind(), e);
            }
            self.shared.connected.send_replace(false);

            info!("Reconnecting in {:?}", self.shared.config.reconnect_interval);
            tokio::time::sleep(self.shared.config.reconnect_interval).await;
        }
    }

    /// Connect, handshake and run until any duty fails
    async fn connect_and_run(&self) -> Result<(), OcppError> {
        let request = self.build_request()?;
        // Fails unless the central system echoes `ocpp1.6`
        let (ws_stream, _) = connect_async(request).await?;

        info!("WebSocket connected to {}", self.shared.config.endpoint);
        self.shared.connected.send_replace(true);

        // Exclusive while this connection lives
        let mut outbound = self.shared.outbound_rx.lock().await;

        let (mut sink, mut stream) = ws_stream.split();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<OcppMessage>();

        let reader = async {
            while let Some(frame) = stream.next().await {
                match frame? {
                    WsMessage::Text(text) => {
                        debug!("Received: {}", text);
                        let message = OcppMessage::parse(&text)?;
                        self.shared.mailbox.push(message);
                    }
                    WsMessage::Close(frame) => {
                        info!("WebSocket closed by central system: {:?}", frame);
                        return Err(OcppError::ConnectionClosed);
                    }
                    _ => {}
                }
            }
            Err(OcppError::ConnectionClosed)
        };

        let writer = async {
            while let Some(message) = frames_rx.recv().await {
                let text = message.to_text()?;
                debug!("Sending: {}", text);
                sink.send(WsMessage::Text(text.into())).await?;
            }
            Err(OcppError::ConnectionClosed)
        };

        let session = async {
            self.handshake(&frames_tx).await?;
            tokio::select! {
                result = self.heartbeat(&frames_tx) => result,
                result = forward(&mut outbound, &frames_tx) => result,
            }
        };

        let result = tokio::select! {
            result = reader => result,
            result = writer => result,
            result = session => result,
        };

        let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        info!("WebSocket disconnected");

        result
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, OcppError> {
        let mut request = self.shared.config.endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        for (name, value) in &self.shared.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| OcppError::InvalidEndpoint(format!("invalid header name {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| OcppError::InvalidEndpoint(format!("invalid value for header {}", name)))?;
            headers.insert(name, value);
        }

        Ok(request)
    }

    /// Send a Call on this connection and wait for its reply under the call
    /// timeout
    async fn exchange(
        &self,
        frames: &mpsc::UnboundedSender<OcppMessage>,
        call: Call,
    ) -> Result<OcppMessage, OcppError> {
        let reply = self.shared.mailbox.receive(&call.message_id);
        frames
            .send(OcppMessage::Call(call))
            .map_err(|_| OcppError::ConnectionClosed)?;

        tokio::time::timeout(self.shared.config.call_timeout, reply)
            .await
            .map_err(|_| OcppError::Timeout)
    }

    async fn handshake(&self, frames: &mpsc::UnboundedSender<OcppMessage>) -> Result<(), OcppError> {
        if self.shared.config.boot_policy == BootPolicy::OncePerProcess
            && self.shared.boot_accepted.load(Ordering::Acquire)
        {
            debug!("BootNotification already accepted, skipping");
            return Ok(());
        }

        let call = Call::boot_notification(self.shared.config.boot_request())?;
        let payload = self.exchange(frames, call).await?.into_result_payload()?;
        let response: BootNotificationResponse = serde_json::from_value(payload)?;

        if response.status != RegistrationStatus::Accepted {
            return Err(OcppError::BootRejected(response.status));
        }

        let interval = response.interval.max(1);
        self.shared.heartbeat_secs.store(interval, Ordering::Relaxed);
        self.shared.boot_accepted.store(true, Ordering::Release);
        info!("BootNotification accepted, heartbeat interval: {}s", interval);

        Ok(())
    }

    async fn heartbeat(&self, frames: &mpsc::UnboundedSender<OcppMessage>) -> Result<(), OcppError> {
        loop {
            tokio::time::sleep(self.heartbeat_interval()).await;

            let call = Call::heartbeat()?;
            if let OcppMessage::CallError(e) = self.exchange(frames, call).await? {
                warn!("Heartbeat answered with {:?}: {}", e.error_code, e.error_description);
            }
        }
    }
}

/// Move queued application messages onto the live connection
async fn forward(
    outbound: &mut OutboundRx,
    frames: &mpsc::UnboundedSender<OcppMessage>,
) -> Result<(), OcppError> {
    while let Some(message) = outbound.recv().await {
        frames.send(message).map_err(|_| OcppError::ConnectionClosed)?;
    }
    Err(OcppError::ConnectionClosed)
}

/// In-process transport standing in for the WebSocket
pub struct Loopback {
    outbound: OwnedMutexGuard<OutboundRx>,
    mailbox: Mailbox,
}

impl Loopback {
    /// Next message the charge point sent
    pub async fn next_outbound(&mut self) -> Option<OcppMessage> {
        self.outbound.recv().await
    }

    /// Hand a message to the charge point as if it arrived on the wire
    pub fn deliver(&self, message: OcppMessage) {
        self.mailbox.push(message);
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }
}
