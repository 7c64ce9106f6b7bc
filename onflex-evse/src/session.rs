//! Charging session controller
//!
//! One iteration of the controller is one charging session:
//!
//! ```text
//! Idle -> Waiting (tag / remote start) -> ReadyCheck (B, 32A, C; <= 30s)
//!      -> Charging -> StopEvaluation -> Finishing (wait for A) -> Idle
//! ```
//!
//! The controller is the only writer of the relay and PWM outputs while the
//! charging mode is active. Any error aborts the iteration; the next
//! iteration starts by making the outputs safe again.

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{IdTagLists, TagClass, Timings};
use crate::dispatcher::RemoteCommands;
use crate::error::{ChargerError, ErrorKind};
use crate::hal::{actuate, AudioCue, CpState, DisplayAction, Hardware, RelayState};
use crate::monitor::{CpMonitor, MeterMonitor};
use crate::ocpp::*;
use crate::station::OperatingMode;

/// The station has a single connector
pub const CONNECTOR_ID: u32 = 1;

/// Current advertised once the vehicle is connected
const CHARGING_CURRENT_A: f64 = 32.0;

/// PWM duty cycle signalling the end of charging
const FINISHING_DUTY_CYCLE: f64 = 3.0;

/// Per-iteration session data
#[derive(Debug, Clone)]
struct Session {
    start_tag: String,
    start_meter_wh: u64,
    transaction_id: i64,
    /// Energy budget in Wh; 0 when the central system gave no usable one
    energy_cap_wh: u64,
    unit_price: f64,
}

impl Session {
    fn delivered_wh(&self, meter_wh: u64) -> u64 {
        meter_wh.saturating_sub(self.start_meter_wh)
    }
}

/// How the waiting phase ended
enum Start {
    Tag(String),
    Switch(OperatingMode),
}

pub struct ChargingController {
    client: OcppClient,
    hardware: Hardware,
    cp: CpMonitor,
    meter: MeterMonitor,
    remote: RemoteCommands,
    id_tags: IdTagLists,
    timings: Timings,
    /// Last status pushed to the central system
    ocpp_status: Option<ChargePointStatus>,
    /// Last CP state acted upon while waiting
    last_cp: Option<CpState>,
    /// Best-effort notifications; cancelled with the controller
    notifications: JoinSet<()>,
}

impl ChargingController {
    pub fn new(
        client: OcppClient,
        hardware: Hardware,
        cp: CpMonitor,
        meter: MeterMonitor,
        remote: RemoteCommands,
        id_tags: IdTagLists,
        timings: Timings,
    ) -> Self {
        Self {
            client,
            hardware,
            cp,
            meter,
            remote,
            id_tags,
            timings,
            ocpp_status: None,
            last_cp: None,
            notifications: JoinSet::new(),
        }
    }

    /// Run charging sessions until a privileged tag selects another mode
    pub async fn run(&mut self) -> OperatingMode {
        self.hardware.cue(AudioCue::ChargerStart);
        self.hardware.cue(DisplayAction::Connecting);

        loop {
            match self.run_session().await {
                Ok(Some(mode)) => {
                    info!("Leaving charging mode for {:?}", mode);
                    return mode;
                }
                Ok(None) => {}
                Err(e) => {
                    match e.kind() {
                        ErrorKind::ProtocolTimeout => {
                            error!("Session aborted, central system did not answer: {}", e)
                        }
                        ErrorKind::ConnectionFailure | ErrorKind::ProtocolViolation => {
                            error!("Session aborted by protocol failure: {}", e)
                        }
                        ErrorKind::CollaboratorFault => error!("Session aborted by hardware fault: {}", e),
                        ErrorKind::Configuration => error!("Session aborted: {}", e),
                    }
                    if let Err(e) = self.hardware.restore_safe().await {
                        error!("Failed to restore safe outputs: {}", e);
                    }
                    tokio::time::sleep(self.timings.tick).await;
                }
            }
        }
    }

    /// One session iteration. `Ok(Some(_))` asks for a mode switch.
    async fn run_session(&mut self) -> Result<Option<OperatingMode>, ChargerError> {
        // Idle
        self.hardware.pwm.set_duty_cycle(100.0)?;
        self.hardware.set_relay(RelayState::Open).await?;
        self.remote.clear();
        self.hardware.id_tags.clear();

        let start_tag = match self.wait_for_start().await? {
            Start::Tag(tag) => tag,
            Start::Switch(mode) => return Ok(Some(mode)),
        };
        info!("Session authorized for {}", start_tag);

        self.hardware.cue(AudioCue::ChargingWaiting);
        if self.ocpp_status != Some(ChargePointStatus::Preparing) {
            self.notify_status(ChargePointStatus::Preparing);
        }

        match tokio::time::timeout(self.timings.readiness_window, self.wait_until_ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                warn!("Vehicle not ready within {:?}", self.timings.readiness_window);
                self.hardware.cue(AudioCue::AuthorityTimeout);
                return Ok(None);
            }
        }

        let session = self.start_charging(start_tag).await?;

        let mut metering = JoinSet::new();
        metering.spawn(report_meter_values(
            self.client.clone(),
            self.meter.clone(),
            session.clone(),
            self.timings.meter_values_interval,
        ));
        self.hardware.cue(AudioCue::ChargingStarted);
        self.hardware.id_tags.clear();

        let stop_tag = self.wait_for_stop(&session).await;

        metering.abort_all();
        self.stop_charging(&session, stop_tag).await?;

        while self.cp.current_state() != CpState::A {
            self.reap_notifications();
            tokio::time::sleep(self.timings.tick).await;
        }
        // Next waiting phase must not report the unplug as a fresh change
        self.last_cp = Some(CpState::B);

        Ok(None)
    }

    async fn wait_for_start(&mut self) -> Result<Start, ChargerError> {
        let mut authorize: JoinSet<Option<String>> = JoinSet::new();

        loop {
            if let Some(tag) = self.hardware.id_tags.receive() {
                match self.id_tags.classify(&tag) {
                    TagClass::Manufacturer => return Ok(Start::Switch(OperatingMode::Manufacturer)),
                    TagClass::Calibration => return Ok(Start::Switch(OperatingMode::Calibration)),
                    TagClass::User if authorize.is_empty() => {
                        info!("Authorizing {}", tag);
                        authorize.spawn(authorize_tag(self.client.clone(), self.hardware.clone(), tag));
                    }
                    TagClass::User => debug!("Authorization in progress, ignoring {}", tag),
                }
            }

            match authorize.try_join_next() {
                Some(Ok(Some(tag))) => return Ok(Start::Tag(tag)),
                Some(Err(e)) => warn!("Authorize task failed: {}", e),
                Some(Ok(None)) | None => {}
            }

            let cp = self.cp.current_state();
            if self.last_cp != Some(cp) {
                self.last_cp = Some(cp);
                self.on_cp_change(cp);
            }

            if let Some(tag) = self.remote.pending_start() {
                info!("Remote start for {}", tag);
                return Ok(Start::Tag(tag));
            }

            self.reap_notifications();
            tokio::time::sleep(self.timings.tick).await;
        }
    }

    fn on_cp_change(&mut self, cp: CpState) {
        match cp {
            CpState::A => {
                self.hardware.cue(DisplayAction::Connecting);
                if self.ocpp_status != Some(ChargePointStatus::Available) {
                    if self.ocpp_status.is_some() {
                        self.hardware.cue(AudioCue::EvDisconnected);
                    }
                    self.notify_status(ChargePointStatus::Available);
                }
            }
            CpState::B => {
                self.hardware.cue(DisplayAction::IdTagReceiving);
                if self.ocpp_status != Some(ChargePointStatus::Preparing) {
                    self.notify_status(ChargePointStatus::Preparing);
                    self.hardware.cue(AudioCue::EvConnected);
                }
            }
            CpState::C | CpState::D => {}
        }
    }

    async fn wait_until_ready(&self) -> Result<(), ChargerError> {
        self.wait_for_cp(CpState::B).await;
        self.hardware.pwm.set_current_limit(CHARGING_CURRENT_A)?;
        self.wait_for_cp(CpState::C).await;
        Ok(())
    }

    async fn wait_for_cp(&self, state: CpState) {
        while self.cp.current_state() != state {
            tokio::time::sleep(self.timings.tick).await;
        }
    }

    async fn start_charging(&mut self, start_tag: String) -> Result<Session, ChargerError> {
        let start_meter_wh = self.meter.energy_wh();
        self.hardware.set_relay(RelayState::Closed).await?;
        info!("Relay closed, meter at {} Wh", start_meter_wh);

        let call = Call::new(
            Action::StartTransaction,
            StartTransactionRequest {
                connector_id: CONNECTOR_ID,
                id_tag: start_tag.clone(),
                meter_start: start_meter_wh,
                reservation_id: 0,
                timestamp: Utc::now(),
            },
        )?;
        let response: StartTransactionResponse = self.client.call_as(call).await?;
        let transaction_id = response.transaction_id;
        info!("Transaction {} started", transaction_id);

        self.notify_status(ChargePointStatus::Charging);

        // From here on a failure leaves the transaction open on the backend
        let energy_cap_wh = match self
            .data_transfer("MaximumCharge", transaction_id)
            .await
            .inspect_err(|e| error!("Transaction {} left open: {}", transaction_id, e))?
        {
            Some(cap) if cap >= 0.0 => cap as u64,
            other => {
                warn!("No usable MaximumCharge ({:?}), stopping at the first delivered Wh", other);
                0
            }
        };
        let unit_price = match self
            .data_transfer("GetPrice", transaction_id)
            .await
            .inspect_err(|e| error!("Transaction {} left open: {}", transaction_id, e))?
        {
            Some(price) => price,
            None => {
                warn!("No usable GetPrice, assuming free charging");
                0.0
            }
        };
        info!("Energy cap: {} Wh, unit price: {}", energy_cap_wh, unit_price);

        self.hardware.cue(DisplayAction::Charging {
            start_meter_wh,
            unit_price,
        });

        Ok(Session {
            start_tag,
            start_meter_wh,
            transaction_id,
            energy_cap_wh,
            unit_price,
        })
    }

    /// Vendor DataTransfer keyed by the transaction id; returns the numeric
    /// `data` of the reply
    async fn data_transfer(&self, message_id: &str, transaction_id: i64) -> Result<Option<f64>, OcppError> {
        let call = Call::data_transfer(&self.client.config().vendor_id, message_id, json!(transaction_id))?;
        let response: DataTransferResponse = self.client.call_as(call).await?;
        if response.status != DataTransferStatus::Accepted {
            warn!("DataTransfer {} answered {:?}", message_id, response.status);
        }
        Ok(response.data_as_f64())
    }

    /// Poll stop conditions; returns the stop tag if the session was ended by
    /// re-presenting the start tag
    async fn wait_for_stop(&mut self, session: &Session) -> Option<String> {
        let tags_accepted_from = Instant::now() + self.timings.stop_tag_grace;

        loop {
            let cp = self.cp.current_state();
            if matches!(cp, CpState::A | CpState::B) {
                info!("Vehicle stopped charging (CP {})", cp);
                return None;
            }

            if Instant::now() > tags_accepted_from {
                if let Some(tag) = self.hardware.id_tags.receive() {
                    if tag == session.start_tag {
                        info!("Stop requested with {}", tag);
                        return Some(tag);
                    }
                    info!("Tag {} cannot stop this session", tag);
                    self.hardware.cue(AudioCue::ChargingStopFailed);
                }
            }

            let delivered = session.delivered_wh(self.meter.energy_wh());
            if delivered > session.energy_cap_wh {
                info!("Energy cap reached ({} Wh > {} Wh)", delivered, session.energy_cap_wh);
                return None;
            }

            if let Some(transaction_id) = self.remote.take_stop() {
                if transaction_id == session.transaction_id {
                    info!("Remote stop for transaction {}", transaction_id);
                    return None;
                }
                debug!("Ignoring remote stop for unknown transaction {}", transaction_id);
            }

            self.reap_notifications();
            tokio::time::sleep(self.timings.tick).await;
        }
    }

    async fn stop_charging(&mut self, session: &Session, stop_tag: Option<String>) -> Result<(), ChargerError> {
        self.hardware.pwm.set_duty_cycle(FINISHING_DUTY_CYCLE)?;
        self.hardware.set_relay(RelayState::Open).await?;
        self.schedule_relay_failsafe();

        let meter_stop = self.meter.energy_wh();
        let delivered_wh = session.delivered_wh(meter_stop);
        self.hardware.cue(DisplayAction::Finished {
            delivered_wh,
            cost: delivered_wh as f64 / 1_000.0 * session.unit_price,
        });

        let now = Utc::now();
        let request = StopTransactionRequest {
            id_tag: stop_tag.unwrap_or_else(|| session.start_tag.clone()),
            meter_stop,
            timestamp: now,
            transaction_id: session.transaction_id,
            reason: StopReason::Local,
            transaction_data: vec![MeterValue {
                timestamp: now,
                sampled_value: vec![SampledValue::energy_wh(delivered_wh)],
            }],
        };
        self.spawn_notification(Call::new(Action::StopTransaction, request));
        self.notify_status(ChargePointStatus::Finishing);
        self.hardware.cue(AudioCue::ChargingStopped);

        info!(
            "Transaction {} stopped, delivered {} Wh",
            session.transaction_id, delivered_wh
        );
        Ok(())
    }

    /// Re-close the latching relay after a while, whatever happens meanwhile
    fn schedule_relay_failsafe(&self) {
        let relay = self.hardware.relay.clone();
        let delay = self.timings.relay_failsafe;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Relay failsafe firing");
            if let Err(e) = actuate(relay, RelayState::Closed).await {
                error!("Relay failsafe failed: {}", e);
            }
        });
    }

    fn notify_status(&mut self, status: ChargePointStatus) {
        self.ocpp_status = Some(status);
        self.spawn_notification(Call::status_notification(CONNECTOR_ID, status));
    }

    /// Send a call whose outcome does not affect the session
    fn spawn_notification(&mut self, call: Result<Call, OcppError>) {
        let client = self.client.clone();
        self.notifications.spawn(async move {
            let call = match call {
                Ok(call) => call,
                Err(e) => {
                    warn!("Failed to build notification: {}", e);
                    return;
                }
            };
            let action = call.action.clone();
            if let Err(e) = client.call(call).await {
                warn!("{} not delivered: {}", action, e);
            }
        });
    }

    fn reap_notifications(&mut self) {
        while self.notifications.try_join_next().is_some() {}
    }
}

async fn authorize_tag(client: OcppClient, hardware: Hardware, tag: String) -> Option<String> {
    let response = match Call::authorize(&tag) {
        Ok(call) => client.call_as::<AuthorizeResponse>(call).await,
        Err(e) => Err(e),
    };

    match response {
        Ok(response) => match response.id_tag_info.status {
            AuthorizationStatus::Accepted => Some(tag),
            AuthorizationStatus::Blocked => {
                info!("{} blocked", tag);
                hardware.cue(AudioCue::InsufficientFunds);
                None
            }
            status => {
                info!("{} not authorized: {:?}", tag, status);
                hardware.cue(AudioCue::InvalidCard);
                None
            }
        },
        Err(e) => {
            warn!("Authorize for {} failed: {}", tag, e);
            hardware.cue(AudioCue::ServerUnreachable);
            None
        }
    }
}

async fn report_meter_values(
    client: OcppClient,
    meter: MeterMonitor,
    session: Session,
    interval: std::time::Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        let delivered = session.delivered_wh(meter.energy_wh());
        let request = MeterValuesRequest {
            connector_id: CONNECTOR_ID,
            transaction_id: session.transaction_id,
            meter_value: vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![SampledValue::energy_wh(delivered)],
            }],
        };

        let result = match Call::new(Action::MeterValues, request) {
            Ok(call) => client.call(call).await.map(drop),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("MeterValues not delivered: {}", e);
        }
    }
}
