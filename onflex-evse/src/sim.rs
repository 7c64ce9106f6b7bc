//! Simulated collaborators
//!
//! - [`SimHardware`]: every hardware trait backed by in-memory state, with
//!   a record of what the station did to its outputs
//! - [`CentralSystemSim`]: a scripted central system speaking to an
//!   [`OcppClient`] over its loopback transport
//!
//! Used by the test suite and by the node binary when no real hardware is
//! attached.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::hal::*;
use crate::ocpp::*;

// ============================================================================
// Hardware
// ============================================================================

struct SimState {
    cp: CpState,
    pilot_fault: bool,
    meter: MeterSample,
    tags: VecDeque<String>,
    relay: Vec<RelayState>,
    duty_cycles: Vec<f64>,
    current_limits: Vec<f64>,
    cues: Vec<Cue>,
    reboots: usize,
}

/// In-memory hardware; clones share state
#[derive(Clone)]
pub struct SimHardware {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHardware {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                cp: CpState::A,
                pilot_fault: false,
                meter: MeterSample {
                    voltage: 2300,
                    current: 0,
                    energy_wh: 0,
                },
                tags: VecDeque::new(),
                relay: Vec::new(),
                duty_cycles: Vec::new(),
                current_limits: Vec::new(),
                cues: Vec::new(),
                reboots: 0,
            })),
        }
    }

    /// Collaborator bundle backed by this simulation
    pub fn hardware(&self) -> Hardware {
        Hardware {
            pilot: Arc::new(self.clone()),
            meter: Arc::new(self.clone()),
            id_tags: Arc::new(self.clone()),
            relay: Arc::new(self.clone()),
            pwm: Arc::new(self.clone()),
            cues: Arc::new(self.clone()),
            rebooter: Arc::new(self.clone()),
        }
    }

    pub fn set_cp(&self, cp: CpState) {
        self.state.lock().cp = cp;
    }

    /// Make the pilot sensor fail (or recover)
    pub fn fail_pilot(&self, fault: bool) {
        self.state.lock().pilot_fault = fault;
    }

    pub fn set_energy_wh(&self, energy_wh: u64) {
        self.state.lock().meter.energy_wh = energy_wh;
    }

    pub fn set_current_ma(&self, current: u32) {
        self.state.lock().meter.current = current;
    }

    pub fn present_tag(&self, tag: impl Into<String>) {
        self.state.lock().tags.push_back(tag.into());
    }

    /// Last relay command, if any
    pub fn relay_state(&self) -> Option<RelayState> {
        self.state.lock().relay.last().copied()
    }

    pub fn relay_history(&self) -> Vec<RelayState> {
        self.state.lock().relay.clone()
    }

    pub fn duty_cycle(&self) -> Option<f64> {
        self.state.lock().duty_cycles.last().copied()
    }

    pub fn current_limits(&self) -> Vec<f64> {
        self.state.lock().current_limits.clone()
    }

    pub fn cues(&self) -> Vec<Cue> {
        self.state.lock().cues.clone()
    }

    pub fn audio_cues(&self) -> Vec<AudioCue> {
        self.state
            .lock()
            .cues
            .iter()
            .filter_map(|cue| match cue {
                Cue::Audio(audio) => Some(*audio),
                Cue::Display(_) => None,
            })
            .collect()
    }

    pub fn cue_count(&self, cue: AudioCue) -> usize {
        self.audio_cues().into_iter().filter(|c| *c == cue).count()
    }

    pub fn reboots(&self) -> usize {
        self.state.lock().reboots
    }

    pub fn apply(&self, command: &SimCommand) {
        match command {
            SimCommand::Plug => self.set_cp(CpState::B),
            SimCommand::Ready => self.set_cp(CpState::C),
            SimCommand::Unplug => self.set_cp(CpState::A),
            SimCommand::Tag(tag) => self.present_tag(tag.clone()),
            SimCommand::Energy(wh) => self.set_energy_wh(*wh),
        }
    }
}

impl PilotSensor for SimHardware {
    fn sample(&self) -> Result<CpState, HalError> {
        let state = self.state.lock();
        if state.pilot_fault {
            return Err(HalError::device("pilot", "no stable level"));
        }
        Ok(state.cp)
    }
}

impl MeterReader for SimHardware {
    fn read(&self) -> Result<MeterSample, HalError> {
        Ok(self.state.lock().meter)
    }
}

impl IdTagReader for SimHardware {
    fn receive(&self) -> Option<String> {
        self.state.lock().tags.pop_front()
    }

    fn clear(&self) {
        self.state.lock().tags.clear();
    }
}

impl Relay for SimHardware {
    fn set_state(&self, state: RelayState) -> Result<(), HalError> {
        self.state.lock().relay.push(state);
        Ok(())
    }
}

impl PwmController for SimHardware {
    fn set_duty_cycle(&self, percent: f64) -> Result<(), HalError> {
        self.state.lock().duty_cycles.push(percent);
        Ok(())
    }

    fn set_current_limit(&self, amps: f64) -> Result<(), HalError> {
        let duty = duty_cycle_for_current(amps)
            .ok_or_else(|| HalError::device("pwm", format!("unsupported current {}A", amps)))?;
        let mut state = self.state.lock();
        state.current_limits.push(amps);
        state.duty_cycles.push(duty);
        Ok(())
    }
}

impl CueSink for SimHardware {
    fn enqueue(&self, cue: Cue) {
        debug!("Cue: {:?}", cue);
        self.state.lock().cues.push(cue);
    }
}

impl Rebooter for SimHardware {
    fn reboot(&self) -> Result<(), HalError> {
        info!("Simulated reboot");
        self.state.lock().reboots += 1;
        Ok(())
    }
}

/// Console command driving [`SimHardware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    /// Vehicle connected (CP B)
    Plug,
    /// Vehicle ready (CP C)
    Ready,
    /// Vehicle gone (CP A)
    Unplug,
    Tag(String),
    /// Set the cumulative meter reading
    Energy(u64),
}

impl SimCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next()?, words.next()) {
            ("plug", None) => SimCommand::Plug,
            ("ready", None) => SimCommand::Ready,
            ("unplug", None) => SimCommand::Unplug,
            ("tag", Some(tag)) => SimCommand::Tag(tag.to_string()),
            ("energy", Some(wh)) => SimCommand::Energy(wh.parse().ok()?),
            _ => return None,
        };

        if words.next().is_some() {
            return None;
        }
        Some(command)
    }
}

// ============================================================================
// Central system
// ============================================================================

/// How the simulated central system answers
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub authorize: AuthorizationStatus,
    pub transaction_id: i64,
    /// `data` of the MaximumCharge DataTransfer reply
    pub max_charge: Option<Value>,
    /// `data` of the GetPrice DataTransfer reply
    pub price: Option<Value>,
    pub heartbeat_interval: u64,
    /// When false, calls are recorded but never answered
    pub online: bool,
    /// When false, DataTransfer calls alone go unanswered
    pub answer_data_transfer: bool,
}

impl Behaviour {
    fn answers(&self, call: &Call) -> bool {
        self.online && (self.answer_data_transfer || call.action != Action::DataTransfer)
    }
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            authorize: AuthorizationStatus::Accepted,
            transaction_id: 1,
            max_charge: Some(json!("100000")),
            price: Some(json!("0.35")),
            heartbeat_interval: 60,
            online: true,
            answer_data_transfer: true,
        }
    }
}

#[derive(Default)]
struct CentralState {
    behaviour: Behaviour,
    calls: Vec<Call>,
    replies: Vec<OcppMessage>,
}

/// Scripted central system bound to a client's loopback transport
pub struct CentralSystemSim {
    state: Arc<Mutex<CentralState>>,
    mailbox: Mailbox,
    task: JoinHandle<()>,
}

impl CentralSystemSim {
    /// Take over `client`'s transport; the client must not be started
    pub async fn attach(client: &OcppClient, behaviour: Behaviour) -> Self {
        let mut loopback = client.loopback().await;
        let mailbox = loopback.mailbox();
        let state = Arc::new(Mutex::new(CentralState {
            behaviour,
            ..Default::default()
        }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = loopback.next_outbound().await {
                match message {
                    OcppMessage::Call(call) => {
                        debug!("Central system received {}", call.action);
                        let reply = {
                            let mut state = shared.lock();
                            state.calls.push(call.clone());
                            state.behaviour.answers(&call).then(|| answer(&state.behaviour, &call))
                        };
                        if let Some(reply) = reply {
                            loopback.deliver(reply);
                        }
                    }
                    reply => shared.lock().replies.push(reply),
                }
            }
        });

        Self { state, mailbox, task }
    }

    pub fn set_behaviour(&self, update: impl FnOnce(&mut Behaviour)) {
        update(&mut self.state.lock().behaviour);
    }

    /// Every Call the charge point sent, in order
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, action: Action) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }

    /// Send a Call to the charge point; returns its message id
    pub fn inject_call(&self, action: Action, payload: Value) -> String {
        let call = Call {
            message_id: new_message_id(),
            action,
            payload,
        };
        let message_id = call.message_id.clone();
        self.mailbox.push(OcppMessage::Call(call));
        message_id
    }

    /// The charge point's answer to an injected Call
    pub fn reply_to(&self, message_id: &str) -> Option<OcppMessage> {
        self.state
            .lock()
            .replies
            .iter()
            .find(|r| r.message_id() == message_id)
            .cloned()
    }
}

impl Drop for CentralSystemSim {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn answer(behaviour: &Behaviour, call: &Call) -> OcppMessage {
    let now = timestamp::format(&Utc::now());
    let payload = match &call.action {
        Action::BootNotification => json!({
            "status": "Accepted",
            "interval": behaviour.heartbeat_interval,
            "currentTime": now,
        }),
        Action::Heartbeat => json!({ "currentTime": now }),
        Action::Authorize => json!({ "idTagInfo": { "status": behaviour.authorize } }),
        Action::StartTransaction => json!({
            "transactionId": behaviour.transaction_id,
            "idTagInfo": { "status": "Accepted" },
        }),
        Action::DataTransfer => {
            let data = match call.payload.get("messageId").and_then(Value::as_str) {
                Some("MaximumCharge") => behaviour.max_charge.clone(),
                Some("GetPrice") => behaviour.price.clone(),
                _ => {
                    return OcppMessage::CallResult(CallResult {
                        message_id: call.message_id.clone(),
                        payload: json!({ "status": "UnknownMessageId" }),
                    })
                }
            };
            match data {
                Some(data) => json!({ "status": "Accepted", "data": data }),
                None => json!({ "status": "Accepted" }),
            }
        }
        Action::StatusNotification
        | Action::StopTransaction
        | Action::MeterValues
        | Action::FirmwareStatusNotification => json!({}),
        other => {
            return OcppMessage::CallError(CallError::new(
                call.message_id.clone(),
                ErrorCode::NotImplemented,
                format!("{} is not handled by the central system", other),
            ))
        }
    };

    OcppMessage::CallResult(CallResult {
        message_id: call.message_id.clone(),
        payload,
    })
}
