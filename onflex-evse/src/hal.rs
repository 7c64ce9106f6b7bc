//! Hardware collaborators
//!
//! The charging core never touches GPIO, ADC or serial ports directly. It
//! talks to these traits instead:
//! - [`PilotSensor`] / [`MeterReader`]: sampled by the monitors
//! - [`IdTagReader`]: non-blocking RFID polling
//! - [`Relay`] / [`PwmController`]: outputs owned by the active mode
//! - [`CueSink`]: fire-and-forget audio and display cues
//! - [`Rebooter`]: hard reboot of the unit
//!
//! # Implementing a driver
//!
//! ```ignore
//! struct GpioRelay { /* pins */ }
//!
//! impl Relay for GpioRelay {
//!     fn set_state(&self, state: RelayState) -> Result<(), HalError> {
//!         // Pulse the open/close coil, ~40ms
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("{device} fault: {message}")]
    Device { device: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HalError {
    pub fn device(device: &'static str, message: impl Into<String>) -> Self {
        HalError::Device {
            device,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CollaboratorFault
    }
}

// ============================================================================
// Control pilot
// ============================================================================

/// IEC 61851-1 control pilot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpState {
    /// No vehicle
    A,
    /// Vehicle connected, not ready
    B,
    /// Vehicle ready to charge
    C,
    /// Ready, ventilation required
    D,
}

impl fmt::Display for CpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl CpState {
    /// Consecutive in-band samples needed before a level is trusted
    const DEBOUNCE: usize = 5;

    /// Classify a burst of raw pilot ADC samples (oldest first).
    ///
    /// Samples are scanned newest first; the first level seen more than
    /// [`Self::DEBOUNCE`] times wins. Out-of-band samples (PWM edges) are
    /// ignored. Returns `None` when no level is stable.
    pub fn from_adc_samples(samples: &[f64]) -> Option<Self> {
        let mut counts = [0usize; 4];

        for &value in samples.iter().rev() {
            let (index, state) = match value {
                v if (963.9563..=1065.4254).contains(&v) => (0, CpState::A),
                v if (807.7187..=892.7418).contains(&v) => (1, CpState::B),
                v if (657.3769..=726.5745).contains(&v) => (2, CpState::C),
                v if (486.4000..=537.6000).contains(&v) => (3, CpState::D),
                _ => continue,
            };

            counts[index] += 1;
            if counts[index] > Self::DEBOUNCE {
                return Some(state);
            }
        }

        None
    }
}

pub trait PilotSensor: Send + Sync {
    fn sample(&self) -> Result<CpState, HalError>;
}

// ============================================================================
// Energy meter
// ============================================================================

/// One power meter reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeterSample {
    /// Decivolts
    pub voltage: u32,
    /// Milliamps
    pub current: u32,
    /// Cumulative energy in Wh, never decreases
    pub energy_wh: u64,
}

impl MeterSample {
    /// Parse a meter `M30` reply: `S,ALL,<voltage>,<current>,_,<energy>,_,E`
    pub fn parse_frame(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() != 8 || fields[0] != "S" || fields[1] != "ALL" || fields[7] != "E" {
            return None;
        }

        Some(Self {
            voltage: fields[2].trim().parse().ok()?,
            current: fields[3].trim().parse().ok()?,
            energy_wh: fields[5].trim().parse().ok()?,
        })
    }

    pub fn volts(&self) -> f64 {
        self.voltage as f64 / 10.0
    }

    pub fn amps(&self) -> f64 {
        self.current as f64 / 1_000.0
    }

    pub fn kwh(&self) -> f64 {
        self.energy_wh as f64 / 1_000.0
    }
}

pub trait MeterReader: Send + Sync {
    fn read(&self) -> Result<MeterSample, HalError>;
}

// ============================================================================
// Id tag reader
// ============================================================================

pub trait IdTagReader: Send + Sync {
    /// Next presented tag, if any; never blocks
    fn receive(&self) -> Option<String>;

    /// Discard anything buffered
    fn clear(&self);
}

// ============================================================================
// Outputs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    Closed,
}

/// Latching contactor; `set_state` blocks for the coil pulse, so async code
/// switches it through [`actuate`]
pub trait Relay: Send + Sync {
    fn set_state(&self, state: RelayState) -> Result<(), HalError>;
}

/// Switch the relay on the blocking pool
pub async fn actuate(relay: Arc<dyn Relay>, state: RelayState) -> Result<(), HalError> {
    tokio::task::spawn_blocking(move || relay.set_state(state))
        .await
        .map_err(|e| HalError::device("relay", e.to_string()))?
}

pub trait PwmController: Send + Sync {
    /// 100% advertises "not ready", 3% is the finishing signal
    fn set_duty_cycle(&self, percent: f64) -> Result<(), HalError>;

    /// Advertise a charging current through the duty cycle
    fn set_current_limit(&self, amps: f64) -> Result<(), HalError> {
        match duty_cycle_for_current(amps) {
            Some(duty) => self.set_duty_cycle(duty),
            None => Err(HalError::device("pwm", format!("unsupported current {}A", amps))),
        }
    }
}

/// IEC 61851-1 duty cycle advertising `amps`; `None` outside 6..=80A
pub fn duty_cycle_for_current(amps: f64) -> Option<f64> {
    if (6.0..=51.0).contains(&amps) {
        Some(amps / 0.6)
    } else if amps > 51.0 && amps <= 80.0 {
        Some(amps / 2.5 + 64.0)
    } else {
        None
    }
}

// ============================================================================
// Cues
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCue {
    ChargerStart,
    EvConnected,
    EvDisconnected,
    InsufficientFunds,
    InvalidCard,
    ServerUnreachable,
    ChargingWaiting,
    AuthorityTimeout,
    ChargingStarted,
    ChargingStopFailed,
    ChargingStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayAction {
    Connecting,
    IdTagReceiving,
    Charging { start_meter_wh: u64, unit_price: f64 },
    Finished { delivered_wh: u64, cost: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    Audio(AudioCue),
    Display(DisplayAction),
}

impl From<AudioCue> for Cue {
    fn from(cue: AudioCue) -> Self {
        Cue::Audio(cue)
    }
}

impl From<DisplayAction> for Cue {
    fn from(action: DisplayAction) -> Self {
        Cue::Display(action)
    }
}

/// Audio/display presentation; must not block
pub trait CueSink: Send + Sync {
    fn enqueue(&self, cue: Cue);
}

// ============================================================================
// Reboot
// ============================================================================

pub trait Rebooter: Send + Sync {
    fn reboot(&self) -> Result<(), HalError>;
}

/// Hard reboot through the system `reboot` command
#[derive(Debug, Default)]
pub struct SystemRebooter;

impl Rebooter for SystemRebooter {
    fn reboot(&self) -> Result<(), HalError> {
        info!("Rebooting");
        let status = std::process::Command::new("reboot").arg("-f").status()?;
        if status.success() {
            Ok(())
        } else {
            Err(HalError::device("reboot", format!("exited with {}", status)))
        }
    }
}

// ============================================================================
// Hardware bundle
// ============================================================================

/// Every collaborator the station needs
#[derive(Clone)]
pub struct Hardware {
    pub pilot: Arc<dyn PilotSensor>,
    pub meter: Arc<dyn MeterReader>,
    pub id_tags: Arc<dyn IdTagReader>,
    pub relay: Arc<dyn Relay>,
    pub pwm: Arc<dyn PwmController>,
    pub cues: Arc<dyn CueSink>,
    pub rebooter: Arc<dyn Rebooter>,
}

impl Hardware {
    pub fn cue(&self, cue: impl Into<Cue>) {
        self.cues.enqueue(cue.into());
    }

    pub async fn set_relay(&self, state: RelayState) -> Result<(), HalError> {
        actuate(self.relay.clone(), state).await
    }

    /// [`Hardware::make_safe`] with the relay switched on the blocking pool
    pub async fn restore_safe(&self) -> Result<(), HalError> {
        self.set_relay(RelayState::Open).await?;
        self.pwm.set_duty_cycle(100.0)
    }

    /// Relay open, PWM at 100%. Blocking; also runs from [`SafeOutputs`] on drop.
    pub fn make_safe(&self) -> Result<(), HalError> {
        self.relay.set_state(RelayState::Open)?;
        self.pwm.set_duty_cycle(100.0)
    }
}

// ============================================================================
// Safe output guard
// ============================================================================

/// Restores the safe output state when dropped, whichever way the owning
/// scope ends
pub struct SafeOutputs {
    hardware: Hardware,
}

impl SafeOutputs {
    pub fn new(hardware: Hardware) -> Self {
        Self { hardware }
    }
}

impl Drop for SafeOutputs {
    fn drop(&mut self) {
        if let Err(e) = self.hardware.make_safe() {
            error!("Failed to restore safe outputs: {}", e);
        }
    }
}
