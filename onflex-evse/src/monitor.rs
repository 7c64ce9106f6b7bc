//! CP and meter monitors
//!
//! Each monitor is the single writer of its value: a background task polls
//! the sensor and publishes into a `watch` channel. Everybody else holds a
//! cheap read handle and takes snapshots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Timings;
use crate::hal::{CpState, Hardware, MeterReader, MeterSample, PilotSensor};

/// Read handle on the control pilot state
#[derive(Clone)]
pub struct CpMonitor {
    state: watch::Receiver<CpState>,
}

impl CpMonitor {
    pub fn current_state(&self) -> CpState {
        *self.state.borrow()
    }
}

/// Read handle on the latest meter sample
#[derive(Clone)]
pub struct MeterMonitor {
    values: watch::Receiver<MeterSample>,
}

impl MeterMonitor {
    pub fn current_values(&self) -> MeterSample {
        *self.values.borrow()
    }

    pub fn energy_wh(&self) -> u64 {
        self.values.borrow().energy_wh
    }
}

/// Both monitors; their tasks stop when this is dropped
pub struct Monitors {
    pub cp: CpMonitor,
    pub meter: MeterMonitor,
    _tasks: JoinSet<()>,
}

impl Monitors {
    pub fn spawn(hardware: &Hardware, timings: &Timings) -> Self {
        let mut tasks = JoinSet::new();

        let (cp_tx, cp_rx) = watch::channel(CpState::A);
        tasks.spawn(run_cp_monitor(hardware.pilot.clone(), cp_tx, timings.cp_poll));

        let (meter_tx, meter_rx) = watch::channel(MeterSample::default());
        tasks.spawn(run_meter_monitor(
            hardware.meter.clone(),
            meter_tx,
            timings.meter_poll,
            timings.meter_log_interval,
        ));

        Self {
            cp: CpMonitor { state: cp_rx },
            meter: MeterMonitor { values: meter_rx },
            _tasks: tasks,
        }
    }
}

async fn run_cp_monitor(sensor: Arc<dyn PilotSensor>, state: watch::Sender<CpState>, poll: Duration) {
    let mut failing = false;

    loop {
        match sensor.sample() {
            Ok(sample) => {
                failing = false;
                let previous = *state.borrow();
                if previous != sample {
                    info!("CP state changed ({} -> {})", previous, sample);
                    state.send_replace(sample);
                }
            }
            Err(e) => {
                if !failing {
                    warn!("CP sample failed, keeping previous state: {}", e);
                }
                failing = true;
            }
        }

        tokio::time::sleep(poll).await;
    }
}

async fn run_meter_monitor(
    meter: Arc<dyn MeterReader>,
    values: watch::Sender<MeterSample>,
    poll: Duration,
    log_interval: Duration,
) {
    let mut last_log: Option<Instant> = None;
    let mut failing = false;

    loop {
        match meter.read() {
            Ok(sample) => {
                failing = false;
                values.send_replace(sample);

                if last_log.map_or(true, |t| t.elapsed() >= log_interval) {
                    info!(
                        "Meter reading: {:.2}kWh, {:.1}V, {:.2}A",
                        sample.kwh(),
                        sample.volts(),
                        sample.amps()
                    );
                    last_log = Some(Instant::now());
                }
            }
            Err(e) => {
                if !failing {
                    warn!("Meter read failed, keeping previous values: {}", e);
                }
                failing = true;
            }
        }

        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHardware;

    #[tokio::test(start_paused = true)]
    async fn test_monitors_follow_hardware() {
        let sim = SimHardware::new();
        let monitors = Monitors::spawn(&sim.hardware(), &Timings::default());
        assert_eq!(monitors.cp.current_state(), CpState::A);

        sim.set_cp(CpState::B);
        sim.set_energy_wh(1_250);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(monitors.cp.current_state(), CpState::B);
        assert_eq!(monitors.meter.energy_wh(), 1_250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_fault_keeps_previous_state() {
        let sim = SimHardware::new();
        let monitors = Monitors::spawn(&sim.hardware(), &Timings::default());

        sim.set_cp(CpState::C);
        tokio::time::sleep(Duration::from_secs(1)).await;
        sim.fail_pilot(true);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(monitors.cp.current_state(), CpState::C);
    }
}
