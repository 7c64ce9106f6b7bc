//! Shared rig for scenario tests: simulated hardware and central system,
//! monitors, dispatcher and charging controller wired like the station does.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use onflex_evse::config::FirmwareSettings;
use onflex_evse::firmware::FirmwareError;
use onflex_evse::ocpp::{Action, OcppClient, OcppClientConfig, OcppMessage};
use onflex_evse::sim::{Behaviour, CentralSystemSim, SimHardware};
use onflex_evse::{
    ArchiveExtractor, ChargingController, Dispatcher, FirmwareUpdater, IdTagLists, Monitors,
    OperatingMode, RemoteCommands, Timings,
};

/// Records every extraction; fails when told to
#[derive(Default)]
pub struct FakeExtractor {
    pub fail: bool,
    pub extracted: Mutex<Vec<(PathBuf, Vec<u8>, Option<String>)>>,
}

impl ArchiveExtractor for FakeExtractor {
    fn extract(&self, archive: &Path, _destination: &Path, password: Option<&str>) -> Result<(), FirmwareError> {
        let content = std::fs::read(archive)?;
        self.extracted
            .lock()
            .push((archive.to_path_buf(), content, password.map(str::to_string)));
        if self.fail {
            return Err(FirmwareError::Extract("corrupt archive".into()));
        }
        Ok(())
    }
}

pub struct Rig {
    pub sim: SimHardware,
    pub client: OcppClient,
    pub central: CentralSystemSim,
    pub remote: RemoteCommands,
    pub extractor: Arc<FakeExtractor>,
    _monitors: Monitors,
    dispatcher: JoinHandle<()>,
    controller: JoinHandle<OperatingMode>,
}

impl Rig {
    pub async fn start(behaviour: Behaviour) -> Self {
        Self::start_with_tags(behaviour, IdTagLists::default()).await
    }

    pub async fn start_with_tags(behaviour: Behaviour, id_tags: IdTagLists) -> Self {
        let sim = SimHardware::new();
        let hardware = sim.hardware();
        let timings = Timings::default();

        let client = OcppClient::new(OcppClientConfig::default());
        let central = CentralSystemSim::attach(&client, behaviour).await;
        let monitors = Monitors::spawn(&hardware, &timings);
        let remote = RemoteCommands::new();
        let extractor = Arc::new(FakeExtractor::default());

        let firmware = FirmwareUpdater::new(
            client.clone(),
            FirmwareSettings::default(),
            extractor.clone(),
            hardware.rebooter.clone(),
            timings.reboot_delay,
        );
        let dispatcher = Dispatcher::new(
            client.clone(),
            remote.clone(),
            firmware,
            hardware.rebooter.clone(),
            timings.reboot_delay,
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        let mut controller = ChargingController::new(
            client.clone(),
            hardware,
            monitors.cp.clone(),
            monitors.meter.clone(),
            remote.clone(),
            id_tags,
            timings,
        );
        let controller = tokio::spawn(async move { controller.run().await });

        // Let the controller finish its idle reset before tags are presented
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            sim,
            client,
            central,
            remote,
            extractor,
            _monitors: monitors,
            dispatcher,
            controller,
        }
    }

    /// Payload `status` of every StatusNotification, in order
    pub fn statuses(&self) -> Vec<String> {
        self.payload_field(Action::StatusNotification, "status")
    }

    pub fn firmware_statuses(&self) -> Vec<String> {
        self.payload_field(Action::FirmwareStatusNotification, "status")
    }

    fn payload_field(&self, action: Action, field: &str) -> Vec<String> {
        self.central
            .calls_for(action)
            .iter()
            .filter_map(|c| c.payload[field].as_str().map(str::to_string))
            .collect()
    }

    /// `status` of the charge point's CallResult to an injected Call
    pub fn reply_status(&self, message_id: &str) -> Option<String> {
        match self.central.reply_to(message_id)? {
            OcppMessage::CallResult(result) => result.payload["status"].as_str().map(str::to_string),
            _ => None,
        }
    }

    /// Wait for the controller to return a mode switch
    pub async fn finished(&mut self) -> OperatingMode {
        (&mut self.controller).await.unwrap()
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.controller.abort();
    }
}

/// Let simulated time pass
pub async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}
