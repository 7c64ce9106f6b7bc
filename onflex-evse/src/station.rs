//! Operating-mode supervisor
//!
//! The station runs exactly one mode at a time. Charging mode owns the OCPP
//! client, the dispatcher and the session controller; the service modes
//! (calibration, manufacturer test) are delegated to a [`ServiceMode`]. A
//! mode's scope is fully torn down, outputs made safe, before the next one
//! starts.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{IdTagLists, StationConfig, TagClass};
use crate::dispatcher::{Dispatcher, RemoteCommands};
use crate::firmware::{ArchiveExtractor, FirmwareUpdater};
use crate::hal::{Hardware, SafeOutputs};
use crate::monitor::{CpMonitor, MeterMonitor, Monitors};
use crate::ocpp::OcppClient;
use crate::session::ChargingController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Charging,
    Calibration,
    Manufacturer,
}

/// How the OCPP client reaches the central system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Reconnecting WebSocket to the configured endpoint
    #[default]
    WebSocket,
    /// Somebody else drives [`OcppClient::loopback`]
    Loopback,
}

/// Calibration / manufacturer mode collaborator
pub trait ServiceMode: Send + Sync {
    /// Run `mode` until another mode is selected, and return that mode
    fn run<'a>(
        &'a self,
        mode: OperatingMode,
        hardware: &'a Hardware,
        id_tags: &'a IdTagLists,
    ) -> BoxFuture<'a, OperatingMode>;
}

/// Keeps outputs safe and waits for a tag selecting another mode
#[derive(Debug, Clone)]
pub struct TagGatedServiceMode {
    poll: Duration,
}

impl Default for TagGatedServiceMode {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(500),
        }
    }
}

impl ServiceMode for TagGatedServiceMode {
    fn run<'a>(
        &'a self,
        mode: OperatingMode,
        hardware: &'a Hardware,
        id_tags: &'a IdTagLists,
    ) -> BoxFuture<'a, OperatingMode> {
        async move {
            if let Err(e) = hardware.restore_safe().await {
                error!("Failed to make outputs safe: {}", e);
            }
            hardware.id_tags.clear();

            loop {
                if let Some(tag) = hardware.id_tags.receive() {
                    let next = match id_tags.classify(&tag) {
                        TagClass::Manufacturer => OperatingMode::Manufacturer,
                        TagClass::Calibration => OperatingMode::Calibration,
                        TagClass::User => OperatingMode::Charging,
                    };
                    if next != mode {
                        return next;
                    }
                    info!("Already in {:?} mode", mode);
                }
                tokio::time::sleep(self.poll).await;
            }
        }
        .boxed()
    }
}

pub struct Station {
    config: StationConfig,
    id_tags: IdTagLists,
    hardware: Hardware,
    extractor: Arc<dyn ArchiveExtractor>,
    service: Box<dyn ServiceMode>,
    transport: Transport,
    client: OcppClient,
}

impl Station {
    pub fn new(
        config: StationConfig,
        id_tags: IdTagLists,
        hardware: Hardware,
        extractor: Arc<dyn ArchiveExtractor>,
    ) -> Self {
        let client = OcppClient::new(config.client_config());
        Self {
            config,
            id_tags,
            hardware,
            extractor,
            service: Box::new(TagGatedServiceMode::default()),
            transport: Transport::default(),
            client,
        }
    }

    pub fn with_service_mode(mut self, service: Box<dyn ServiceMode>) -> Self {
        self.service = service;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn client(&self) -> &OcppClient {
        &self.client
    }

    /// Run the mode loop forever; cancel by dropping the future
    pub async fn run(&self) {
        info!("Station starting");
        let monitors = Monitors::spawn(&self.hardware, &self.config.timings);
        let mut mode = OperatingMode::Charging;

        loop {
            info!("Entering {:?} mode", mode);
            mode = match mode {
                OperatingMode::Charging => {
                    self.run_charging(monitors.cp.clone(), monitors.meter.clone()).await
                }
                service => {
                    let _safe = SafeOutputs::new(self.hardware.clone());
                    self.service.run(service, &self.hardware, &self.id_tags).await
                }
            };
        }
    }

    async fn run_charging(&self, cp: CpMonitor, meter: MeterMonitor) -> OperatingMode {
        let _safe = SafeOutputs::new(self.hardware.clone());
        let timings = &self.config.timings;
        let remote = RemoteCommands::new();

        if self.transport == Transport::WebSocket {
            self.client.start();
        }

        let firmware = FirmwareUpdater::new(
            self.client.clone(),
            self.config.firmware.clone(),
            self.extractor.clone(),
            self.hardware.rebooter.clone(),
            timings.reboot_delay,
        );
        let dispatcher = Dispatcher::new(
            self.client.clone(),
            remote.clone(),
            firmware,
            self.hardware.rebooter.clone(),
            timings.reboot_delay,
        );
        let mut tasks = JoinSet::new();
        tasks.spawn(dispatcher.run());

        let mut controller = ChargingController::new(
            self.client.clone(),
            self.hardware.clone(),
            cp,
            meter,
            remote,
            self.id_tags.clone(),
            timings.clone(),
        );
        let next = controller.run().await;

        drop(controller);
        tasks.shutdown().await;
        if self.transport == Transport::WebSocket {
            self.client.stop().await;
        }

        next
    }
}
