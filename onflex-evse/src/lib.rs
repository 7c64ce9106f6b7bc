//! # OnFlex EVSE
//!
//! Controller for a single-connector AC charging station talking OCPP 1.6J
//! to a central system.
//!
//! ## Architecture
//!
//! ```text
//! Central System
//!       │ WebSocket (ocpp1.6), JSON arrays
//!       ▼
//! ┌──────────────────────────────────────────┐
//! │ OcppClient   reconnect, boot, heartbeat  │
//! │   Mailbox    Calls FIFO, replies by id   │
//! └──────┬──────────────────────────┬────────┘
//!        │ receive_call             │ call / send
//!        ▼                          ▼
//! ┌──────────────┐  RemoteCommands ┌────────────────────┐
//! │ Dispatcher   │ ──────────────► │ ChargingController │
//! │ + firmware   │                 │ relay, PWM, cues   │
//! └──────────────┘                 └─────────┬──────────┘
//!                                            │ snapshots
//!                                  ┌─────────┴──────────┐
//!                                  │ CP / meter monitors│
//!                                  └────────────────────┘
//! ```
//!
//! [`Station`] supervises the operating modes: charging mode runs everything
//! above; calibration and manufacturer modes are entered with privileged id
//! tags and delegated to a [`ServiceMode`].
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use onflex_evse::{IdTagLists, SevenZipCommand, SimHardware, Station, StationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StationConfig::load("config/onflex.json")?;
//!     let id_tags = IdTagLists::load_or_default("config/id_tags.json");
//!     let hardware = SimHardware::new().hardware();
//!
//!     let station = Station::new(config, id_tags, hardware, Arc::new(SevenZipCommand::default()));
//!     station.run().await;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod firmware;
pub mod hal;
pub mod monitor;
pub mod ocpp;
pub mod session;
pub mod sim;
pub mod station;

pub use config::{IdTagLists, StationConfig, TagClass, Timings};
pub use dispatcher::{Dispatcher, RemoteCommands};
pub use error::{ChargerError, ErrorKind};
pub use firmware::{ArchiveExtractor, FirmwareUpdater, SevenZipCommand};
pub use hal::Hardware;
pub use monitor::Monitors;
pub use ocpp::{BootPolicy, OcppClient, OcppClientConfig};
pub use session::ChargingController;
pub use sim::{CentralSystemSim, SimHardware};
pub use station::{OperatingMode, ServiceMode, Station, TagGatedServiceMode, Transport};
