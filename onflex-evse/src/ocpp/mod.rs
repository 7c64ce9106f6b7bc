//! OCPP 1.6 protocol engine
//!
//! - `types`: payloads of the actions this charge point exchanges
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `mailbox`: received messages waiting for a consumer
//! - `client`: reconnecting WebSocket client with request correlation

pub mod types;
pub mod messages;
pub mod mailbox;
pub mod client;

pub use types::*;
pub use messages::*;
pub use mailbox::Mailbox;
pub use client::{BootPolicy, Loopback, OcppClient, OcppClientConfig, OCPP_SUBPROTOCOL};
