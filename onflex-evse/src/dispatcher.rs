//! Inbound call dispatcher
//!
//! Answers Calls initiated by the central system, oldest first:
//!
//! | Action | Reply | Effect |
//! |--------|-------|--------|
//! | Reset | Accepted | reboot after a short delay |
//! | RemoteStartTransaction | Accepted / Rejected | at most one pending start |
//! | RemoteStopTransaction | Accepted | transaction id recorded for the controller |
//! | UpdateFirmware | `{}` | (re)starts the firmware flow |
//! | anything else | NotSupported | none |

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::firmware::FirmwareUpdater;
use crate::hal::Rebooter;
use crate::ocpp::*;

#[derive(Debug, Default)]
struct Pending {
    start: Option<String>,
    stop: Option<i64>,
}

/// Remote start/stop requests handed from the dispatcher to the session
/// controller
#[derive(Debug, Clone, Default)]
pub struct RemoteCommands {
    pending: Arc<Mutex<Pending>>,
}

impl RemoteCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a remote start; refused while another one is pending
    pub fn offer_start(&self, id_tag: impl Into<String>) -> bool {
        let mut pending = self.pending.lock();
        if pending.start.is_some() {
            return false;
        }
        pending.start = Some(id_tag.into());
        true
    }

    /// Id tag of the pending remote start, if any
    pub fn pending_start(&self) -> Option<String> {
        self.pending.lock().start.clone()
    }

    pub fn record_stop(&self, transaction_id: i64) {
        self.pending.lock().stop = Some(transaction_id);
    }

    pub fn take_stop(&self) -> Option<i64> {
        self.pending.lock().stop.take()
    }

    /// Forget both; done when a session iteration starts over
    pub fn clear(&self) {
        let mut pending = self.pending.lock();
        pending.start = None;
        pending.stop = None;
    }
}

pub struct Dispatcher {
    client: OcppClient,
    remote: RemoteCommands,
    firmware: FirmwareUpdater,
    rebooter: Arc<dyn Rebooter>,
    reboot_delay: Duration,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(
        client: OcppClient,
        remote: RemoteCommands,
        firmware: FirmwareUpdater,
        rebooter: Arc<dyn Rebooter>,
        reboot_delay: Duration,
    ) -> Self {
        Self {
            client,
            remote,
            firmware,
            rebooter,
            reboot_delay,
            tasks: JoinSet::new(),
        }
    }

    /// Serve central system Calls until cancelled. Dropping the dispatcher
    /// also cancels a running firmware update.
    pub async fn run(mut self) {
        loop {
            let call = self.client.receive_call().await;
            let message_id = call.message_id.clone();
            debug!("Dispatching {} ({})", call.action, message_id);

            if let Err(e) = self.handle(call).await {
                warn!("Failed to handle call {}: {}", message_id, e);
                let error = CallError::new(message_id, ErrorCode::FormationViolation, e.to_string());
                if let Err(e) = self.client.respond_error(error) {
                    error!("Failed to send CallError: {}", e);
                }
            }

            while self.tasks.try_join_next().is_some() {}
        }
    }

    async fn handle(&mut self, call: Call) -> Result<(), OcppError> {
        match &call.action {
            Action::Reset => {
                let request: ResetRequest = call.parse_payload()?;
                info!("{:?} reset requested", request.reset_type);
                self.client
                    .respond(CallResult::status(&call.message_id, ResponseStatus::Accepted)?)?;

                tokio::time::sleep(self.reboot_delay).await;
                if let Err(e) = self.rebooter.reboot() {
                    error!("Reboot failed: {}", e);
                }
            }

            Action::RemoteStartTransaction => {
                let request: RemoteStartTransactionRequest = call.parse_payload()?;
                let status = if self.remote.offer_start(request.id_tag.clone()) {
                    info!("Remote start accepted for {}", request.id_tag);
                    ResponseStatus::Accepted
                } else {
                    info!("Remote start rejected, another one is pending");
                    ResponseStatus::Rejected
                };
                self.client.respond(CallResult::status(&call.message_id, status)?)?;
            }

            Action::RemoteStopTransaction => {
                let request: RemoteStopTransactionRequest = call.parse_payload()?;
                info!("Remote stop requested for transaction {}", request.transaction_id);
                self.remote.record_stop(request.transaction_id);
                self.client
                    .respond(CallResult::status(&call.message_id, ResponseStatus::Accepted)?)?;
            }

            Action::UpdateFirmware => {
                let request: UpdateFirmwareRequest = call.parse_payload()?;
                self.client.respond(CallResult::empty(&call.message_id))?;

                if !self.tasks.is_empty() {
                    info!("Cancelling running firmware update");
                }
                self.tasks.abort_all();

                let firmware = self.firmware.clone();
                self.tasks
                    .spawn(async move { firmware.run(&request.location).await });
            }

            other => {
                debug!("{} not supported", other);
                self.client
                    .respond(CallResult::status(&call.message_id, ResponseStatus::NotSupported)?)?;
            }
        }

        Ok(())
    }
}
