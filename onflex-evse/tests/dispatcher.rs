//! Central system initiated calls, end to end through the dispatcher.

mod common;

use common::{settle, Rig};
use onflex_evse::ocpp::{Action, ErrorCode, OcppMessage};
use onflex_evse::sim::Behaviour;
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_unknown_action_is_not_supported() {
    let rig = Rig::start(Behaviour::default()).await;

    let id = rig
        .central
        .inject_call(Action::from("ChangeAvailability"), json!({ "connectorId": 1, "type": "Inoperative" }));
    let custom = rig.central.inject_call(Action::from("SetChargingProfile"), json!({}));
    settle(1).await;

    assert_eq!(rig.reply_status(&id).as_deref(), Some("NotSupported"));
    assert_eq!(rig.reply_status(&custom).as_deref(), Some("NotSupported"));
}

#[tokio::test(start_paused = true)]
async fn test_reset_reboots_after_delay() {
    let rig = Rig::start(Behaviour::default()).await;

    let id = rig.central.inject_call(Action::Reset, json!({ "type": "Hard" }));
    settle(1).await;
    assert_eq!(rig.reply_status(&id).as_deref(), Some("Accepted"));
    assert_eq!(rig.sim.reboots(), 0);

    settle(4).await;
    assert_eq!(rig.sim.reboots(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_gets_call_error() {
    let rig = Rig::start(Behaviour::default()).await;

    let id = rig.central.inject_call(Action::Reset, json!({ "type": "Sideways" }));
    settle(1).await;

    assert!(matches!(
        rig.central.reply_to(&id),
        Some(OcppMessage::CallError(e)) if e.error_code == ErrorCode::FormationViolation
    ));
    assert_eq!(rig.sim.reboots(), 0);

    // The dispatcher keeps serving after a bad call
    let next = rig.central.inject_call(Action::RemoteStartTransaction, json!({ "idTag": "REMOTE-1" }));
    settle(1).await;
    assert_eq!(rig.reply_status(&next).as_deref(), Some("Accepted"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_firmware_download_still_reboots() {
    let rig = Rig::start(Behaviour::default()).await;

    let id = rig.central.inject_call(
        Action::UpdateFirmware,
        json!({ "location": "not a url", "retrieveDate": "2024-05-01T12:00:00.000Z" }),
    );
    settle(10).await;

    match rig.central.reply_to(&id) {
        Some(OcppMessage::CallResult(result)) => assert_eq!(result.payload, json!({})),
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(
        rig.firmware_statuses(),
        vec!["Downloading", "DownloadFailed", "Installing", "InstallationFailed"]
    );
    assert!(rig.extractor.extracted.lock().is_empty());
    assert_eq!(rig.sim.reboots(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_start_stays_pending_for_the_session() {
    let rig = Rig::start(Behaviour::default()).await;

    let id = rig.central.inject_call(Action::RemoteStartTransaction, json!({ "connectorId": 1, "idTag": "REMOTE-1" }));
    settle(1).await;

    assert_eq!(rig.reply_status(&id).as_deref(), Some("Accepted"));
    assert_eq!(rig.remote.pending_start().as_deref(), Some("REMOTE-1"));
}
