//! Charging session scenarios against simulated hardware and a simulated
//! central system, on a paused clock.

mod common;

use common::{settle, Rig};
use onflex_evse::hal::{AudioCue, Cue, CpState, DisplayAction, RelayState};
use onflex_evse::ocpp::{Action, AuthorizationStatus};
use onflex_evse::sim::Behaviour;
use onflex_evse::{IdTagLists, OperatingMode};
use serde_json::json;

/// Plug in, authorize `tag`, vehicle ready: ends with the relay closed
async fn start_charging(rig: &Rig, tag: &str) {
    rig.sim.set_cp(CpState::B);
    settle(2).await;
    rig.sim.present_tag(tag);
    settle(2).await;
    rig.sim.set_cp(CpState::C);
    settle(2).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_accepted_session_start_to_stop() {
    let rig = Rig::start(Behaviour {
        transaction_id: 42,
        ..Default::default()
    })
    .await;
    rig.sim.set_energy_wh(10_000);

    rig.sim.set_cp(CpState::B);
    settle(2).await;
    rig.sim.present_tag("04A1B2C3");
    settle(2).await;

    assert_eq!(rig.central.calls_for(Action::Authorize).len(), 1);
    assert_eq!(rig.sim.current_limits(), vec![32.0]);
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));
    assert_eq!(rig.sim.cue_count(AudioCue::ChargingWaiting), 1);

    rig.sim.set_cp(CpState::C);
    settle(2).await;

    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));
    let starts = rig.central.calls_for(Action::StartTransaction);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].payload["connectorId"], 1);
    assert_eq!(starts[0].payload["idTag"], "04A1B2C3");
    assert_eq!(starts[0].payload["meterStart"], 10_000);

    let transfers = rig.central.calls_for(Action::DataTransfer);
    let message_ids: Vec<_> = transfers.iter().map(|c| c.payload["messageId"].clone()).collect();
    assert_eq!(message_ids, vec![json!("MaximumCharge"), json!("GetPrice")]);
    assert!(transfers.iter().all(|c| c.payload["data"] == json!(42)));
    assert!(rig.sim.cues().contains(&Cue::Display(DisplayAction::Charging {
        start_meter_wh: 10_000,
        unit_price: 0.35,
    })));
    assert_eq!(rig.sim.cue_count(AudioCue::ChargingStarted), 1);

    rig.sim.set_energy_wh(12_500);
    settle(2).await;
    rig.sim.set_cp(CpState::B);
    settle(2).await;

    let stops = rig.central.calls_for(Action::StopTransaction);
    assert_eq!(stops.len(), 1);
    let stop = &stops[0].payload;
    assert_eq!(stop["transactionId"], 42);
    assert_eq!(stop["meterStop"], 12_500);
    assert_eq!(stop["idTag"], "04A1B2C3");
    assert_eq!(stop["reason"], "Local");
    assert_eq!(stop["transactionData"][0]["sampledValue"][0]["value"], "2500");

    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));
    assert_eq!(rig.sim.duty_cycle(), Some(3.0));
    assert_eq!(rig.sim.cue_count(AudioCue::ChargingStopped), 1);
    assert_eq!(rig.statuses(), vec!["Available", "Preparing", "Charging", "Finishing"]);

    // Unplugging ends the session and starts the next idle phase
    rig.sim.set_cp(CpState::A);
    settle(2).await;

    assert_eq!(rig.sim.duty_cycle(), Some(100.0));
    assert_eq!(rig.sim.cue_count(AudioCue::EvDisconnected), 1);
    assert_eq!(
        rig.statuses(),
        vec!["Available", "Preparing", "Charging", "Finishing", "Available"]
    );
    assert!(rig.central.calls_for(Action::MeterValues).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_relay_failsafe_closes_relay_after_stop() {
    let rig = Rig::start(Behaviour::default()).await;
    start_charging(&rig, "TAG-1").await;

    rig.sim.set_cp(CpState::A);
    settle(2).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));

    settle(600).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_vehicle_never_ready_times_out() {
    let rig = Rig::start(Behaviour::default()).await;

    rig.sim.set_cp(CpState::B);
    settle(2).await;
    rig.sim.present_tag("TAG-1");
    settle(35).await;

    assert_eq!(rig.sim.cue_count(AudioCue::AuthorityTimeout), 1);
    assert!(rig.central.calls_for(Action::StartTransaction).is_empty());
    assert!(!rig.sim.relay_history().contains(&RelayState::Closed));
    assert_eq!(rig.sim.duty_cycle(), Some(100.0));

    // Still plugged in: the next iteration does not report it again
    settle(30).await;
    assert_eq!(rig.sim.cue_count(AudioCue::AuthorityTimeout), 1);
    assert_eq!(rig.statuses(), vec!["Available", "Preparing"]);
}

#[tokio::test(start_paused = true)]
async fn test_authorization_failures_are_cued() {
    let rig = Rig::start(Behaviour {
        authorize: AuthorizationStatus::Blocked,
        ..Default::default()
    })
    .await;

    rig.sim.present_tag("BLOCKED");
    settle(1).await;
    assert_eq!(rig.sim.cue_count(AudioCue::InsufficientFunds), 1);

    rig.central.set_behaviour(|b| b.authorize = AuthorizationStatus::Invalid);
    rig.sim.present_tag("UNKNOWN");
    settle(1).await;
    assert_eq!(rig.sim.cue_count(AudioCue::InvalidCard), 1);

    rig.central.set_behaviour(|b| b.online = false);
    rig.sim.present_tag("OFFLINE-1");
    rig.sim.present_tag("OFFLINE-2");
    settle(10).await;
    assert_eq!(rig.sim.cue_count(AudioCue::ServerUnreachable), 1);

    // The second tag arrived while the first authorization was in flight
    let tags: Vec<_> = rig
        .central
        .calls_for(Action::Authorize)
        .iter()
        .map(|c| c.payload["idTag"].clone())
        .collect();
    assert_eq!(tags, vec![json!("BLOCKED"), json!("UNKNOWN"), json!("OFFLINE-1")]);
    assert!(rig.central.calls_for(Action::StartTransaction).is_empty());
    assert_eq!(rig.sim.cue_count(AudioCue::ChargingWaiting), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_start_skips_authorize() {
    let rig = Rig::start(Behaviour::default()).await;

    let first = rig
        .central
        .inject_call(Action::RemoteStartTransaction, json!({ "idTag": "REMOTE-1" }));
    settle(1).await;
    assert_eq!(rig.reply_status(&first).as_deref(), Some("Accepted"));

    let second = rig
        .central
        .inject_call(Action::RemoteStartTransaction, json!({ "idTag": "REMOTE-2" }));
    settle(1).await;
    assert_eq!(rig.reply_status(&second).as_deref(), Some("Rejected"));

    rig.sim.set_cp(CpState::B);
    settle(2).await;
    rig.sim.set_cp(CpState::C);
    settle(2).await;

    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));
    assert!(rig.central.calls_for(Action::Authorize).is_empty());
    let starts = rig.central.calls_for(Action::StartTransaction);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].payload["idTag"], "REMOTE-1");
}

#[tokio::test(start_paused = true)]
async fn test_remote_stop_and_meter_values() {
    let rig = Rig::start(Behaviour {
        transaction_id: 42,
        ..Default::default()
    })
    .await;
    rig.sim.set_energy_wh(10_000);
    start_charging(&rig, "TAG-1").await;

    rig.sim.set_energy_wh(10_800);
    settle(65).await;
    let samples = rig.central.calls_for(Action::MeterValues);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].payload["transactionId"], 42);
    assert_eq!(samples[0].payload["meterValue"][0]["sampledValue"][0]["value"], "800");

    let unknown = rig
        .central
        .inject_call(Action::RemoteStopTransaction, json!({ "transactionId": 7 }));
    settle(1).await;
    assert_eq!(rig.reply_status(&unknown).as_deref(), Some("Accepted"));
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));

    let matching = rig
        .central
        .inject_call(Action::RemoteStopTransaction, json!({ "transactionId": 42 }));
    settle(1).await;
    assert_eq!(rig.reply_status(&matching).as_deref(), Some("Accepted"));
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));

    let stops = rig.central.calls_for(Action::StopTransaction);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].payload["transactionData"][0]["sampledValue"][0]["value"], "800");
}

#[tokio::test(start_paused = true)]
async fn test_energy_cap_stops_charging() {
    let rig = Rig::start(Behaviour {
        max_charge: Some(json!("1000")),
        ..Default::default()
    })
    .await;
    start_charging(&rig, "TAG-1").await;

    rig.sim.set_energy_wh(1_000);
    settle(2).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));

    rig.sim.set_energy_wh(1_200);
    settle(2).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));

    let stops = rig.central.calls_for(Action::StopTransaction);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].payload["meterStop"], 1_200);
}

#[tokio::test(start_paused = true)]
async fn test_unusable_cap_stops_at_first_delivered_wh() {
    for max_charge in [None, Some(json!("unlimited")), Some(json!(-5))] {
        let rig = Rig::start(Behaviour {
            max_charge,
            price: None,
            ..Default::default()
        })
        .await;
        start_charging(&rig, "TAG-1").await;
        assert!(rig.sim.cues().contains(&Cue::Display(DisplayAction::Charging {
            start_meter_wh: 0,
            unit_price: 0.0,
        })));

        rig.sim.set_energy_wh(5_000_000);
        settle(2).await;
        assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));

        let stops = rig.central.calls_for(Action::StopTransaction);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].payload["meterStop"], 5_000_000);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_data_transfer_leaves_transaction_open() {
    let rig = Rig::start(Behaviour {
        answer_data_transfer: false,
        ..Default::default()
    })
    .await;
    start_charging(&rig, "TAG-1").await;

    // MaximumCharge times out after the 8s call timeout
    settle(10).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));
    assert_eq!(rig.sim.duty_cycle(), Some(100.0));
    assert_eq!(rig.central.calls_for(Action::StartTransaction).len(), 1);
    assert_eq!(rig.central.calls_for(Action::DataTransfer).len(), 1);
    assert!(rig.central.calls_for(Action::StopTransaction).is_empty());
    assert_eq!(rig.sim.cue_count(AudioCue::ChargingStarted), 0);

    // The next iteration waits for a tag again
    rig.sim.present_tag("TAG-2");
    settle(1).await;
    assert_eq!(rig.central.calls_for(Action::Authorize).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_tag_must_match_start_tag() {
    let rig = Rig::start(Behaviour::default()).await;
    start_charging(&rig, "TAG-1").await;
    settle(10).await;

    rig.sim.present_tag("TAG-2");
    settle(1).await;
    assert_eq!(rig.sim.cue_count(AudioCue::ChargingStopFailed), 1);
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));

    rig.sim.present_tag("TAG-1");
    settle(1).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));
    let stops = rig.central.calls_for(Action::StopTransaction);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].payload["idTag"], "TAG-1");
}

#[tokio::test(start_paused = true)]
async fn test_start_transaction_timeout_restores_safe_outputs() {
    let rig = Rig::start(Behaviour::default()).await;

    rig.sim.set_cp(CpState::B);
    settle(2).await;
    rig.sim.present_tag("TAG-1");
    settle(2).await;
    rig.central.set_behaviour(|b| b.online = false);
    rig.sim.set_cp(CpState::C);
    settle(2).await;

    assert_eq!(rig.sim.relay_state(), Some(RelayState::Closed));
    assert_eq!(rig.central.calls_for(Action::StartTransaction).len(), 1);

    settle(10).await;
    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));
    assert_eq!(rig.sim.duty_cycle(), Some(100.0));
    assert!(rig.central.calls_for(Action::StopTransaction).is_empty());
    assert_eq!(rig.sim.cue_count(AudioCue::ChargingStarted), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_does_not_block_stop() {
    let rig = Rig::start(Behaviour::default()).await;
    start_charging(&rig, "TAG-1").await;

    rig.central.set_behaviour(|b| b.online = false);
    rig.sim.set_cp(CpState::B);
    settle(2).await;

    assert_eq!(rig.sim.relay_state(), Some(RelayState::Open));
    assert_eq!(rig.sim.duty_cycle(), Some(3.0));
    assert_eq!(rig.central.calls_for(Action::StopTransaction).len(), 1);

    // Unanswered notifications time out without disturbing the next session
    rig.sim.set_cp(CpState::A);
    settle(10).await;
    assert_eq!(rig.sim.duty_cycle(), Some(100.0));
    assert_eq!(rig.sim.cue_count(AudioCue::EvDisconnected), 1);
}

#[tokio::test(start_paused = true)]
async fn test_privileged_tag_leaves_charging_mode() {
    let id_tags = IdTagLists {
        calibration_mode: vec!["CAL-1".into()],
        manufacturer_mode: vec!["MFG-1".into()],
    };
    let mut rig = Rig::start_with_tags(Behaviour::default(), id_tags).await;

    rig.sim.present_tag("CAL-1");
    assert_eq!(rig.finished().await, OperatingMode::Calibration);
    assert!(rig.central.calls_for(Action::Authorize).is_empty());
}
