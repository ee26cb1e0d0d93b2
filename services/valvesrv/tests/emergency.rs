//! Emergency handling end to end: entry, automatic close, lockout and reset

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use common::{next_of_kind, test_config, viewer, wait_until, Harness};
use valvesrv::link::{CommandOutcome, RejectReason, SUPERVISOR_ISSUER};
use valvesrv::protocol::{CommandVerb, ValvePosition};
use valvesrv::safety::{AlertKind, EmergencyCause, SafetyMode, ViolationKind};
use valvesrv::simulator::Reading;

#[tokio::test]
async fn test_overpressure_flood_raises_one_alert_and_closes_once() {
    let h = Harness::start(test_config()).await;
    let mut rx = viewer(&h.service, 1024);

    h.emit_sample().await;
    let result = h.service.submit_command(CommandVerb::ForceOpen, "operator").await.unwrap();
    assert!(result.outcome.is_ack());
    assert_eq!(h.service.current_state().valve, ValvePosition::Open);

    h.device.hold(Reading::new(7.2, 6.8, 150.0, 120.0));
    for _ in 0..20 {
        h.emit_sample().await;
    }
    wait_until(|| h.service.current_state().valve == ValvePosition::Closed).await;

    let state = h.service.current_state();
    match &state.safety {
        SafetyMode::Emergency { cause: EmergencyCause::Violations { kinds }, .. } => {
            assert_eq!(kinds, &vec![ViolationKind::Overpressure]);
        },
        other => panic!("expected violation emergency, got {:?}", other),
    }

    let stats = h.service.stats().supervisor;
    assert_eq!(stats.emergencies, 1);
    assert_eq!(stats.internal_closes, 1);
    assert_eq!(stats.unsafe_samples, 20);

    wait_until(|| h.recorder.commands().iter().any(|c| c.issuer == SUPERVISOR_ISSUER)).await;
    let violation_alerts = h
        .recorder
        .alerts()
        .iter()
        .filter(|a| a.kind == AlertKind::SafetyViolation)
        .count();
    assert_eq!(violation_alerts, 1);

    let alert = next_of_kind(&mut rx, "alert").await;
    // the force-open alert comes first
    assert_eq!(alert["data"]["kind"], "FORCE_OPEN");
    let alert = next_of_kind(&mut rx, "alert").await;
    assert_eq!(alert["data"]["kind"], "SAFETY_VIOLATION");
    assert_eq!(alert["data"]["priority"], "CRITICAL");

    h.stop().await;
}

#[tokio::test]
async fn test_emergency_blocks_open_until_a_clean_reset() {
    let h = Harness::start(test_config()).await;

    h.device.hold(Reading::new(2.0, 2.0, 620.0, 100.0));
    h.emit_sample().await;
    assert!(h.service.current_state().emergency());

    let result = h.service.submit_command(CommandVerb::Open, "operator").await.unwrap();
    assert_eq!(result.outcome, CommandOutcome::Rejected(RejectReason::Emergency));

    // still unsafe: refused without reaching the device
    let result = h
        .service
        .submit_command(CommandVerb::ResetEmergency, "operator")
        .await
        .unwrap();
    assert_eq!(
        result.outcome,
        CommandOutcome::Rejected(RejectReason::StillUnsafe(vec![ViolationKind::CriticalConcentration]))
    );
    assert!(h.service.current_state().emergency());

    h.device.release();
    h.emit_sample().await;
    assert!(h.service.current_state().emergency(), "clean samples never clear emergency");

    let sent_before = h.service.stats().link.commands_sent;
    let result = h
        .service
        .submit_command(CommandVerb::ResetEmergency, "operator")
        .await
        .unwrap();
    assert!(result.outcome.is_ack(), "{:?}", result.outcome);
    assert_eq!(h.service.stats().link.commands_sent, sent_before + 1);
    assert_eq!(h.service.current_state().safety, SafetyMode::Normal);

    let result = h.service.submit_command(CommandVerb::Open, "operator").await.unwrap();
    assert_eq!(result.outcome, CommandOutcome::Ack("VALVE_OPENED".to_string()));

    h.stop().await;
}

#[tokio::test]
async fn test_device_event_enters_emergency() {
    let h = Harness::start(test_config()).await;
    let mut rx = viewer(&h.service, 256);

    h.device.send_raw("EVENT: CRITICAL_CONCENTRATION - emergency mode triggered.");
    wait_until(|| h.service.current_state().emergency()).await;

    assert!(matches!(
        h.service.current_state().safety,
        SafetyMode::Emergency {
            cause: EmergencyCause::DeviceEvent { .. },
            ..
        }
    ));
    let alert = next_of_kind(&mut rx, "alert").await;
    assert_eq!(alert["data"]["kind"], "DEVICE_EMERGENCY");

    let log = next_of_kind(&mut rx, "log").await;
    assert_eq!(log["data"]["level"], "warning");

    h.stop().await;
}

/// Emergency latched by a concentration spike, readings back to normal,
/// device no longer answering commands
async fn latched_then_clean(h: &Harness) {
    h.device.hold(Reading::new(2.0, 2.0, 620.0, 100.0));
    h.emit_sample().await;
    assert!(h.service.current_state().emergency());
    h.device.release();
    h.emit_sample().await;
    h.device.mute(true);
}

async fn once_reset_is_on_the_wire(h: &Harness, sent_before: u64) {
    wait_until(|| h.service.stats().link.commands_sent > sent_before).await;
}

#[tokio::test]
async fn test_emergency_announcement_during_reset_keeps_emergency() {
    let h = Harness::start(test_config()).await;
    latched_then_clean(&h).await;
    let mut rx = viewer(&h.service, 256);
    let sent_before = h.service.stats().link.commands_sent;

    let announcement = "EVENT: OVER_PRESSURE - emergency mode triggered.";
    let (result, _) = tokio::join!(
        h.service.submit_command(CommandVerb::ResetEmergency, "operator"),
        async {
            once_reset_is_on_the_wire(&h, sent_before).await;
            h.device.send_raw(announcement);
        }
    );

    assert_eq!(result.unwrap().outcome, CommandOutcome::Timeout);
    assert!(h.service.current_state().emergency());
    assert_eq!(h.service.stats().supervisor.emergencies, 1);

    // forwarded as a device event rather than swallowed as the reply
    loop {
        let log = next_of_kind(&mut rx, "log").await;
        if log["data"]["message"] == announcement {
            assert_eq!(log["data"]["level"], "warning");
            break;
        }
    }

    h.stop().await;
}

#[tokio::test]
async fn test_reset_ack_after_fresh_violation_is_refused() {
    let h = Harness::start(test_config()).await;
    latched_then_clean(&h).await;
    let sent_before = h.service.stats().link.commands_sent;

    let (result, _) = tokio::join!(
        h.service.submit_command(CommandVerb::ResetEmergency, "operator"),
        async {
            once_reset_is_on_the_wire(&h, sent_before).await;
            // gate passed on the clean sample; pressure spikes before the ack lands
            h.device.hold(Reading::new(7.0, 2.0, 150.0, 120.0));
            h.emit_sample().await;
            h.device.send_raw("EVENT: Emergency mode reset successfully.");
        }
    );

    assert_eq!(
        result.unwrap().outcome,
        CommandOutcome::Rejected(RejectReason::StillUnsafe(vec![ViolationKind::Overpressure]))
    );
    assert!(h.service.current_state().emergency());
    assert_eq!(h.service.stats().supervisor.emergencies, 1);

    h.stop().await;
}
