//! Vector field sweeps against simulated supplies.

mod common;

use std::time::Duration;

use common::{quiet_controllers, Rig, SUPPLY_X, SUPPLY_Y, SUPPLY_Z};
use cryo_hardware::sim::SimIps120;
use cryomag::coordinator::ReadMode;
use cryomag::CryoError;
use tokio::time::Instant;

fn close(a: [f64; 3], b: [f64; 3], tolerance: f64) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tolerance)
}

#[tokio::test(start_paused = true)]
async fn test_single_axis_sweep_commands_every_supply_in_order() {
    let rig = Rig::start(quiet_controllers()).await;

    rig.magnet.set_field_cartesian([0.1, 0.0, 0.0]).await.unwrap();

    assert_eq!(rig.commands(SUPPLY_X), ["T0.250", "J0.1000", "A1"]);
    assert_eq!(rig.commands(SUPPLY_Y), ["J0.0000", "A1"]);
    assert_eq!(rig.commands(SUPPLY_Z), ["X", "J0", "A1"]);
    let order = rig.order_of(&['T', 'J']);
    assert_eq!(order, [SUPPLY_X, SUPPLY_X, SUPPLY_Y, SUPPLY_Z]);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_field_returns_once_ramped() {
    let rig = Rig::start(quiet_controllers()).await;
    rig.magnet.set_field_cartesian([0.1, 0.0, 0.0]).await.unwrap();
    assert!(!rig.magnet.is_field_at_setpoint().await.unwrap());

    let started = Instant::now();
    rig.magnet.wait_for_field().await.unwrap();

    // 0.1 T at 0.25 T/min
    assert!(started.elapsed() >= Duration::from_secs(23));
    assert!(rig.magnet.is_field_at_setpoint().await.unwrap());
    let field = rig.magnet.get_field_cartesian().await.unwrap();
    assert!(close(field, [0.1, 0.0, 0.0], 1e-6));
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_supplies_until_resumed() {
    let rig = Rig::start(quiet_controllers()).await;
    rig.magnet.set_field_cartesian([0.1, 0.0, 0.0]).await.unwrap();

    let pause = rig.magnet.pause_handle();
    pause.pause();
    let waiter = {
        let magnet = rig.magnet.clone();
        tokio::spawn(async move { magnet.wait_for_field().await })
    };

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!waiter.is_finished());
    let activity = rig.sim.with_device(SUPPLY_X, |d: &mut SimIps120| d.activity()).unwrap();
    assert_eq!(activity, 0);
    assert!(rig.field_x() < 0.1);
    for address in [SUPPLY_X, SUPPLY_Y, SUPPLY_Z] {
        assert!(rig.commands(address).iter().any(|c| c == "A0"), "no hold on {}", address);
    }

    pause.resume();
    waiter.await.unwrap().unwrap();
    assert!((rig.field_x() - 0.1).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_spherical_setpoint_round_trips() {
    let rig = Rig::start(quiet_controllers()).await;

    rig.magnet.set_field_spherical([0.1, 90.0, 90.0]).await.unwrap();
    // the z supply must not see a rounding residue
    assert_eq!(rig.commands(SUPPLY_Z), ["X", "J0", "A1"]);
    rig.magnet.wait_for_field().await.unwrap();

    let spherical = rig.magnet.get_field_spherical().await.unwrap();
    assert!(close(spherical, [0.1, 90.0, 90.0], 1e-4), "{:?}", spherical);
    let cartesian = rig.magnet.get_field_cartesian().await.unwrap();
    assert!(close(cartesian, [0.0, 0.1, 0.0], 1e-6), "{:?}", cartesian);
}

#[tokio::test(start_paused = true)]
async fn test_cached_mode_reports_scaled_limits() {
    let rig = Rig::start(quiet_controllers()).await;
    rig.magnet.set_read_mode(ReadMode::Cached);
    rig.magnet.set_ramp_proportion(0.5).unwrap();

    let rates = rig.magnet.get_field_ramp_rates().await.unwrap();
    assert!(close(rates, [0.125, 0.0625, 0.0625], 1e-12));
    rig.sim.clear_journal();
    rig.magnet.get_field_cartesian().await.unwrap();
    assert!(rig.sim.journal().is_empty());

    assert!(matches!(
        rig.magnet.set_ramp_proportion(0.0),
        Err(CryoError::InvalidParameter(_))
    ));
    assert!(rig.magnet.set_ramp_proportion(1.5).is_err());
    assert_eq!(rig.magnet.ramp_proportion(), 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_joint_sweep_scales_slower_axes() {
    let rig = Rig::start(quiet_controllers()).await;

    rig.magnet.set_field_cartesian([0.1, 0.1, 0.0]).await.unwrap();

    // y is the slower axis at its full 0.125 T/min; x matches its duration
    assert_eq!(rig.commands(SUPPLY_X)[0], "T0.125");
    assert_eq!(rig.commands(SUPPLY_Y)[0], "T0.125");
    assert!(rig.commands(SUPPLY_Z).iter().all(|c| !c.starts_with('T')));
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_echo_is_a_protocol_error() {
    let rig = Rig::start(quiet_controllers()).await;

    rig.sim.corrupt_next_reply();
    let result = rig.magnet.set_field_x(0.05).await;

    assert!(matches!(result, Err(CryoError::ProtocolEchoMismatch { .. })), "{:?}", result);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_axis_is_rejected() {
    let rig = Rig::start(quiet_controllers()).await;
    assert!(matches!(
        rig.magnet.set_field_axis(3, 0.1).await,
        Err(CryoError::InvalidParameter(_))
    ));
    assert!(rig.sim.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_equivalent_spherical_setpoints_complete_the_wait() {
    let cases = [
        ([-0.1, 45.0, 30.0], [-0.0612, -0.0354, -0.071]),
        ([0.1, 90.0, 270.0], [0.0, -0.1, 0.0]),
        ([0.1, 270.0, -90.0], [0.0, 0.1, 0.0]),
        ([0.0, 45.0, 30.0], [0.0, 0.0, 0.0]),
    ];
    for (setpoint, expected) in cases {
        let rig = Rig::start(quiet_controllers()).await;
        rig.magnet.set_field_spherical(setpoint).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(3600), rig.magnet.wait_for_field()).await;
        assert!(matches!(waited, Ok(Ok(()))), "{:?} never reached", setpoint);

        let cartesian = rig.magnet.get_field_cartesian().await.unwrap();
        assert!(close(cartesian, expected, 1e-9), "{:?} settled at {:?}", setpoint, cartesian);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unrepresentable_cartesian_target_completes_the_wait() {
    let rig = Rig::start(quiet_controllers()).await;
    rig.magnet.set_field_cartesian([0.01234, 0.0, -0.01234]).await.unwrap();

    let waited = tokio::time::timeout(Duration::from_secs(3600), rig.magnet.wait_for_field()).await;
    assert!(matches!(waited, Ok(Ok(()))));

    // x stops at 0.1 mT resolution, z at 1 mT
    let cartesian = rig.magnet.get_field_cartesian().await.unwrap();
    assert!(close(cartesian, [0.0123, 0.0, -0.012], 1e-9), "{:?}", cartesian);
}
