//! Insert procedures on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{quiet_controllers, Rig, ITC_POT, ITC_SORB, VALVE};
use cryo_hardware::sim::{SimItc503, TemperatureModel};
use cryomag::coordinator::{CoordinatorState, DeviationMode};
use cryomag::CryoError;
use parking_lot::Mutex;

/// Pot controller with the given low-range model and the high-range sensor
/// fixed.
fn pot_with_low(model: TemperatureModel, high: f64) -> SimItc503 {
    SimItc503::new([0.0, high, 0.0]).with_sensor(1, model)
}

fn with_pot(pot: SimItc503) -> [SimItc503; 3] {
    let [sorb, _, plates] = quiet_controllers();
    [sorb, pot, plates]
}

#[tokio::test(start_paused = true)]
async fn test_set_temp_below_cutoff_uses_low_range() {
    let rig = Rig::start(quiet_controllers()).await;

    rig.magnet.set_temp(0.5).await.unwrap();

    assert_eq!(rig.commands(VALVE), ["S10"]);
    assert_eq!(rig.commands(ITC_SORB), ["A0", "H2", "M40", "T20.0", "A1"]);
    assert_eq!(rig.commands(ITC_POT), ["T0.5", "P0.050", "I0.5", "D0.0"]);
}

#[tokio::test(start_paused = true)]
async fn test_set_temp_above_cutoff_uses_high_range() {
    let rig = Rig::start(quiet_controllers()).await;

    rig.magnet.set_temp(4.0).await.unwrap();

    assert!(rig.commands(VALVE).is_empty());
    // heat switch off on its own channel, then the high-range pot heater
    assert_eq!(rig.commands(ITC_SORB), ["A0", "H2", "M40", "A0", "O0.000000", "T0.0"]);
    assert_eq!(rig.commands(ITC_POT), ["A0", "H2", "T4.0", "P2.000", "I1.0", "D0.0", "A1"]);
}

#[tokio::test(start_paused = true)]
async fn test_set_temp_zero_loads_pid_and_leaves_pot_heater_off() {
    let rig = Rig::start(quiet_controllers()).await;

    rig.magnet.set_temp(0.0).await.unwrap();

    // PID from the first low-range row, then manual at zero output and setpoint
    assert_eq!(
        rig.commands(ITC_POT),
        ["P0.050", "I0.5", "D0.0", "A0", "O0.000000", "T0.0"]
    );
    let pot = rig.sim.with_device(ITC_POT, |d: &mut SimItc503| (d.setpoint, d.heater_output)).unwrap();
    assert_eq!(pot, (0.0, 0.0));
}

#[tokio::test(start_paused = true)]
async fn test_run_to_temperature_settles() {
    let pot = pot_with_low(TemperatureModel::FollowsSetpoint { value: 1.0, tau: 30.0 }, 1.0);
    let rig = Rig::start(with_pot(pot)).await;

    let report = rig.magnet.run_to_temperature(0.5).await.unwrap();

    assert!(report.is_settled(), "{:?}", report);
    let t = rig.magnet.he3_temperature().await.unwrap();
    assert!((t - 0.5).abs() < 0.002, "{}", t);
    assert_eq!(rig.magnet.state(), CoordinatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_run_to_temperature_records_timeout() {
    let pot = pot_with_low(TemperatureModel::Fixed(0.7), 0.7);
    let rig = Rig::start(with_pot(pot)).await;

    let report = rig.magnet.run_to_temperature(0.5).await.unwrap();

    assert_eq!(report.timed_out().len(), 1);
    assert_eq!(report.timed_out()[0].wait, "temperature stability");
    assert!(report.timed_out()[0].elapsed >= Duration::from_secs(7200));
    match report.require_settled() {
        Err(CryoError::TimeoutExceeded { operation, .. }) => {
            assert_eq!(operation, "temperature stability")
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_warm_pot_recondenses_before_regulating() {
    let pot = pot_with_low(TemperatureModel::Fixed(3.0), 3.0);
    let rig = Rig::start(with_pot(pot)).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let watcher = {
        let seen = seen.clone();
        let mut rx = rig.magnet.subscribe_state();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                seen.lock().push(state);
            }
        })
    };

    let report = rig.magnet.set_temperature(0.5).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    watcher.abort();

    // the pot never gets cold, so only the final regulation times out
    assert_eq!(report.timed_out().len(), 1);
    assert_eq!(report.timed_out()[0].wait, "temperature stability");

    let seen = seen.lock().clone();
    let expected = [
        CoordinatorState::Precondense,
        CoordinatorState::Condense,
        CoordinatorState::RunToTemperature,
        CoordinatorState::Idle,
    ];
    let mut rest = seen.iter();
    for state in expected {
        assert!(rest.any(|s| *s == state), "{:?} missing from {:?}", state, seen);
    }
    assert_eq!(seen.last(), Some(&CoordinatorState::Idle));
    assert!(!seen.contains(&CoordinatorState::Cooldown));

    // V1 pumped during precondense, dumped at the end of condense
    let valve = rig.commands(VALVE);
    assert_eq!(valve.first().map(String::as_str), Some("S11"));
    assert!(valve.iter().filter(|c| *c == "S11").count() >= 2);
    assert_eq!(valve.last().map(String::as_str), Some("S10"));

    // the sorb sweep ends at its condense setpoint
    assert!(rig.commands(ITC_SORB).iter().any(|c| c == "T28.0"));
    assert!(rig.commands(ITC_SORB).iter().any(|c| c == "T32.0"));
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_waits_for_cooling_onset() {
    // over range on the low sensor; the high sensor holds at 4.5 K for ten
    // minutes, then falls
    let profile = |t: f64| {
        if t < 600.0 {
            4.5
        } else {
            (4.5 - 0.001 * (t - 600.0)).max(0.3)
        }
    };
    let pot = SimItc503::new([10.0, 0.0, 0.0]).with_sensor(2, TemperatureModel::Profile(Box::new(profile)));
    let rig = Rig::start(with_pot(pot)).await;

    let started = tokio::time::Instant::now();
    let report = rig.magnet.cooldown().await.unwrap();

    assert!(report.is_settled(), "{:?}", report);
    assert!(started.elapsed() >= Duration::from_secs(500));
    assert_eq!(rig.commands(VALVE), ["S11", "S11", "S10"]);
    let sorb = rig.sim.with_device(ITC_SORB, |d: &mut SimItc503| d.setpoint).unwrap();
    assert_eq!(sorb, 32.0);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_onset_timeout_is_reported() {
    let pot = SimItc503::new([10.0, 4.5, 0.0]);
    let rig = Rig::start(with_pot(pot)).await;

    let report = rig.magnet.cooldown().await.unwrap();

    assert_eq!(report.timed_out().len(), 1);
    assert_eq!(report.timed_out()[0].wait, "cooling onset");
    assert!(report.require_settled().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_stable_temperature() {
    let rig = Rig::start(quiet_controllers()).await;
    let report = rig
        .magnet
        .wait_for_stable_temperature(
            0.5,
            0.01,
            DeviationMode::Absolute,
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
        .await
        .unwrap();
    assert!(report.is_settled());

    let pot = pot_with_low(TemperatureModel::Fixed(0.6), 0.6);
    let rig = Rig::start(with_pot(pot)).await;
    let report = rig
        .magnet
        .wait_for_stable_temperature(
            0.5,
            2.0,
            DeviationMode::Percent,
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
        .await
        .unwrap();
    assert_eq!(report.timed_out()[0].wait, "stable temperature");
}

#[tokio::test(start_paused = true)]
async fn test_condense_sweeps_sorb_from_its_measured_temperature() {
    // sorb already above the configured 20 K sweep start
    let [_, pot, plates] = quiet_controllers();
    let sorb = SimItc503::new([25.0, 5.0, 3.9]);
    let rig = Rig::start([sorb, pot, plates]).await;

    rig.magnet.condense().await.unwrap();

    let setpoints: Vec<f64> = rig
        .commands(ITC_SORB)
        .iter()
        .filter_map(|c| c.strip_prefix('T'))
        .filter_map(|t| t.parse().ok())
        .collect();
    let start = setpoints.iter().position(|t| *t == 20.0).unwrap();
    let end = start + setpoints[start..].iter().position(|t| *t == 28.0).unwrap();
    let sweep = &setpoints[start + 1..end];
    assert_eq!(sweep.first(), Some(&25.0), "{:?}", setpoints);
    assert!(sweep.iter().all(|t| *t >= 25.0), "{:?}", setpoints);
    assert!(sweep.windows(2).all(|w| w[0] <= w[1]), "{:?}", setpoints);
    assert_eq!(setpoints[end + 1], 32.0);
}
