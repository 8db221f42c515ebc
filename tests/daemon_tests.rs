//! Daemon control loop tests driven through an in-memory GPU

mod common;

use std::time::Duration;

use common::{Call, MockGpu, policy, profile, secs};
use gpu_undervolt::{
    daemon::{Daemon, DaemonState, TickOutcome},
    errors::UndervoltError,
    policy_config::ProfileConfig,
};
use tokio_util::sync::CancellationToken;

fn offsets_profile() -> ProfileConfig {
    ProfileConfig {
        use_offsets: Some(true),
        display: Some(":0".to_string()),
        core_offset: Some(100),
        memory_offset: Some(500),
        on_hold: Some(0.0),
        ..profile()
    }
}

async fn tick_n(daemon: &mut Daemon, n: usize) {
    let token = CancellationToken::new();

    for _ in 0..n {
        assert_eq!(daemon.tick(&token).await, TickOutcome::Continue);
    }
}

#[tokio::test]
async fn enables_once_load_is_held_long_enough() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(policy(profile()), gpu.boxed());

    // 3 ticks of 0.5s are below the 2s on-hold
    tick_n(&mut daemon, 3).await;
    assert!(!daemon.state().enabled);
    assert!(gpu.calls().is_empty());

    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);
    assert_eq!(gpu.calls(), vec![Call::LockClocks(210, 1860)]);

    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);
    assert_eq!(gpu.calls().len(), 1);
}

#[tokio::test]
async fn idle_sample_resets_the_load_streak() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(policy(profile()), gpu.boxed());

    tick_n(&mut daemon, 3).await;
    gpu.set_clock(1000);
    tick_n(&mut daemon, 1).await;
    assert_eq!(daemon.state().above_threshold, Duration::ZERO);

    gpu.set_clock(1300);
    tick_n(&mut daemon, 3).await;

    assert!(!daemon.state().enabled);
    assert_eq!(daemon.state().above_threshold, secs(1.5));
    assert!(gpu.calls().is_empty());
}

#[tokio::test]
async fn steady_states_do_not_rewrite_settings() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(policy(offsets_profile()), gpu.boxed());

    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);
    gpu.take_calls();

    tick_n(&mut daemon, 10).await;
    assert!(gpu.calls().is_empty());

    gpu.set_clock(300);
    tick_n(&mut daemon, 2).await;
    assert!(!daemon.state().enabled);
    gpu.take_calls();

    tick_n(&mut daemon, 10).await;
    assert!(gpu.calls().is_empty());
}

#[tokio::test]
async fn disable_reverts_fully() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(policy(offsets_profile()), gpu.boxed());

    tick_n(&mut daemon, 1).await;
    assert_eq!(
        gpu.take_calls(),
        vec![Call::Offsets(100, 500), Call::LockClocks(210, 1860)]
    );
    assert_eq!(daemon.state().applied_offsets, (100, 500));

    // 1s off-hold at 0.5s per tick
    gpu.set_clock(210);
    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);

    tick_n(&mut daemon, 1).await;
    assert_eq!(
        gpu.take_calls(),
        vec![Call::LockClocks(210, 210), Call::Offsets(0, 0)]
    );
    assert_eq!(daemon.state(), &DaemonState {
        enabled: false,
        above_threshold: Duration::ZERO,
        below_threshold: secs(1.0),
        locked_clock_mhz: 210,
        applied_offsets: (0, 0),
        revert_pending: false,
    });
}

#[tokio::test]
async fn power_limit_is_applied_on_enable() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            power_limit: Some(250),
            on_hold: Some(0.0),
            ..profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;

    assert_eq!(
        gpu.calls(),
        vec![Call::PowerLimit(250), Call::LockClocks(210, 1860)]
    );
}

#[tokio::test(start_paused = true)]
async fn ramp_walks_up_to_the_target() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            ramp: Some(true),
            ramp_step: Some(15),
            on_hold: Some(0.0),
            ..profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;

    let expected: Vec<(u32, u32)> =
        (225..=1860).step_by(15).map(|max| (210, max)).collect();

    assert_eq!(gpu.locks(), expected);
    assert_eq!(gpu.locks().last(), Some(&(210, 1860)));
    assert_eq!(daemon.state().locked_clock_mhz, 1860);
    assert!(daemon.state().enabled);
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_ramp_reverts_fully() {
    let gpu = MockGpu::new(1300);
    let token = CancellationToken::new();

    // Baseline lock plus 5 ramp steps
    gpu.cancel_after_locks(6, token.clone());

    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            ramp: Some(true),
            ramp_step: Some(15),
            ..offsets_profile()
        }),
        gpu.boxed(),
    );

    daemon.run(token).await.unwrap();

    let locks = gpu.locks();
    assert_eq!(
        locks,
        vec![
            (210, 210),
            (210, 225),
            (210, 240),
            (210, 255),
            (210, 270),
            (210, 285),
            (210, 210),
        ]
    );

    let calls = gpu.calls();
    assert_eq!(
        &calls[calls.len() - 2..],
        &[Call::LockClocks(210, 210), Call::Offsets(0, 0)]
    );
    assert!(!daemon.state().enabled);
    assert_eq!(daemon.state().locked_clock_mhz, 210);
    assert_eq!(daemon.state().applied_offsets, (0, 0));
}

#[tokio::test]
async fn thermal_guard_clamps_while_enabled() {
    let gpu = MockGpu::new(1300);
    gpu.set_temperature(Some(70));

    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            temp_limit: Some(83),
            on_hold: Some(0.0),
            ..profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;
    assert_eq!(gpu.take_calls(), vec![Call::LockClocks(210, 1860)]);

    // Reduced on the same tick the temperature goes over the limit
    gpu.set_temperature(Some(90));
    tick_n(&mut daemon, 1).await;
    assert!(daemon.thermal_engaged());
    assert!(daemon.state().enabled);
    assert_eq!(gpu.take_calls(), vec![Call::LockClocks(210, 1845)]);

    tick_n(&mut daemon, 3).await;
    assert!(gpu.calls().is_empty());

    gpu.set_temperature(Some(83));
    tick_n(&mut daemon, 1).await;
    assert!(!daemon.thermal_engaged());
    assert_eq!(gpu.take_calls(), vec![Call::LockClocks(210, 1860)]);
}

#[tokio::test]
async fn hot_gpu_enables_at_the_reduced_clock() {
    let gpu = MockGpu::new(1300);
    gpu.set_temperature(Some(90));

    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            temp_limit: Some(83),
            thermal_margin: Some(100),
            on_hold: Some(0.0),
            ..profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 2).await;

    assert_eq!(gpu.calls(), vec![Call::LockClocks(210, 1760)]);
    assert_eq!(daemon.state().locked_clock_mhz, 1760);
}

#[tokio::test]
async fn thermal_guard_never_raises_an_idle_gpu() {
    let gpu = MockGpu::new(300);
    gpu.set_temperature(Some(95));

    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            temp_limit: Some(83),
            ..profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 4).await;

    assert!(daemon.thermal_engaged());
    assert!(gpu.calls().is_empty());
}

#[tokio::test]
async fn unsupported_temperature_disables_the_guard() {
    let gpu = MockGpu::new(1300);
    gpu.set_temperature(None);

    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            temp_limit: Some(83),
            on_hold: Some(0.0),
            ..profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);

    // The sensor is not read again for this session
    gpu.set_temperature(Some(99));
    tick_n(&mut daemon, 2).await;

    assert!(!daemon.thermal_engaged());
    assert_eq!(gpu.calls(), vec![Call::LockClocks(210, 1860)]);
}

#[tokio::test]
async fn failed_reads_carry_the_state_forward() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(policy(profile()), gpu.boxed());

    tick_n(&mut daemon, 2).await;
    let before = daemon.state().clone();

    gpu.set_clock_unavailable(true);
    tick_n(&mut daemon, 5).await;
    assert_eq!(daemon.state(), &before);

    // Neither loaded nor idle, the streak continues
    gpu.set_clock_unavailable(false);
    tick_n(&mut daemon, 2).await;
    assert!(daemon.state().enabled);
}

#[tokio::test]
async fn failed_enable_is_rolled_back() {
    let gpu = MockGpu::new(1300);
    gpu.fail_next_locks(1);

    let mut daemon = Daemon::new(policy(offsets_profile()), gpu.boxed());

    tick_n(&mut daemon, 1).await;

    assert!(!daemon.state().enabled);
    assert_eq!(daemon.state().above_threshold, Duration::ZERO);
    assert_eq!(daemon.state().applied_offsets, (0, 0));
    assert_eq!(
        gpu.take_calls(),
        vec![
            Call::Offsets(100, 500),
            Call::LockClocks(210, 210),
            Call::Offsets(0, 0),
        ]
    );

    // The next loaded tick enables normally
    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);
    assert_eq!(
        gpu.take_calls(),
        vec![Call::Offsets(100, 500), Call::LockClocks(210, 1860)]
    );
}

#[tokio::test]
async fn rejected_offsets_on_enable_are_rolled_back() {
    let gpu = MockGpu::new(1300);
    gpu.fail_next_offsets(1);

    let mut daemon = Daemon::new(policy(offsets_profile()), gpu.boxed());

    tick_n(&mut daemon, 1).await;

    assert_eq!(
        gpu.take_calls(),
        vec![Call::LockClocks(210, 210), Call::Offsets(0, 0)]
    );
    assert!(!daemon.state().enabled);
    assert_eq!(daemon.state().locked_clock_mhz, 210);
    assert_eq!(daemon.state().applied_offsets, (0, 0));
    assert_eq!(daemon.state().above_threshold, Duration::ZERO);
}

#[tokio::test]
async fn partial_disable_keeps_the_gpu_at_the_floor() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            off_hold: Some(0.0),
            ..offsets_profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;
    gpu.take_calls();

    // Clock lock succeeds, offset reset is rejected
    gpu.set_clock(210);
    gpu.fail_next_offsets(1);
    tick_n(&mut daemon, 1).await;

    assert_eq!(gpu.take_calls(), vec![Call::LockClocks(210, 210)]);
    assert!(daemon.state().enabled);
    assert!(daemon.state().revert_pending);
    assert_eq!(daemon.state().locked_clock_mhz, 210);
    assert_eq!(daemon.state().applied_offsets, (100, 500));

    // The next idle tick completes the revert
    tick_n(&mut daemon, 1).await;
    assert_eq!(
        gpu.take_calls(),
        vec![Call::LockClocks(210, 210), Call::Offsets(0, 0)]
    );
    assert!(!daemon.state().enabled);
    assert!(!daemon.state().revert_pending);

    tick_n(&mut daemon, 5).await;
    assert!(gpu.calls().is_empty());
}

#[tokio::test]
async fn load_returning_after_partial_disable_restores_the_target() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            off_hold: Some(0.0),
            ..offsets_profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;
    gpu.set_clock(210);
    gpu.fail_next_offsets(1);
    tick_n(&mut daemon, 1).await;
    gpu.take_calls();

    gpu.set_clock(1300);
    tick_n(&mut daemon, 1).await;

    assert_eq!(gpu.take_calls(), vec![Call::LockClocks(210, 1860)]);
    assert!(daemon.state().enabled);
    assert!(!daemon.state().revert_pending);
    assert_eq!(daemon.state().applied_offsets, (100, 500));
}

#[tokio::test]
async fn failed_disable_is_retried_next_tick() {
    let gpu = MockGpu::new(1300);
    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            on_hold: Some(0.0),
            off_hold: Some(0.0),
            ..profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;
    gpu.take_calls();

    gpu.set_clock(210);
    gpu.fail_next_locks(1);
    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);
    assert!(gpu.take_calls().is_empty());

    tick_n(&mut daemon, 1).await;
    assert!(!daemon.state().enabled);
    assert_eq!(gpu.take_calls(), vec![Call::LockClocks(210, 210)]);
}

#[tokio::test]
async fn missing_offset_support_falls_back_to_clock_lock() {
    let gpu = MockGpu::new(1300);
    gpu.set_offsets_unsupported();

    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            off_hold: Some(0.0),
            ..offsets_profile()
        }),
        gpu.boxed(),
    );

    tick_n(&mut daemon, 1).await;
    assert!(daemon.state().enabled);

    gpu.set_clock(210);
    tick_n(&mut daemon, 1).await;
    gpu.set_clock(1300);
    tick_n(&mut daemon, 1).await;

    assert_eq!(
        gpu.calls(),
        vec![
            Call::LockClocks(210, 1860),
            Call::LockClocks(210, 210),
            Call::LockClocks(210, 1860),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_idle_applies_baseline_and_revert() {
    let gpu = MockGpu::new(300);
    let token = CancellationToken::new();

    let mut daemon = Daemon::new(policy(profile()), gpu.boxed());

    let handle = {
        let token = token.clone();
        tokio::spawn(async move {
            let result = daemon.run(token).await;
            (daemon, result)
        })
    };

    tokio::time::sleep(secs(3.0)).await;
    token.cancel();

    let (daemon, result) = handle.await.unwrap();
    result.unwrap();

    assert_eq!(
        gpu.calls(),
        vec![
            Call::Persistence,
            Call::LockClocks(210, 210),
            Call::LockClocks(210, 210),
        ]
    );
    assert_eq!(daemon.state(), &DaemonState {
        below_threshold: daemon.state().below_threshold,
        ..DaemonState::idle(210)
    });
}

#[tokio::test(start_paused = true)]
async fn shutdown_revert_is_retried() {
    let gpu = MockGpu::new(1300);
    let token = CancellationToken::new();

    let mut daemon = Daemon::new(
        policy(ProfileConfig {
            on_hold: Some(0.0),
            ..profile()
        }),
        gpu.boxed(),
    );

    let handle = {
        let token = token.clone();
        tokio::spawn(async move { daemon.run(token).await })
    };

    tokio::time::sleep(secs(2.0)).await;
    gpu.fail_next_locks(2);
    token.cancel();

    handle.await.unwrap().unwrap();

    assert_eq!(gpu.locks().last(), Some(&(210, 210)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_revert_gives_up_after_bounded_attempts() {
    let gpu = MockGpu::new(300);
    let token = CancellationToken::new();

    let mut daemon = Daemon::new(policy(profile()), gpu.boxed());

    let handle = {
        let token = token.clone();
        tokio::spawn(async move { daemon.run(token).await })
    };

    tokio::time::sleep(secs(1.0)).await;
    gpu.fail_next_locks(3);
    token.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, UndervoltError::ApplyFailed { .. }));
}
