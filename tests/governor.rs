// HOTPLUGD GOVERNOR TESTS
// FULL CYCLES AGAINST AN IN-MEMORY PLATFORM: SAMPLING, ACTIVATION, ROLLBACK,
// LOCK / SUSPEND / SHUTDOWN SEMANTICS, KEYED TUNABLES.
//
// BOOT AND NORMAL INTERVALS ARE AN HOUR SO THE WORKER NEVER FIRES ON ITS OWN;
// EVERY CYCLE HERE IS DRIVEN EXPLICITLY THROUGH tick().

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::FakePlatform;
use hotplugd::config::Config;
use hotplugd::error::{ConfigError, HotplugError};
use hotplugd::governor::{Event, Governor};
use hotplugd::tuning::{Action, Cadence, SETTLE_INTERVAL};

const HOUR: Duration = Duration::from_secs(3600);

fn config() -> Config {
    Config {
        boot_delay_secs: HOUR.as_secs(),
        normal_interval_ms: HOUR.as_millis() as u64,
        ..Config::default()
    }
}

fn start(online: &[usize]) -> (Arc<FakePlatform>, Governor<FakePlatform>) {
    let platform = Arc::new(FakePlatform::new(online));
    let governor = Governor::start(platform.clone(), &config()).unwrap();
    (platform, governor)
}

// === STARTUP ===

#[test]
fn start_arms_boot_delay() {
    let (_, g) = start(&[0, 1]);
    assert!(g.is_pending());
    assert_eq!(g.status().cadence, Cadence::Boot);
    assert!(!g.is_locked());
}

#[test]
fn start_fails_without_frequency_table() {
    let mut platform = FakePlatform::new(&[0]);
    platform.table.clear();
    let err = Governor::start(Arc::new(platform), &config()).err().unwrap();
    assert!(matches!(err, HotplugError::NoFrequencyTable));
}

#[test]
fn start_rejects_override_for_missing_level() {
    let platform = Arc::new(FakePlatform::new(&[0]));
    let cfg = Config::from_toml("[[thresholds]]\ncpus = 5\nhigh = 50\n").unwrap();
    assert!(Governor::start(platform, &cfg).is_err());
}

// === CYCLES ===

#[test]
fn heavy_load_adds_highest_inactive_core() {
    let (p, g) = start(&[0, 1]);
    p.advance(1_000_000, 0);
    p.state.lock().nr_running = 5;

    // EACH CORE 100% BUSY AT PEAK FREQ = 25% OF PEAK, 50% TOTAL > 26%
    assert_eq!(g.tick(), Some(SETTLE_INTERVAL));
    assert_eq!(p.activations(), vec![Action::AddCore(3)]);

    let s = g.status();
    assert_eq!(s.avg_load, 50);
    assert_eq!(s.cadence, Cadence::Settle);
    assert_eq!(s.last_action, Some(Action::AddCore(3)));
}

#[test]
fn failed_activation_keeps_cadence() {
    let (p, g) = start(&[0, 1]);
    p.advance(1_000_000, 0);
    {
        let mut st = p.state.lock();
        st.nr_running = 5;
        st.fail_activation = true;
    }

    assert_eq!(g.tick(), Some(HOUR));
    assert_eq!(g.status().cadence, Cadence::Normal);
    assert!(p.activations().is_empty());
    assert_eq!(g.with_log(|l| l.totals().failed), 1);
}

#[test]
fn added_core_is_baselined_for_the_settle_cycle() {
    let (p, g) = start(&[0]);
    p.advance(1_000_000, 0);
    p.state.lock().nr_running = 5;
    assert_eq!(g.tick(), Some(SETTLE_INTERVAL));
    assert_eq!(p.activations(), vec![Action::AddCore(3)]);

    // BOTH CORES FULLY BUSY AT PEAK: 25% OF PEAK EACH
    p.advance(2_000_000, 0);
    g.tick();
    assert_eq!(g.status().avg_load, 50);
}

#[test]
fn failed_forced_remove_keeps_earned_dwell() {
    let cfg = Config { normal_interval_ms: 500, ..config() };
    let p = Arc::new(FakePlatform::new(&[0, 1]));
    let g = Governor::start(p.clone(), &cfg).unwrap();
    {
        let mut st = p.state.lock();
        st.per_cpu_rq = vec![(0, 1), (1, 1)];
        st.nr_running = 2;
    }

    // 20% BUSY PER CORE AT PEAK = 10% TOTAL, INSIDE [5, 13)
    for _ in 0..15 {
        p.advance(500_000, 400_000);
        assert_eq!(g.tick(), Some(Duration::from_millis(500)));
    }
    assert_eq!(g.status().avg_load, 10);
    assert_eq!(g.status().dwell, Duration::from_millis(7_500));

    p.state.lock().fail_activation = true;
    p.advance(500_000, 400_000);
    assert_eq!(g.tick(), Some(Duration::from_millis(500)));
    assert!(p.activations().is_empty());
    assert_eq!(g.status().dwell, Duration::from_millis(7_500));
    assert_eq!(g.status().cadence, Cadence::Normal);

    // NEXT CYCLE RETRIES AT ONCE, NO FRESH HOLD
    p.state.lock().fail_activation = false;
    p.advance(500_000, 400_000);
    g.tick();
    assert_eq!(p.activations(), vec![Action::RemoveCore(1)]);
    assert_eq!(g.status().dwell, Duration::ZERO);
}

#[test]
fn failed_remove_keeps_settle_cadence() {
    let (p, g) = start(&[0, 1]);
    p.advance(1_000_000, 0);
    p.state.lock().nr_running = 5;
    assert_eq!(g.tick(), Some(SETTLE_INTERVAL));

    {
        let mut st = p.state.lock();
        st.nr_running = 0;
        st.fail_activation = true;
    }
    p.advance(1_000_000, 1_000_000);
    assert_eq!(g.tick(), Some(SETTLE_INTERVAL));
    assert_eq!(g.status().cadence, Cadence::Settle);
    assert_eq!(g.status().last_action, Some(Action::RemoveCore(1)));
    assert_eq!(p.activations(), vec![Action::AddCore(3)]);
    assert_eq!(g.with_log(|l| l.totals().failed), 1);
}

#[test]
fn idle_system_removes_min_queue_core() {
    let (p, g) = start(&[0, 1, 2]);
    p.state.lock().per_cpu_rq = vec![(0, 1), (1, 3), (2, 0)];
    p.advance(1_000_000, 1_000_000);

    assert_eq!(g.tick(), Some(HOUR));
    assert_eq!(p.activations(), vec![Action::RemoveCore(2)]);
    assert_eq!(g.status().cadence, Cadence::Normal);
}

#[test]
fn zero_elapsed_cycle_is_safe() {
    let (p, g) = start(&[0, 1]);
    assert_eq!(g.tick(), Some(HOUR));
    assert_eq!(g.status().avg_load, 0);
    assert_eq!(p.activations(), vec![Action::RemoveCore(1)]);
}

#[test]
fn counter_skew_skips_decision() {
    let (p, g) = start(&[0, 1]);
    p.advance_cpu(0, 1_000_000, 0);
    p.advance_cpu(1, 1_000, 5_000);
    p.state.lock().nr_running = 5;

    assert_eq!(g.tick(), Some(HOUR));
    assert!(p.activations().is_empty());
    assert_eq!(g.with_log(|l| l.totals().skipped), 1);
}

#[test]
fn frequency_change_weights_old_sub_interval() {
    let (p, g) = start(&[0, 1]);
    p.advance(1_000_000, 0);
    p.state.lock().freq_khz = 600_000;
    g.handle(Event::FrequencyChanged { old: 600_000, new: 1_200_000 });
    p.advance(1_000_000, 0);
    p.state.lock().freq_khz = 1_200_000;

    g.tick();
    // PER CORE (1M x 600K + 1M x 1.2M) x 100 / (2M x 4.8M) = 18
    assert_eq!(g.status().avg_load, 36);
}

#[test]
fn frequency_change_ignored_while_locked() {
    let (p, g) = start(&[0, 1]);
    g.set_locked(true).unwrap();
    p.advance(1_000_000, 0);
    g.handle(Event::FrequencyChanged { old: 600_000, new: 1_200_000 });
    g.set_locked(false).unwrap();

    g.tick();
    assert_eq!(g.status().avg_load, 0);
}

// === OVERRIDE LAYER ===

#[test]
fn locked_cycle_does_not_reschedule() {
    let (p, g) = start(&[0, 1]);
    g.set_locked(true).unwrap();
    assert!(!g.is_pending());
    p.advance(1_000_000, 0);
    assert_eq!(g.tick(), None);
    assert!(p.activations().is_empty());
}

#[test]
fn unlock_rebaselines_and_fires_no_decision() {
    let (p, g) = start(&[0, 1]);
    g.write_knob("lock", "1").unwrap();
    p.advance(1_000_000, 0);
    p.state.lock().nr_running = 5;
    g.write_knob("lock", "0").unwrap();

    assert!(g.is_pending());
    assert_eq!(g.status().cadence, Cadence::Normal);
    assert!(p.activations().is_empty());

    // LOAD ACCRUED WHILE LOCKED IS GONE: ZERO ELAPSED, ZERO LOAD, BELOW LOW
    g.tick();
    assert_eq!(g.status().avg_load, 0);
    assert_eq!(p.activations(), vec![Action::RemoveCore(1)]);
}

#[test]
fn lock_unlock_clears_accumulated_sub_intervals() {
    let (p, g) = start(&[0, 1]);
    // 1S FULLY BUSY CLOSED BY A FREQUENCY EVENT: 25% PER CORE IF IT SURVIVED
    p.advance(1_000_000, 0);
    g.handle(Event::FrequencyChanged { old: 1_200_000, new: 600_000 });
    g.set_locked(true).unwrap();
    g.set_locked(false).unwrap();

    g.tick();
    assert_eq!(g.status().avg_load, 0);
    assert_eq!(p.activations(), vec![Action::RemoveCore(1)]);
}

#[test]
fn suspend_resume_restores_prior_lock() {
    let (_, g) = start(&[0, 1]);

    g.handle(Event::Suspending);
    assert!(g.is_locked());
    assert!(!g.is_pending());
    g.handle(Event::Resumed);
    assert!(!g.is_locked());
    assert!(g.is_pending());

    g.set_locked(true).unwrap();
    g.handle(Event::Suspending);
    g.handle(Event::Resumed);
    assert!(g.is_locked());
    assert!(!g.is_pending());
}

#[test]
fn shutdown_locks_permanently() {
    let (_, g) = start(&[0, 1]);
    g.shutdown();
    assert!(g.is_locked());
    assert!(matches!(g.write_knob("lock", "0"), Err(ConfigError::ReadOnly(_))));
    g.handle(Event::Resumed);
    assert!(g.is_locked());
    assert_eq!(g.tick(), None);
}

#[test]
fn drop_stops_worker_and_releases_platform() {
    let (p, g) = start(&[0, 1]);
    assert_eq!(Arc::strong_count(&p), 2);
    drop(g);
    assert_eq!(Arc::strong_count(&p), 1);
    assert!(p.activations().is_empty());
}

// === TUNABLES ===

#[test]
fn knobs_read_and_write() {
    let (_, g) = start(&[0, 1]);
    assert_eq!(g.read_knob("lock").unwrap(), "0");
    assert_eq!(g.read_knob("load_h0").unwrap(), "13");
    assert_eq!(g.read_knob("load_l3").unwrap(), "15");
    assert_eq!(g.read_knob("bound_freq").unwrap(), "600000");

    g.write_knob("load_h0", "20").unwrap();
    assert_eq!(g.read_knob("load_h0").unwrap(), "20");
    assert_eq!(g.tunables().table.band(1).high, 20);
}

#[test]
fn rejected_write_keeps_prior_value() {
    let (_, g) = start(&[0, 1]);
    assert!(matches!(g.write_knob("load_h1", "lots"), Err(ConfigError::NotNumeric { .. })));
    assert!(matches!(g.write_knob("load_h1", "250"), Err(ConfigError::OutOfRange { .. })));
    assert!(matches!(g.write_knob("load_h3", "90"), Err(ConfigError::ReadOnly(_))));
    assert!(matches!(g.write_knob("lock", "yes"), Err(ConfigError::NotNumeric { .. })));
    assert!(matches!(g.read_knob("load_h9"), Err(ConfigError::UnknownKey(_))));
    assert_eq!(g.read_knob("load_h1").unwrap(), "26");
    assert!(!g.is_locked());
}

#[test]
fn keys_list_lock_first() {
    let (_, g) = start(&[0]);
    let keys = g.keys();
    assert_eq!(keys[0], "lock");
    assert!(keys.iter().any(|k| k == "load_l1"));
    assert!(keys.iter().any(|k| k == "hold_ms"));
    assert_eq!(keys.len(), 1 + 4 * 2 + 4);
}

#[test]
fn threshold_write_takes_effect_next_cycle() {
    let (p, g) = start(&[0, 1]);
    p.advance(1_000_000, 0);
    p.state.lock().nr_running = 5;
    // 50% TOTAL NO LONGER EXCEEDS THE 2-CORE HIGH
    g.write_knob("load_h1", "60").unwrap();
    g.tick();
    assert!(p.activations().is_empty());
}
