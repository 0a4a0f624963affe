// HOTPLUGD GOVERNOR
// THE CONTROL LOOP: SAMPLE -> INTEGRATE -> DECIDE -> ACT -> RESCHEDULE.
//
// THREE INDEPENDENT GUARDS:
//   STAT LOCK   (Mutex<Engine>)       LOAD COUNTERS, DWELL, CADENCE, EVENT LOG
//   TUNABLES    (RwLock<Tunables>)    THRESHOLD TABLE, POLICY, INTERVALS
//   USER LOCK   (Mutex<OverrideState>) THE OVERRIDE FLAG AND ITS SUSPEND SAVE SLOT
// THE OVERRIDE FLAG IS MIRRORED IN AN AtomicBool SO A CYCLE CAN BAIL OUT
// WITHOUT TOUCHING THE USER LOCK. NEITHER LOCK IS EVER HELD ACROSS A
// cancel_sync() OR AN ACTIVATION CALL.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::{parse_numeric, Config, Knob, Tunables};
use crate::error::{ConfigError, Result};
use crate::event::{EventLog, Outcome};
use crate::load::{CoreLoad, CoreStats, CpuTimes};
use crate::platform::{Platform, RunQueues};
use crate::tuning::{decide, next_cadence, Action, Cadence, DecisionInput, ThresholdTable};
use crate::work::DelayedWork;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    FrequencyChanged { old: u32, new: u32 },
    Suspending,
    Resumed,
    ShuttingDown,
}

// LAST COMPLETED CYCLE, FOR status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CycleSummary {
    online: usize,
    avg_load: u32,
    freq_khz: u32,
    action: Option<Action>,
}

struct Engine {
    stats: CoreStats,
    dwell: Duration,
    cadence: Cadence,
    peak_throughput: u64,
    cycles: u64,
    last: CycleSummary,
    log: EventLog,
}

#[derive(Default)]
struct OverrideState {
    locked: bool,
    saved: bool,
    shut_down: bool,
}

struct Shared<P> {
    platform: Arc<P>,
    engine: Mutex<Engine>,
    tunables: RwLock<Tunables>,
    user: Mutex<OverrideState>,
    locked: AtomicBool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub locked: bool,
    pub cadence: Cadence,
    pub online: usize,
    pub avg_load: u32,
    pub freq_khz: u32,
    pub dwell: Duration,
    pub peak_throughput: u64,
    pub cycles: u64,
    pub last_action: Option<Action>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "locked={} cadence={} online={} avg_load={} freq_khz={} dwell_ms={} peak={} cycles={} last={}",
            self.locked as u8,
            self.cadence.label(),
            self.online,
            self.avg_load,
            self.freq_khz,
            self.dwell.as_millis(),
            self.peak_throughput,
            self.cycles,
            match self.last_action {
                Some(a) => match a.target() {
                    Some(cpu) => format!("{}:{}", a.label(), cpu),
                    None => a.label().to_string(),
                },
                None => "-".to_string(),
            }
        )
    }
}

pub struct Governor<P: Platform + 'static> {
    shared: Arc<Shared<P>>,
    work: DelayedWork,
}

fn read_samples<P: Platform>(platform: &P) -> Result<(Vec<usize>, Vec<(usize, CpuTimes)>)> {
    let online = platform.online_cpus()?;
    let times = platform.cpu_times(&online)?;
    Ok((online, times))
}

impl<P: Platform + 'static> Governor<P> {
    // READ THE FREQUENCY TABLE, CALIBRATE, BASELINE, ARM THE FIRST TICK
    pub fn start(platform: Arc<P>, cfg: &Config) -> Result<Self> {
        let freqs = platform.frequency_table()?;
        let freq_max = freqs.iter().copied().max().unwrap_or(0);
        let freq_min = freqs.iter().copied().min().unwrap_or(0);
        let nr_possible = platform.possible_cpus().max(1);
        let peak_throughput = freq_max as u64 * nr_possible as u64;

        let mut table = ThresholdTable::calibrate(cfg.mips_low, cfg.mips_high, peak_throughput, nr_possible);
        cfg.apply_overrides(&mut table)?;

        let tunables = Tunables {
            table,
            policy: cfg.policy(freq_min),
            intervals: cfg.intervals(),
        };

        info!(freq_min, freq_max, nr_possible, peak_throughput, "calibrated");
        for line in tunables.table.render().lines() {
            info!("{}", line);
        }

        let mut stats = CoreStats::new(nr_possible);
        let (_, times) = read_samples(platform.as_ref())?;
        stats.reset(&times);

        let boot = tunables.intervals.boot;
        let shared = Arc::new(Shared {
            platform,
            engine: Mutex::new(Engine {
                stats,
                dwell: Duration::ZERO,
                cadence: Cadence::Boot,
                peak_throughput,
                cycles: 0,
                last: CycleSummary::default(),
                log: EventLog::new(),
            }),
            tunables: RwLock::new(tunables),
            user: Mutex::new(OverrideState::default()),
            locked: AtomicBool::new(false),
        });

        let worker = shared.clone();
        let work = DelayedWork::spawn("hotplugd-governor", move || worker.tick())?;
        work.queue(boot);
        info!(delay_s = boot.as_secs_f64(), "first cycle armed");

        Ok(Self { shared, work })
    }

    // RUN ONE CYCLE ON THE CALLER'S THREAD. THE RETURNED DELAY IS NOT QUEUED.
    pub fn tick(&self) -> Option<Duration> {
        self.shared.tick()
    }

    pub fn handle(&self, event: Event) {
        match event {
            Event::FrequencyChanged { old, new } => self.shared.frequency_changed(old, new),
            Event::Suspending => {
                {
                    let mut user = self.shared.user.lock();
                    user.saved = user.locked;
                    user.locked = true;
                    self.shared.locked.store(true, Ordering::SeqCst);
                    info!(saved = user.saved, "suspending: governor locked");
                }
                self.work.cancel_sync();
            }
            Event::Resumed => {
                let locked = {
                    let mut user = self.shared.user.lock();
                    if !user.shut_down {
                        user.locked = user.saved;
                    }
                    self.shared.locked.store(user.locked, Ordering::SeqCst);
                    info!(locked = user.locked, "resumed: lock restored");
                    user.locked
                };
                if !locked {
                    self.restart(None);
                }
            }
            Event::ShuttingDown => {
                {
                    let mut user = self.shared.user.lock();
                    user.locked = true;
                    user.saved = true;
                    user.shut_down = true;
                    self.shared.locked.store(true, Ordering::SeqCst);
                }
                info!("shutting down: governor locked");
                self.work.cancel_sync();
            }
        }
    }

    // 0 -> 1: STOP, WAITING OUT ANY IN-FLIGHT CYCLE.
    // 1 -> 0: FRESH BASELINE, RESTART AT THE NORMAL CADENCE.
    pub fn set_locked(&self, lock: bool) -> std::result::Result<(), ConfigError> {
        let (was, now) = {
            let mut user = self.shared.user.lock();
            if user.shut_down && !lock {
                return Err(ConfigError::ReadOnly("lock".into()));
            }
            let was = user.locked;
            user.locked = lock;
            self.shared.locked.store(lock, Ordering::SeqCst);
            (was, lock)
        };

        match (was, now) {
            (false, true) => {
                self.work.cancel_sync();
                info!("governor locked");
            }
            (true, false) => {
                self.restart(Some(Cadence::Normal));
                info!("governor unlocked");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.shared.locked.load(Ordering::SeqCst)
    }

    // DRAIN, RE-BASELINE, QUEUE. cadence = None KEEPS THE CURRENT ONE.
    fn restart(&self, cadence: Option<Cadence>) {
        self.work.cancel_sync();
        let delay = {
            let mut engine = self.shared.engine.lock();
            match read_samples(self.shared.platform.as_ref()) {
                Ok((_, times)) => engine.stats.reset(&times),
                Err(e) => warn!(error = %e, "baseline read failed, priming on next cycle"),
            }
            engine.dwell = Duration::ZERO;
            if let Some(c) = cadence {
                engine.cadence = c;
            }
            engine.cadence.interval(&self.shared.tunables.read().intervals)
        };
        self.work.queue(delay);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = vec![Knob::Lock.to_string()];
        keys.extend(self.shared.tunables.read().keys().into_iter().map(|k| k.to_string()));
        keys
    }

    pub fn read_knob(&self, key: &str) -> std::result::Result<String, ConfigError> {
        match key.parse::<Knob>()? {
            Knob::Lock => Ok((self.is_locked() as u8).to_string()),
            knob => Ok(self.shared.tunables.read().get(knob)?.to_string()),
        }
    }

    pub fn write_knob(&self, key: &str, raw: &str) -> std::result::Result<(), ConfigError> {
        match key.parse::<Knob>()? {
            Knob::Lock => {
                let v = parse_numeric(key, raw)?;
                self.set_locked(v != 0)
            }
            knob => {
                self.shared.tunables.write().set(knob, raw)?;
                info!(key, value = raw.trim(), "tunable updated");
                Ok(())
            }
        }
    }

    pub fn tunables(&self) -> Tunables {
        self.shared.tunables.read().clone()
    }

    pub fn status(&self) -> Status {
        let engine = self.shared.engine.lock();
        Status {
            locked: self.is_locked(),
            cadence: engine.cadence,
            online: engine.last.online,
            avg_load: engine.last.avg_load,
            freq_khz: engine.last.freq_khz,
            dwell: engine.dwell,
            peak_throughput: engine.peak_throughput,
            cycles: engine.cycles,
            last_action: engine.last.action,
        }
    }

    pub fn with_log<R>(&self, f: impl FnOnce(&EventLog) -> R) -> R {
        f(&self.shared.engine.lock().log)
    }

    pub fn is_pending(&self) -> bool {
        self.work.is_pending()
    }

    pub fn shutdown(&self) {
        self.handle(Event::ShuttingDown);
        self.work.shutdown();
    }
}

impl<P: Platform + 'static> Drop for Governor<P> {
    fn drop(&mut self) {
        let done = self.shared.user.lock().shut_down;
        if !done {
            self.shutdown();
        }
    }
}

// MIN-QUEUE CORE: NEVER CPU0, STRICTLY SMALLER WINS (LOWEST INDEX ON TIES)
fn min_queue(online: &[usize], rq: &RunQueues) -> (usize, u64) {
    let mut cpu_min = 0;
    let mut len_min = u64::MAX;
    for &cpu in online {
        if cpu == 0 {
            continue;
        }
        let n = rq.len_of(cpu);
        if n < len_min {
            len_min = n;
            cpu_min = cpu;
        }
    }
    (cpu_min, len_min)
}

// ADD TARGET: HIGHEST-NUMBERED INACTIVE CORE ABOVE CPU0
fn add_candidate(online: &[usize], nr_possible: usize) -> Option<usize> {
    (1..nr_possible).rev().find(|c| !online.contains(c))
}

impl<P: Platform> Shared<P> {
    fn frequency_changed(&self, old: u32, new: u32) {
        if self.locked.load(Ordering::SeqCst) {
            return;
        }
        let mut engine = self.engine.lock();
        match read_samples(self.platform.as_ref()) {
            Ok((_, times)) => {
                engine.stats.account_frequency_change(&times, old);
                trace!(old, new, "frequency sub-interval closed");
            }
            Err(e) => warn!(error = %e, "sample read failed on frequency change"),
        }
    }

    fn activate(&self, action: Action) -> bool {
        let result = match action {
            Action::NoAction => return true,
            Action::AddCore(cpu) => {
                info!(cpu, "bringing core online");
                self.platform.bring_online(cpu)
            }
            Action::RemoveCore(cpu) => {
                info!(cpu, "taking core offline");
                self.platform.take_offline(cpu)
            }
        };
        if let Err(e) = &result {
            warn!(action = action.label(), error = %e, "hotplug failed, cadence unchanged");
        }
        result.is_ok()
    }

    fn tick(&self) -> Option<Duration> {
        if self.locked.load(Ordering::SeqCst) {
            debug!("locked: cycle skipped, not rescheduled");
            return None;
        }

        let tun = self.tunables.read().clone();
        let mut engine = self.engine.lock();
        if engine.cadence == Cadence::Boot {
            engine.cadence = Cadence::Normal;
        }
        let poll_interval = engine.cadence.interval(&tun.intervals);
        engine.cycles += 1;

        let sample = (|| -> Result<_> {
            let freq = self.platform.current_freq_khz()?;
            let (online, times) = read_samples(self.platform.as_ref())?;
            let rq = self.platform.run_queues()?;
            Ok((freq, online, times, rq))
        })();
        let (cur_freq, online, times, rq) = match sample {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "sampling failed, no decision this cycle");
                engine.log.record(0, 0, 0, Outcome::Skipped);
                return Some(poll_interval);
            }
        };

        // CORES THAT LEFT BEHIND OUR BACK LOSE THEIR BASELINE
        for cpu in 0..engine.stats.capacity() {
            if !online.contains(&cpu) {
                engine.stats.forget(cpu);
            }
        }

        let peak = engine.peak_throughput;
        let loads: Vec<CoreLoad> = match engine.stats.integrate(&times, cur_freq, peak) {
            Ok(l) => l,
            Err(skew) => {
                debug!(%skew, "counter skew, no decision this cycle");
                engine.log.record(online.len() as u32, 0, cur_freq, Outcome::Skipped);
                return Some(poll_interval);
            }
        };

        let mut avg_load = 0u32;
        for l in &loads {
            trace!(cpu = l.cpu, nr_running = rq.len_of(l.cpu), load = l.load, avg_load = l.avg_load, "core");
            avg_load = avg_load.saturating_add(l.avg_load);
        }

        let (min_rq_cpu, min_rq_len) = min_queue(&online, &rq);
        let min_rq_load = loads.iter().find(|l| l.cpu == min_rq_cpu).map(|l| l.load).unwrap_or(0);
        let input = DecisionInput {
            avg_load,
            cur_freq_khz: cur_freq,
            online: online.len(),
            nr_running: rq.total,
            min_rq_len,
            min_rq_cpu,
            min_rq_load,
            add_candidate: add_candidate(&online, engine.stats.capacity()),
            dwell: engine.dwell,
            poll_interval,
        };
        let verdict = decide(&input, &tun.table, &tun.policy);
        let prior_dwell = engine.dwell;
        engine.dwell = verdict.dwell;

        debug!(
            freq_mhz = cur_freq / 1000,
            avg_load,
            online = online.len(),
            nr_running = rq.total,
            min_rq_cpu,
            action = verdict.action.label(),
            "cycle"
        );

        engine.last = CycleSummary {
            online: online.len(),
            avg_load,
            freq_khz: cur_freq,
            action: Some(verdict.action),
        };
        engine.log.record(online.len() as u32, avg_load, cur_freq, Outcome::Decided(verdict.action));
        drop(engine);

        let applied = match verdict.action {
            Action::NoAction => true,
            action => self.activate(action),
        };

        let mut engine = self.engine.lock();
        engine.cadence = next_cadence(engine.cadence, verdict.action, applied);
        match verdict.action {
            _ if !applied => {
                // FAILED HOTPLUG IS A NO-OP: THE HOLD EARNED SO FAR STANDS
                engine.dwell = prior_dwell;
                engine.log.mark_last_failed();
            }
            Action::AddCore(cpu) => match self.platform.cpu_times(&[cpu]) {
                Ok(times) => engine.stats.reset(&times),
                Err(e) => warn!(cpu, error = %e, "baseline read failed for new core"),
            },
            Action::RemoveCore(cpu) => engine.stats.forget(cpu),
            Action::NoAction => {}
        }
        Some(engine.cadence.interval(&tun.intervals))
    }
}
