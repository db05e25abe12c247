//! Simulated participants.
//!
//! One task per bot-driven tile. Each task sleeps, re-checks its tile, toggles
//! it and picks its next delay. Nothing coordinates the bots; the population
//! drifts toward the target because a bot lingers on the target image and
//! churns quickly everywhere else. A shared inertia value, decayed by a single
//! driver task, scales every delay and decides when bots may settle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::BotTiming;
use crate::grid::{Coord, TileState};
use crate::Engine;

/// Process-wide inertia. Only the decay driver writes it.
#[derive(Debug)]
pub struct Inertia {
    bits: AtomicU64,
    floor: f64,
    step: f64,
}

impl Inertia {
    pub fn new(initial: f64, floor: f64, step: f64) -> Self {
        Self {
            bits: AtomicU64::new(initial.max(floor).to_bits()),
            floor,
            step,
        }
    }

    pub fn current(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn at_floor(&self) -> bool {
        self.current() <= self.floor
    }

    /// One decay step, clamped at the floor. Returns the new value.
    pub fn decay(&self) -> f64 {
        let next = (self.current() - self.step).max(self.floor);
        self.bits.store(next.to_bits(), Ordering::Release);
        next
    }
}

/// Re-fire delay: `jitter x multiplier x max(inertia, 1)`.
#[derive(Debug, Clone)]
pub struct DelayPolicy {
    timing: BotTiming,
}

impl DelayPolicy {
    pub fn new(timing: BotTiming) -> Self {
        Self { timing }
    }

    /// `unit` is a uniform sample in `[0, 1)`.
    pub fn delay(&self, on_target: bool, inertia: f64, unit: f64) -> Duration {
        let t = &self.timing;
        let span = t.jitter_max_ms.saturating_sub(t.jitter_min_ms) as f64;
        let jitter_ms = t.jitter_min_ms as f64 + span * unit.clamp(0.0, 1.0);
        let multiplier = if on_target {
            t.correct_multiplier
        } else {
            t.wrong_multiplier
        };
        Duration::from_secs_f64(jitter_ms * multiplier * inertia.max(1.0) / 1_000.0)
    }

    /// Delay before a freshly armed bot fires for the first time.
    pub fn arm_delay(&self, unit: f64) -> Duration {
        let t = &self.timing;
        let ms = t.arm_delay_min_ms as f64 + t.arm_delay_spread_ms as f64 * unit.clamp(0.0, 1.0);
        Duration::from_secs_f64(ms / 1_000.0)
    }
}

/// What a bot did when it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotTurn {
    Toggled(TileState),
    /// A human holds the tile, or held it since this bot was armed.
    Preempted,
    /// The tile shows the target and inertia has settled; retire for good.
    Converged,
}

impl Engine {
    /// One bot firing, taken as a single step under the grid lock.
    pub(crate) fn bot_turn(&self, coord: Coord, lease: u64) -> BotTurn {
        let shared = &self.shared;
        let mut grid = shared.lock_grid();

        match grid.holds_lease(coord, lease) {
            Ok(true) => {}
            Ok(false) | Err(_) => return BotTurn::Preempted,
        }

        let settled = shared.inertia.current() <= shared.config.inertia.convergence_threshold;
        if settled && grid.state(coord).ok() == Some(shared.target) {
            return BotTurn::Converged;
        }

        match self.toggle_locked(&mut grid, coord) {
            Ok(state) => BotTurn::Toggled(state),
            Err(_) => BotTurn::Preempted,
        }
    }

    fn next_bot_delay(&self, state: TileState) -> Duration {
        let unit = self.random_unit();
        self.shared
            .delays
            .delay(state == self.shared.target, self.shared.inertia.current(), unit)
    }

    /// Starts a bot for `coord` after the randomized arming delay.
    pub(crate) fn arm_bot(&self, coord: Coord, lease: u64) {
        let delay = self.shared.delays.arm_delay(self.random_unit());
        self.spawn_bot(coord, lease, delay);
    }

    pub(crate) fn spawn_bot(&self, coord: Coord, lease: u64, first_delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%coord, "no async runtime, bot not started");
            return;
        };
        handle.spawn(run_bot(self.clone(), coord, lease, first_delay));
    }

    pub(crate) fn spawn_inertia_decay(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, inertia will not decay");
            return;
        };
        handle.spawn(decay_inertia(self.clone()));
    }
}

async fn run_bot(engine: Engine, coord: Coord, lease: u64, first_delay: Duration) {
    let mut delay = first_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = engine.closed() => return,
        }

        match engine.bot_turn(coord, lease) {
            BotTurn::Toggled(state) => {
                delay = engine.next_bot_delay(state);
                debug!(column = coord.column, row = coord.row, state, ?delay, "bot toggled");
            }
            BotTurn::Preempted => {
                info!(column = coord.column, row = coord.row, "tile taken over by a human");
                return;
            }
            BotTurn::Converged => {
                info!(column = coord.column, row = coord.row, "tile completed");
                return;
            }
        }
    }
}

async fn decay_inertia(engine: Engine) {
    let inertia = &engine.shared.inertia;
    if inertia.at_floor() {
        return;
    }

    let mut ticker = tokio::time::interval(engine.shared.config.inertia.tick());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = engine.closed() => return,
        }
        let value = inertia.decay();
        if inertia.at_floor() {
            info!(inertia = value, "inertia reached its floor");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::{engine_with, toggle_to};

    fn settled_config() -> EngineConfig {
        let mut config = EngineConfig {
            columns: 1,
            rows: 1,
            target: Some(0),
            seed: Some(11),
            ..EngineConfig::default()
        };
        config.inertia.initial = 5.0;
        config.inertia.floor = 5.0;
        config.inertia.convergence_threshold = 5.0;
        config
    }

    fn restless_config() -> EngineConfig {
        let mut config = settled_config();
        config.inertia.initial = 20.0;
        config.inertia.floor = 20.0;
        config.inertia.convergence_threshold = 1.0;
        config
    }

    #[test]
    fn inertia_decays_monotonically_to_floor() {
        let inertia = Inertia::new(5.0, 2.0, 1.5);
        let mut last = inertia.current();
        for _ in 0..10 {
            let next = inertia.decay();
            assert!(next <= last);
            assert!(next >= 2.0);
            last = next;
        }
        assert_eq!(inertia.current(), 2.0);
        assert!(inertia.at_floor());
    }

    #[test]
    fn correct_tiles_wait_longer() {
        let policy = DelayPolicy::new(BotTiming::default());
        for unit in [0.1, 0.5, 0.9] {
            let correct = policy.delay(true, 12.0, unit);
            let wrong = policy.delay(false, 12.0, unit);
            assert!(correct > wrong, "{correct:?} <= {wrong:?} at {unit}");
        }
    }

    #[test]
    fn low_inertia_still_scales_by_one() {
        let policy = DelayPolicy::new(BotTiming::default());
        assert_eq!(policy.delay(false, 0.2, 0.5), policy.delay(false, 1.0, 0.5));
        assert!(policy.delay(false, 4.0, 0.5) > policy.delay(false, 1.0, 0.5));
    }

    #[test]
    fn bot_turn_respects_leases() {
        let engine = engine_with(restless_config(), 3);
        let c = Coord::new(0, 0);
        assert!(matches!(engine.bot_turn(c, 0), BotTurn::Toggled(_)));
        assert_eq!(engine.bot_turn(c, 1), BotTurn::Preempted);

        let held = engine.reserve().unwrap();
        assert_eq!(engine.bot_turn(held.coord, 0), BotTurn::Preempted);
    }

    #[test]
    fn bot_turn_converges_only_on_target_when_settled() {
        let engine = engine_with(settled_config(), 3);
        let c = Coord::new(0, 0);
        toggle_to(&engine, c, 1);
        assert_eq!(engine.bot_turn(c, 0), BotTurn::Toggled(2));
        assert_eq!(engine.bot_turn(c, 0), BotTurn::Toggled(0));
        assert_eq!(engine.bot_turn(c, 0), BotTurn::Converged);
        assert_eq!(engine.tile_state(c).unwrap(), 0);
    }

    // Settling is gated on the process-wide inertia, not on anything the tile
    // did. A bot sitting on the target keeps walking away from it while the
    // crowd is restless, and every bot on the target retires once inertia has
    // decayed, however briefly it has been there. Intentional.
    #[test]
    fn settling_is_gated_by_global_inertia_not_tile_history() {
        let engine = engine_with(restless_config(), 3);
        let c = Coord::new(0, 0);
        toggle_to(&engine, c, 0);
        assert_eq!(engine.bot_turn(c, 0), BotTurn::Toggled(1));

        let settled = engine_with(settled_config(), 3);
        toggle_to(&settled, c, 0);
        assert_eq!(settled.bot_turn(c, 0), BotTurn::Converged);
    }

    #[tokio::test(start_paused = true)]
    async fn bot_walks_to_target_then_goes_quiet() {
        let engine = engine_with(settled_config(), 2);
        let c = Coord::new(0, 0);
        toggle_to(&engine, c, 1);

        let mut sub = engine.subscribe();
        sub.next().await.unwrap().ack();

        engine.spawn_bot(c, 0, Duration::from_millis(10));
        let change = sub.next().await.unwrap();
        assert_eq!(change.coord(), c);
        change.ack();
        assert_eq!(engine.tile_state(c).unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(sub.backlog(), 0);
        assert_eq!(engine.tile_state(c).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn human_reservation_silences_the_bot_until_release() {
        let engine = engine_with(restless_config(), 3);
        let hold = engine.reserve().unwrap();
        let c = hold.coord;

        let mut sub = engine.subscribe();
        sub.next().await.unwrap().ack();

        engine.spawn_bot(c, 0, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(sub.backlog(), 0);

        assert!(engine.release(hold).unwrap());
        let change = tokio::time::timeout(Duration::from_secs(600), sub.next())
            .await
            .expect("re-armed bot toggles")
            .unwrap();
        assert_eq!(change.coord(), c);
        change.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn decay_driver_stops_at_floor() {
        let mut config = restless_config();
        config.inertia.initial = 4.0;
        config.inertia.floor = 1.5;
        config.inertia.step = 1.0;
        config.inertia.tick_ms = 1_000;
        config.bots_enabled = false;
        let engine = engine_with(config, 2);
        engine.start();

        let mut samples = vec![engine.inertia()];
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            samples.push(engine.inertia());
        }
        assert!(samples.windows(2).all(|w| w[1] <= w[0]), "{samples:?}");
        assert_eq!(*samples.last().unwrap(), 1.5);
        assert!(samples.iter().all(|v| *v >= 1.5));
    }

    #[tokio::test(start_paused = true)]
    async fn start_arms_bots_only_on_free_tiles() {
        let mut config = restless_config();
        config.columns = 2;
        let engine = engine_with(config, 3);
        let held = engine.reserve().unwrap().coord;
        let free = Coord::new(1 - held.column, 0);
        let held_state = engine.tile_state(held).unwrap();

        let mut sub = engine.subscribe();
        for _ in 0..2 {
            sub.next().await.unwrap().ack();
        }

        engine.start();
        let timing = &engine.config().bots;
        let armed_by = timing.arm_delay_min_ms + timing.arm_delay_spread_ms;
        tokio::time::sleep(Duration::from_millis(armed_by + 100)).await;

        assert!(sub.backlog() > 0, "free tile never toggled");
        while sub.backlog() > 0 {
            let change = sub.next().await.unwrap();
            assert_eq!(change.coord(), free);
            change.ack();
        }
        assert_eq!(engine.tile_state(held).unwrap(), held_state);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_does_not_double_the_decay() {
        let mut config = restless_config();
        config.inertia.initial = 10.0;
        config.inertia.floor = 0.0;
        config.inertia.step = 1.0;
        config.inertia.tick_ms = 1_000;
        config.bots_enabled = false;
        let engine = engine_with(config, 2);
        engine.start();
        engine.start();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(engine.inertia(), 9.0);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(engine.inertia(), 8.0);
    }
}
