use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the orchestrator's notion of "now", in whole seconds.
///
/// All scheduling and commit timestamps flow through this trait so that
/// tests and simulation runs can substitute a controlled clock.
pub trait SystemClock: std::fmt::Debug + Send + Sync {
    fn now_s(&self) -> i64;
    fn clone_box(&self) -> Box<dyn SystemClock>;
}

impl Clone for Box<dyn SystemClock> {
    fn clone(&self) -> Box<dyn SystemClock> {
        self.clone_box()
    }
}

/// Wall clock, Unix epoch seconds.
#[derive(Debug, Clone)]
pub struct WallClock;

impl SystemClock for WallClock {
    fn now_s(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn clone_box(&self) -> Box<dyn SystemClock> {
        Box::new(self.clone())
    }
}

/// Accelerated view on a base clock, used while simulation mode is active:
/// one base second advances `speed` model seconds from the moment the
/// simulation was enabled.
#[derive(Debug, Clone)]
pub struct ScaledClock {
    base: Box<dyn SystemClock>,
    origin: i64,
    speed: f64,
}

impl ScaledClock {
    pub fn new(base: Box<dyn SystemClock>, speed: f64) -> ScaledClock {
        let origin = base.now_s();
        ScaledClock { base, origin, speed: speed.max(0.001) }
    }
}

impl SystemClock for ScaledClock {
    fn now_s(&self) -> i64 {
        let elapsed = self.base.now_s() - self.origin;
        self.origin + (elapsed as f64 * self.speed) as i64
    }

    fn clone_box(&self) -> Box<dyn SystemClock> {
        Box::new(self.clone())
    }
}

/// Manually advanced clock for tests and deterministic simulation.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<AtomicI64>,
}

impl MockClock {
    pub fn new(start: i64) -> MockClock {
        MockClock { now: Arc::new(AtomicI64::new(start)) }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl SystemClock for MockClock {
    fn now_s(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn clone_box(&self) -> Box<dyn SystemClock> {
        Box::new(self.clone())
    }
}
