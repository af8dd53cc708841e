use std::sync::atomic::{AtomicI64, Ordering};

fn verbose() -> bool {
    std::env::var_os("VERBOSE").is_some()
}

/// Side-band progress reporting for long-running build stages.
/// Consumers of the engine see these messages on stderr when the
/// VERBOSE toggle is set; nothing else in the core writes output.
pub struct Progress {
    databank: String,
    stage: String,
    max: i64,
    consumed: AtomicI64,
    last_reported: AtomicI64,
}

impl Progress {
    pub fn new(databank: &str, max: i64, stage: &str) -> Self {
        if verbose() {
            eprintln!("{}: {}", databank, stage);
        }
        Progress {
            databank: databank.to_string(),
            stage: stage.to_string(),
            max: max.max(1),
            consumed: AtomicI64::new(0),
            last_reported: AtomicI64::new(0),
        }
    }

    /// Set absolute progress.
    pub fn progress(&self, value: i64) {
        let prev = self.consumed.swap(value, Ordering::Relaxed);
        if value > prev {
            self.report(value);
        }
    }

    /// Advance progress by a delta.
    pub fn consumed(&self, delta: i64) {
        let value = self.consumed.fetch_add(delta, Ordering::Relaxed) + delta;
        self.report(value);
    }

    pub fn message(&self, message: &str) {
        if verbose() {
            eprintln!("{}: {}: {}", self.databank, self.stage, message);
        }
    }

    fn report(&self, value: i64) {
        if !verbose() {
            return;
        }
        let percent = (value * 100) / self.max;
        let last = self.last_reported.load(Ordering::Relaxed);
        if percent > last && self.last_reported.swap(percent, Ordering::Relaxed) == last {
            eprintln!("{}: {}: {}%", self.databank, self.stage, percent.min(100));
        }
    }
}
