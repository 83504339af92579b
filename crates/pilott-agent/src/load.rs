use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Busy-fraction load metric over a trailing time window.
#[derive(Debug, Clone)]
pub struct LoadTracker {
    window: Duration,
    spans: VecDeque<(Instant, Instant)>,
    busy_since: Option<Instant>,
}

impl LoadTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            spans: VecDeque::new(),
            busy_since: None,
        }
    }

    pub fn mark_busy(&mut self, now: Instant) {
        if self.busy_since.is_none() {
            self.busy_since = Some(now);
        }
    }

    pub fn mark_idle(&mut self, now: Instant) {
        if let Some(start) = self.busy_since.take() {
            self.spans.push_back((start, now));
        }
        self.prune(now);
    }

    /// Fraction of the trailing window spent busy, in `[0, 1]`.
    pub fn busy_fraction(&self, now: Instant) -> f64 {
        let window_start = now.checked_sub(self.window);
        let clip = |start: Instant, end: Instant| -> Duration {
            let start = match window_start {
                Some(ws) => start.max(ws),
                None => start,
            };
            let end = end.min(now);
            end.saturating_duration_since(start)
        };

        let mut busy: Duration = self.spans.iter().map(|&(s, e)| clip(s, e)).sum();
        if let Some(start) = self.busy_since {
            busy += clip(start, now);
        }
        (busy.as_secs_f64() / self.window.as_secs_f64()).min(1.0)
    }

    fn prune(&mut self, now: Instant) {
        if let Some(window_start) = now.checked_sub(self.window) {
            while self
                .spans
                .front()
                .is_some_and(|&(_, end)| end <= window_start)
            {
                self.spans.pop_front();
            }
        }
    }
}
