use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserMetrics {
    pub pages_opened: u64,
    pub pages_closed: u64,
    pub frames_rendered: u64,
    pub render_failures: u64,
    pub memory_checks: u64,
    pub peak_memory_mb: u64,
    pub limit_breaches: u64,
}

impl BrowserMetrics {
    pub fn record_page_open(&mut self) {
        self.pages_opened = self.pages_opened.saturating_add(1);
    }

    pub fn record_page_close(&mut self) {
        self.pages_closed = self.pages_closed.saturating_add(1);
    }

    pub fn record_frame(&mut self, success: bool) {
        if success {
            self.frames_rendered = self.frames_rendered.saturating_add(1);
        } else {
            self.render_failures = self.render_failures.saturating_add(1);
        }
    }

    pub fn record_memory(&mut self, used_mb: u64, within_limit: bool) {
        self.memory_checks = self.memory_checks.saturating_add(1);
        self.peak_memory_mb = self.peak_memory_mb.max(used_mb);
        if !within_limit {
            self.limit_breaches = self.limit_breaches.saturating_add(1);
        }
    }

    pub fn open_pages(&self) -> u64 {
        self.pages_opened.saturating_sub(self.pages_closed)
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.frames_rendered + self.render_failures;
        if total == 0 {
            0.0
        } else {
            (self.render_failures as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_peak_memory_and_failure_rate() {
        let mut metrics = BrowserMetrics::default();
        metrics.record_page_open();
        metrics.record_memory(300, true);
        metrics.record_memory(120, true);
        metrics.record_memory(2_500, false);
        for _ in 0..3 {
            metrics.record_frame(true);
        }
        metrics.record_frame(false);
        assert_eq!(metrics.peak_memory_mb, 2_500);
        assert_eq!(metrics.limit_breaches, 1);
        assert_eq!(metrics.open_pages(), 1);
        assert!((metrics.failure_rate() - 25.0).abs() < f64::EPSILON);
    }
}
