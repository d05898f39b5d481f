// Simulated over-the-air reception.
//
// `chaos` runs from 0.0 (perfect picture) to 1.0 (snow). Channel changes
// degrade it; time on air slowly improves it back.

#[derive(Debug, Clone)]
pub struct ReceptionStatus {
    chaos: f64,
    pub thresh: f64,
    pub degrade_amount: f64,
    pub improve_amount: f64,
}

impl Default for ReceptionStatus {
    fn default() -> Self {
        Self {
            chaos: 0.0,
            thresh: 0.01,
            degrade_amount: 0.05,
            improve_amount: 0.05,
        }
    }
}

impl ReceptionStatus {
    /// Signal quality for display, 1.0 being a clean picture.
    pub fn quality(&self) -> f64 {
        1.0 - self.chaos
    }

    pub fn is_perfect(&self) -> bool {
        self.chaos == 0.0
    }

    pub fn is_degraded(&self) -> bool {
        self.chaos > self.thresh
    }

    /// Degrade by `amount`, or by the default step when `None`.
    pub fn degrade(&mut self, amount: Option<f64>) {
        self.chaos = (self.chaos + amount.unwrap_or(self.degrade_amount)).min(1.0);
    }

    /// Improve by `amount`, or by the default step. Snaps to perfect once
    /// under the threshold.
    pub fn improve(&mut self, amount: Option<f64>) {
        self.chaos -= amount.unwrap_or(self.improve_amount);
        if self.chaos < self.thresh {
            self.chaos = 0.0;
        }
    }

    /// ffmpeg filter chain rendering the current degradation, if any.
    pub fn video_filter(&self) -> Option<String> {
        if !self.is_degraded() {
            return None;
        }
        let noise = self.chaos * 100.0;
        let v_scroll = self.chaos * 0.5;
        Some(format!(
            "noise=alls={noise:.0}:allf=t+u,scroll=h=0:v={v_scroll:.3}"
        ))
    }
}
