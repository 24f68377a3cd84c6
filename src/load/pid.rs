//! Discrete PID controller used to pace the rate runner.
//!
//! The controller works on the inter-request interval, not on the rate
//! itself: the error fed in is `1/desired - 1/achieved` (seconds), and the
//! output is added to the nominal sleep of `1/desired`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 2.0,
            ki: 1.2,
            kd: 0.001,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    integral: f64,
    prev_error: f64,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            prev_error: 0.0,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    /// Feed one error sample taken `dt_secs` after the previous one.
    ///
    /// A non-finite output (zero `dt`, infinite error) is reported as 0 and
    /// leaves the controller state as it was before the call.
    pub fn update(&mut self, error: f64, dt_secs: f64) -> f64 {
        let integral = self.integral + error * dt_secs;
        let derivative = (error - self.prev_error) / dt_secs;
        let output = self.gains.kp * error + self.gains.ki * integral + self.gains.kd * derivative;

        if !output.is_finite() {
            return 0.0;
        }

        self.integral = integral;
        self.prev_error = error;
        output
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
    }
}

impl Default for PidController {
    fn default() -> Self {
        Self::new(PidGains::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gains() {
        let g = PidGains::default();
        assert_eq!(g.kp, 2.0);
        assert_eq!(g.ki, 1.2);
        assert_eq!(g.kd, 0.001);
    }

    #[test]
    fn test_zero_error_holds_zero() {
        let mut pid = PidController::default();
        for _ in 0..10 {
            assert_eq!(pid.update(0.0, 0.1), 0.0);
        }
    }

    #[test]
    fn test_proportional_integral_derivative_terms() {
        let mut pid = PidController::new(PidGains {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
        });
        assert_eq!(pid.update(0.5, 1.0), 0.5);

        let mut pid = PidController::new(PidGains {
            kp: 0.0,
            ki: 1.0,
            kd: 0.0,
        });
        pid.update(0.5, 1.0);
        assert_eq!(pid.update(0.5, 1.0), 1.0);

        let mut pid = PidController::new(PidGains {
            kp: 0.0,
            ki: 0.0,
            kd: 1.0,
        });
        assert_eq!(pid.update(0.25, 0.5), 0.5);
    }

    #[test]
    fn test_zero_dt_is_degenerate_and_state_is_kept() {
        let mut pid = PidController::default();
        let first = pid.update(0.01, 0.1);
        assert!(first.is_finite());

        assert_eq!(pid.update(0.02, 0.0), 0.0);

        // Same input as a fresh controller after the same single step.
        let mut reference = PidController::default();
        reference.update(0.01, 0.1);
        assert_eq!(pid.update(0.01, 0.1), reference.update(0.01, 0.1));
    }

    #[test]
    fn test_infinite_error_is_ignored() {
        let mut pid = PidController::default();
        assert_eq!(pid.update(f64::NEG_INFINITY, 0.1), 0.0);
        assert_eq!(pid.update(0.0, 0.1), 0.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pid = PidController::default();
        pid.update(0.3, 0.1);
        pid.reset();
        assert_eq!(pid.update(0.0, 0.1), 0.0);
    }

    #[test]
    fn test_gains_from_toml() {
        let g: PidGains = toml::from_str("kp = 1.5").unwrap();
        assert_eq!(g.kp, 1.5);
        assert_eq!(g.ki, 1.2);
    }
}
