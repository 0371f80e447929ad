//! Ground-truth dynamics for the benchmark systems.

use std::fmt;

/// Exact dynamics: a pure function of (state, control) to the next state.
pub trait Dynamics: Send + Sync + fmt::Debug {
    fn step(&self, obs: &[f64], ctrl: &[f64]) -> Vec<f64>;

    fn name(&self) -> &str;
}

/// Unit-mass point on a line, force-controlled. Explicit Euler.
#[derive(Debug, Clone, PartialEq)]
pub struct DoubleIntegrator {
    pub dt: f64,
}

impl Default for DoubleIntegrator {
    fn default() -> Self {
        Self { dt: 0.05 }
    }
}

impl Dynamics for DoubleIntegrator {
    fn step(&self, obs: &[f64], ctrl: &[f64]) -> Vec<f64> {
        let (x, v) = (obs[0], obs[1]);
        vec![x + self.dt * v, v + self.dt * ctrl[0]]
    }

    fn name(&self) -> &str {
        "double_integrator"
    }
}

/// Torque-driven pendulum with the angle measured from upright, so the
/// origin is the unstable equilibrium.
#[derive(Debug, Clone, PartialEq)]
pub struct Pendulum {
    pub dt: f64,
    pub gravity: f64,
    pub length: f64,
    pub mass: f64,
    pub damping: f64,
}

impl Default for Pendulum {
    fn default() -> Self {
        Self {
            dt: 0.05,
            gravity: 9.8,
            length: 1.0,
            mass: 1.0,
            damping: 0.1,
        }
    }
}

impl Dynamics for Pendulum {
    fn step(&self, obs: &[f64], ctrl: &[f64]) -> Vec<f64> {
        let (theta, omega) = (obs[0], obs[1]);
        let inertia = self.mass * self.length * self.length;
        let accel = self.gravity / self.length * theta.sin() - self.damping * omega / inertia
            + ctrl[0] / inertia;
        vec![theta + self.dt * omega, omega + self.dt * accel]
    }

    fn name(&self) -> &str {
        "pendulum"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_integrator_integrates_velocity() {
        let dyn_ = DoubleIntegrator { dt: 0.1 };
        let next = dyn_.step(&[1.0, 2.0], &[3.0]);
        assert!((next[0] - 1.2).abs() < 1e-12);
        assert!((next[1] - 2.3).abs() < 1e-12);
    }

    #[test]
    fn pendulum_falls_away_from_upright() {
        let pendulum = Pendulum::default();
        let next = pendulum.step(&[0.1, 0.0], &[0.0]);
        assert!(next[1] > 0.0);
        // The upright equilibrium is a fixed point.
        assert_eq!(pendulum.step(&[0.0, 0.0], &[0.0]), vec![0.0, 0.0]);
    }
}
