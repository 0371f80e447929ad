use serde::{Deserialize, Serialize};
use std::fmt;

/// Names and dimensions of a controlled system.
///
/// Serialized into cache keys, so two systems with identical names and
/// variables share cached trainings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct System {
    pub name: String,
    pub observations: Vec<String>,
    pub controls: Vec<String>,
}

impl System {
    pub fn new(name: impl Into<String>, observations: &[&str], controls: &[&str]) -> Self {
        Self {
            name: name.into(),
            observations: observations.iter().map(|s| s.to_string()).collect(),
            controls: controls.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn obs_dim(&self) -> usize {
        self.observations.len()
    }

    pub fn ctrl_dim(&self) -> usize {
        self.controls.len()
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(obs={}, ctrl={})",
            self.name,
            self.obs_dim(),
            self.ctrl_dim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        let system = System::new("pendulum", &["theta", "omega"], &["torque"]);
        assert_eq!(system.obs_dim(), 2);
        assert_eq!(system.ctrl_dim(), 1);
        assert_eq!(system.to_string(), "pendulum(obs=2, ctrl=1)");
    }
}
