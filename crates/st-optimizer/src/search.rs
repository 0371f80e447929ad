//! Search strategies over hierarchical configuration spaces.
//!
//! Every strategy owns a seeded generator, so the same seed and the same
//! reported costs reproduce the same suggestions.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use st_types::{ConfigSpace, Configuration};

/// Common trait for all search strategies. Costs are minimised.
pub trait SearchStrategy: Send {
    /// Generate the next batch of configurations to evaluate.
    fn suggest(&mut self, count: usize) -> Vec<Configuration>;

    /// Report a completed trial so adaptive strategies can learn.
    fn report(&mut self, _configuration: &Configuration, _cost: f64) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Random,
    #[default]
    Local,
}

impl StrategyKind {
    pub fn build(self, space: ConfigSpace, seed: u64, exploration_weight: f64) -> Box<dyn SearchStrategy> {
        match self {
            Self::Random => Box::new(RandomSearch::new(space, seed)),
            Self::Local => Box::new(LocalSearch::new(space, seed, exploration_weight)),
        }
    }
}

// ---- Random search ----

/// Independent random sampling across the space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: ConfigSpace,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(space: ConfigSpace, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<Configuration> {
        (0..count).map(|_| self.space.sample(&mut self.rng)).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Local search ----

/// Starts from the space's default configuration, then mixes random
/// exploration with perturbations of the cheapest configuration seen.
#[derive(Debug, Clone)]
pub struct LocalSearch {
    space: ConfigSpace,
    rng: ChaCha8Rng,
    observations: Vec<(Configuration, f64)>,
    exploration_weight: f64,
    step_scale: f64,
    suggested_default: bool,
}

impl LocalSearch {
    pub fn new(space: ConfigSpace, seed: u64, exploration_weight: f64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
            observations: Vec::new(),
            exploration_weight,
            step_scale: 0.1,
            suggested_default: false,
        }
    }

    pub fn with_step_scale(mut self, step_scale: f64) -> Self {
        self.step_scale = step_scale;
        self
    }

    /// Lowest reported cost; the earliest report wins ties.
    fn best(&self) -> Option<&Configuration> {
        self.observations
            .iter()
            .fold(None, |best: Option<&(Configuration, f64)>, obs| match best {
                Some(b) if b.1 <= obs.1 => Some(b),
                _ => Some(obs),
            })
            .map(|(cfg, _)| cfg)
    }

    fn explore(&mut self) -> Configuration {
        self.space.sample(&mut self.rng)
    }

    fn exploit(&mut self) -> Configuration {
        match self.best().cloned() {
            Some(base) => self.space.perturb(&base, &mut self.rng, self.step_scale),
            None => self.explore(),
        }
    }
}

impl SearchStrategy for LocalSearch {
    fn suggest(&mut self, count: usize) -> Vec<Configuration> {
        let mut batch = Vec::with_capacity(count);
        if count > 0 && !self.suggested_default {
            self.suggested_default = true;
            batch.push(self.space.default_configuration());
        }
        while batch.len() < count {
            let cfg = if self.observations.is_empty() || self.rng.gen::<f64>() < self.exploration_weight {
                self.explore()
            } else {
                self.exploit()
            };
            batch.push(cfg);
        }
        batch
    }

    fn report(&mut self, configuration: &Configuration, cost: f64) {
        if cost.is_finite() {
            self.observations.push((configuration.clone(), cost));
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}
