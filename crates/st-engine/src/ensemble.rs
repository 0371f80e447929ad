//! Ensembles of independently trained surrogate models.

use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use st_data::{CacheKey, CacheLayer};
use st_types::{MemberSeeds, SeedSequence, System, TuneError, TuneResult};

use crate::model::{SurrogateFactory, SurrogateModel};
use crate::sampler::TrainingDataSampler;

/// One ensemble slot. A failed member keeps its seeds and error so the
/// trial can report it without aborting its siblings.
#[derive(Debug)]
pub struct EnsembleMember {
    pub index: usize,
    pub seeds: MemberSeeds,
    pub model: Result<Arc<dyn SurrogateModel>, TuneError>,
}

impl EnsembleMember {
    pub fn is_ok(&self) -> bool {
        self.model.is_ok()
    }
}

/// Trains `count` surrogates from fresh data, each through the cache.
pub struct SurrogateEnsembleTrainer<F: SurrogateFactory> {
    factory: Arc<F>,
    cache: Arc<CacheLayer>,
    pool: Arc<ThreadPool>,
}

impl<F: SurrogateFactory> SurrogateEnsembleTrainer<F> {
    pub fn new(factory: Arc<F>, cache: Arc<CacheLayer>, pool: Arc<ThreadPool>) -> Self {
        Self { factory, cache, pool }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Train members `0..count` concurrently on the shared pool. Member
    /// `i` uses the `i`-th seed pair derived from `master_seed`; results
    /// come back in index order whatever order training finishes in.
    pub fn build(
        &self,
        count: usize,
        system: &System,
        sampler: &dyn TrainingDataSampler,
        master_seed: u64,
    ) -> Vec<EnsembleMember> {
        let seeds = SeedSequence::member_seeds(master_seed, count);
        info!(count, master_seed, system = %system, "Building surrogate ensemble");

        let members: Vec<EnsembleMember> = self.pool.install(|| {
            seeds
                .par_iter()
                .enumerate()
                .map(|(index, seeds)| EnsembleMember {
                    index,
                    seeds: *seeds,
                    model: self.train_member(system, sampler, *seeds),
                })
                .collect()
        });

        for member in &members {
            if let Err(e) = &member.model {
                warn!(member = member.index, traj_seed = member.seeds.traj_seed, "Ensemble member failed: {}", e);
            }
        }
        members
    }

    fn train_member(
        &self,
        system: &System,
        sampler: &dyn TrainingDataSampler,
        seeds: MemberSeeds,
    ) -> TuneResult<Arc<dyn SurrogateModel>> {
        let key = CacheKey::builder("train_surrogate")
            .arg("system", system)
            .arg("model", &self.factory.identity())
            .arg("sampler", &sampler.identity())
            .seed("traj_seed", seeds.traj_seed)
            .seed("train_seed", seeds.train_seed)
            .build()?;

        let params = self.cache.get_or_compute(&key, || -> TuneResult<F::Params> {
            debug!(traj_seed = seeds.traj_seed, train_seed = seeds.train_seed, "training surrogate");
            let trajs = sampler.sample(seeds.traj_seed)?;
            Ok(self.factory.fit(system, &trajs, seeds.train_seed)?)
        })?;
        Ok(self.factory.restore(system, params)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, RidgeFactory, RidgeParameters};
    use crate::sampler::{RandomControlSampler, SamplerConfig};
    use crate::task::Task;
    use rayon::ThreadPoolBuilder;
    use st_types::{TrainingError, Trajectory};

    fn pool(n: usize) -> Arc<ThreadPool> {
        Arc::new(ThreadPoolBuilder::new().num_threads(n).build().unwrap())
    }

    fn sampler(task: &Task) -> RandomControlSampler {
        RandomControlSampler::new(task.clone(), SamplerConfig::default().with_n_trajs(5))
    }

    /// Ridge factory that refuses one particular train seed.
    struct Picky {
        inner: RidgeFactory,
        reject: u64,
    }

    impl SurrogateFactory for Picky {
        type Params = RidgeParameters;

        fn identity(&self) -> serde_json::Value {
            self.inner.identity()
        }

        fn fit(&self, system: &System, trajs: &[Trajectory], seed: u64) -> Result<RidgeParameters, TrainingError> {
            if seed == self.reject {
                return Err(TrainingError::Rejected {
                    message: format!("seed {seed}"),
                });
            }
            self.inner.fit(system, trajs, seed)
        }

        fn restore(&self, system: &System, params: RidgeParameters) -> Result<Arc<dyn SurrogateModel>, TrainingError> {
            self.inner.restore(system, params)
        }
    }

    #[test]
    fn members_come_back_in_index_order_with_derived_seeds() {
        let task = Task::double_integrator();
        let trainer = SurrogateEnsembleTrainer::new(
            Arc::new(RidgeFactory::new(ModelConfig { bootstrap: true, ..ModelConfig::default() })),
            Arc::new(CacheLayer::in_memory()),
            pool(2),
        );
        let members = trainer.build(6, &task.system, &sampler(&task), 99);

        assert_eq!(members.len(), 6);
        let expected = SeedSequence::member_seeds(99, 6);
        for (i, member) in members.iter().enumerate() {
            assert_eq!(member.index, i);
            assert_eq!(member.seeds, expected[i]);
            assert!(member.is_ok());
        }
    }

    #[test]
    fn rebuild_hits_the_cache() {
        let task = Task::double_integrator();
        let cache = Arc::new(CacheLayer::in_memory());
        let trainer = SurrogateEnsembleTrainer::new(Arc::new(RidgeFactory::default()), Arc::clone(&cache), pool(3));

        trainer.build(4, &task.system, &sampler(&task), 1);
        trainer.build(4, &task.system, &sampler(&task), 1);
        let stats = cache.get_stats();
        assert_eq!(stats.misses, 4);
        assert_eq!(stats.hits, 4);
    }

    #[test]
    fn failing_member_is_isolated() {
        let task = Task::double_integrator();
        let seeds = SeedSequence::member_seeds(5, 3);
        let factory = Picky {
            inner: RidgeFactory::default(),
            reject: seeds[1].train_seed,
        };
        let cache = Arc::new(CacheLayer::in_memory());
        let trainer = SurrogateEnsembleTrainer::new(Arc::new(factory), Arc::clone(&cache), pool(2));

        let members = trainer.build(3, &task.system, &sampler(&task), 5);
        assert!(members[0].is_ok());
        assert!(matches!(members[1].model, Err(TuneError::Training(TrainingError::Rejected { .. }))));
        assert!(members[2].is_ok());
        assert_eq!(cache.get_stats().failures, 1);
    }
}
