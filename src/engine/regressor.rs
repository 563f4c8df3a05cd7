//! Evolutionary loop controller.
//!
//! Drives the two-phase loop (evolve, then tune constants inside fitness
//! evaluation), owns the worker pool and all run state, and is the only
//! mutator of the population registry. Workers execute pure functions over
//! shared immutable inputs and hand back freshly constructed programs; every
//! merge, prune, rank, and truncation happens single-threaded here.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::checkpoint::{Checkpoint, CheckpointError};
use super::fitness::evaluate_program;
use super::pareto::{assign_crowding, assign_ranks, hypervolume};
use super::population::Population;
use crate::schema::{
    ConfigError, Dataset, FitnessMetric, FitnessVector, GenerationContext, OffspringContext,
    OffspringGenerator, Program, ProgramFactory, ProgramState, RegressorConfig,
};

/// Lifecycle states of a run. The terminal states are
/// `GenerationsCompleted`, `Converged`, and `Interrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Uninitialized,
    GeneratingPopulation,
    GeneratingOffspring,
    RefillingPopulation,
    CreatingParetoFront,
    CreatingCrowdingDistance,
    GenerationsCompleted,
    Converged,
    Interrupted,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Uninitialized => "Uninitialized",
            Status::GeneratingPopulation => "Generating population",
            Status::GeneratingOffspring => "Generating offspring",
            Status::RefillingPopulation => "Refilling population",
            Status::CreatingParetoFront => "Creating pareto front",
            Status::CreatingCrowdingDistance => "Creating crowding distance",
            Status::GenerationsCompleted => "Terminated: generations completed",
            Status::Converged => "Terminated: converged",
            Status::Interrupted => "Interrupted by signal",
        };
        f.write_str(text)
    }
}

/// Fatal run failures. Numeric trouble never lands here; it is absorbed as
/// invalid programs, infinite fitness, or optimizer no-ops.
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),
    #[error("offspring generation exceeded the {0:?} timeout")]
    OffspringTimeout(Duration),
    #[error("population collapsed: no programs survived selection")]
    PopulationCollapsed,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Per-call options for [`SymbolicRegressor::fit`].
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Generation budget. `None` runs until convergence only; the caller
    /// accepts the unbounded-loop risk.
    pub generations: Option<usize>,
    /// Stop as soon as the best program converges.
    pub stop_at_convergence: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            generations: Some(100),
            stop_at_convergence: true,
        }
    }
}

/// One row of the population summary exposed to reporting collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub index: usize,
    pub program: String,
    pub complexity: usize,
    pub rank: usize,
    pub fitness: FitnessVector,
}

/// Multi-objective symbolic-regression engine.
pub struct SymbolicRegressor {
    config: RegressorConfig,
    metrics: Vec<Arc<dyn FitnessMetric>>,
    factory: Arc<dyn ProgramFactory>,
    offspring: Arc<dyn OffspringGenerator>,
    pool: rayon::ThreadPool,
    population: Population,
    generation: usize,
    status: Status,
    best_program: Option<Program>,
    best_history: Vec<Program>,
    first_front_history: Vec<Vec<Program>>,
    hypervolume_history: Vec<f64>,
    converged_generation: Option<usize>,
    average_complexity: f64,
    elapsed: Duration,
    cancelled: Arc<AtomicBool>,
}

impl SymbolicRegressor {
    pub fn new(
        config: RegressorConfig,
        metrics: Vec<Arc<dyn FitnessMetric>>,
        factory: Arc<dyn ProgramFactory>,
        offspring: Arc<dyn OffspringGenerator>,
    ) -> Result<Self, FitError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism)
            .build()
            .map_err(|e| FitError::ThreadPool(e.to_string()))?;

        Ok(Self {
            config,
            metrics,
            factory,
            offspring,
            pool,
            population: Population::default(),
            generation: 0,
            status: Status::Uninitialized,
            best_program: None,
            best_history: Vec::new(),
            first_front_history: Vec::new(),
            hypervolume_history: Vec::new(),
            converged_generation: None,
            average_complexity: 0.0,
            elapsed: Duration::ZERO,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Rebuild a regressor from a checkpoint, ready for a resuming `fit`.
    pub fn restore(
        config: RegressorConfig,
        metrics: Vec<Arc<dyn FitnessMetric>>,
        factory: Arc<dyn ProgramFactory>,
        offspring: Arc<dyn OffspringGenerator>,
        checkpoint: &Checkpoint,
    ) -> Result<Self, FitError> {
        let mut regressor = Self::new(config, metrics, factory, offspring)?;
        regressor.population =
            Population::new(regressor.restore_programs(&checkpoint.population)?);
        regressor.best_history = regressor.restore_programs(&checkpoint.best_history)?;
        regressor.first_front_history = checkpoint
            .first_front_history
            .iter()
            .map(|front| regressor.restore_programs(front))
            .collect::<Result<_, _>>()?;
        regressor.hypervolume_history = checkpoint.hypervolume_history.clone();
        regressor.generation = checkpoint.generation;
        regressor.status = checkpoint.status;
        regressor.converged_generation = checkpoint.converged_generation;
        regressor.average_complexity = checkpoint.average_complexity;
        regressor.elapsed = Duration::from_secs_f64(checkpoint.elapsed_secs.max(0.0));
        regressor.best_program = regressor.population.best().cloned();
        Ok(regressor)
    }

    /// Handle for converting an external interrupt signal into a clean stop.
    /// The flag is observed at generation boundaries only, so cancellation
    /// never sees a half-updated population; it is re-armed automatically so
    /// a later `fit` call resumes.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run the evolutionary loop.
    ///
    /// A fresh population is constructed only when none is set; calling `fit`
    /// again after an interruption or a completed budget resumes from the
    /// existing population and generation counter.
    pub fn fit(
        &mut self,
        mut data: Dataset,
        features: &[String],
        options: &FitOptions,
    ) -> Result<Status, FitError> {
        // Metric weight columns are derived once, before workers share the
        // dataset read-only.
        for metric in &self.metrics {
            metric.prepare(&mut data);
        }
        let data = Arc::new(data);

        if self.population.is_empty() {
            log::info!(
                "initializing population of {} programs",
                self.config.population_size
            );
            self.status = Status::GeneratingPopulation;
            let programs = self.build_programs(self.config.population_size, &data, features);
            self.population = Population::new(programs);
        } else {
            log::info!("fitting with existing population of {}", self.population.len());
        }

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return Ok(self.interrupt(false));
            }
            if let Some(budget) = options.generations
                && self.generation >= budget
            {
                log::info!("model already trained for {} generations", self.generation);
                self.status = Status::GenerationsCompleted;
                return Ok(self.status);
            }

            // Counted before the work so an interruption mid-generation can
            // roll the attempt back explicitly.
            self.generation += 1;
            let generation_start = Instant::now();
            log::info!(
                "generation {}/{} - {:.1}s elapsed",
                self.generation,
                options
                    .generations
                    .map_or_else(|| "-".to_string(), |g| g.to_string()),
                self.elapsed.as_secs_f64()
            );

            log::debug!("generating offspring");
            self.status = Status::GeneratingOffspring;
            let parents = Arc::new(self.population.programs().to_vec());
            let mut offspring = self.generate_offspring(&parents, &data)?;
            dedupe_offspring(&mut offspring);

            if self.cancelled.load(Ordering::Relaxed) {
                return Ok(self.interrupt(true));
            }

            self.population.extend(offspring);

            log::debug!("removing duplicates");
            let before_cleaning = self.population.len();
            self.population.drop_duplicates();
            let after_duplicates = self.population.len();
            log::debug!(
                "{}/{} duplicate programs removed",
                before_cleaning - after_duplicates,
                before_cleaning
            );
            self.population.drop_invalids();
            if self.population.len() != after_duplicates {
                log::debug!(
                    "{}/{} invalid programs removed",
                    after_duplicates - self.population.len(),
                    after_duplicates
                );
            }

            if let Some(missing) = self.population.refill_deficit(self.config.population_size) {
                self.status = Status::RefillingPopulation;
                log::info!(
                    "population of {} below {}, integrating {} new programs",
                    self.population.len(),
                    2 * self.config.population_size,
                    missing
                );
                let refill = self.build_programs(missing, &data, features);
                self.population.extend(refill);
            }

            log::debug!("creating pareto front");
            self.status = Status::CreatingParetoFront;
            assign_ranks(self.population.programs_mut());

            log::debug!("creating crowding distance");
            self.status = Status::CreatingCrowdingDistance;
            assign_crowding(self.population.programs_mut());

            self.population
                .select_and_truncate(self.config.population_size);

            let Some(best) = self.population.best().cloned() else {
                return Err(FitError::PopulationCollapsed);
            };
            self.best_program = Some(best.clone());
            self.best_history.push(best.clone());

            let front: Vec<Program> = self
                .population
                .first_pareto_front()
                .into_iter()
                .cloned()
                .collect();
            let front_refs: Vec<&Program> = front.iter().collect();
            self.hypervolume_history.push(hypervolume(&front_refs));
            self.first_front_history.push(front);
            self.average_complexity = self.population.average_complexity();

            // Productive time only; the checkpoint write below is excluded.
            let generation_elapsed = generation_start.elapsed();

            if best.converged {
                if self.converged_generation.is_none() {
                    self.converged_generation = Some(self.generation);
                    log::info!("training converged after {} generations", self.generation);
                }
                if options.stop_at_convergence {
                    self.elapsed += generation_elapsed;
                    self.status = Status::Converged;
                    return Ok(self.status);
                }
            }

            if let Some(checkpoint) = &self.config.checkpoint
                && checkpoint.frequency > 0
                && self.generation % checkpoint.frequency == 0
            {
                match self.write_checkpoint() {
                    Ok(()) => log::debug!("checkpoint written to {}", checkpoint.path.display()),
                    Err(err) => log::warn!("checkpoint write failed: {err}"),
                }
            }

            self.elapsed += generation_elapsed;

            if let Some(budget) = options.generations
                && self.generation == budget
            {
                log::info!("training terminated after {} generations", self.generation);
                self.status = Status::GenerationsCompleted;
                return Ok(self.status);
            }
        }
    }

    fn interrupt(&mut self, rollback: bool) -> Status {
        if rollback {
            // The generation in progress did not complete.
            self.generation = self.generation.saturating_sub(1);
        }
        self.status = Status::Interrupted;
        self.cancelled.store(false, Ordering::Relaxed);
        log::warn!(
            "training interrupted by signal at generation {}",
            self.generation
        );
        self.status
    }

    /// Construct `count` independent programs in parallel and score them.
    fn build_programs(&self, count: usize, data: &Dataset, features: &[String]) -> Vec<Program> {
        let ctx = GenerationContext {
            data,
            features,
            const_range: self.config.const_range,
            operators: &self.config.operators,
            metrics: &self.metrics,
            parsimony: self.config.parsimony,
            parsimony_decay: self.config.parsimony_decay,
        };
        self.pool.install(|| {
            (0..count)
                .into_par_iter()
                .map(|_| {
                    let mut program = self.factory.generate(&ctx);
                    evaluate_program(&mut program, data, &self.metrics);
                    program
                })
                .collect()
        })
    }

    /// Fan one offspring task per parent out over the pool.
    ///
    /// Each result wait is bounded by the configured timeout; exceeding it
    /// fails the whole generation step rather than silently continuing with
    /// a partial batch.
    fn generate_offspring(
        &self,
        parents: &Arc<Vec<Program>>,
        data: &Arc<Dataset>,
    ) -> Result<Vec<Program>, FitError> {
        let timeout = Duration::from_secs(self.config.offspring_timeout_secs);
        let count = parents.len();
        let (tx, rx) = mpsc::channel();

        for _ in 0..count {
            let tx = tx.clone();
            let parents = Arc::clone(parents);
            let data = Arc::clone(data);
            let metrics = self.metrics.clone();
            let generator = Arc::clone(&self.offspring);
            let generation = self.generation;
            let tournament_size = self.config.tournament_size;
            let operator_frequencies = self.config.operator_frequencies.clone();

            self.pool.spawn(move || {
                let ctx = OffspringContext {
                    population: &parents,
                    data: &data,
                    metrics: &metrics,
                    generation,
                    tournament_size,
                    operator_frequencies: &operator_frequencies,
                };
                let mut child = generator.generate(&ctx);
                evaluate_program(&mut child, &data, &metrics);
                let _ = tx.send(child);
            });
        }
        drop(tx);

        let mut offspring = Vec::with_capacity(count);
        for _ in 0..count {
            match rx.recv_timeout(timeout) {
                Ok(child) => offspring.push(child),
                Err(_) => return Err(FitError::OffspringTimeout(timeout)),
            }
        }
        Ok(offspring)
    }

    fn restore_programs(&self, states: &[ProgramState]) -> Result<Vec<Program>, FitError> {
        states
            .iter()
            .map(|state| {
                let expr = self
                    .factory
                    .restore(&state.expression)
                    .map_err(CheckpointError::from)?;
                Ok(Program::from_state(state.clone(), expr))
            })
            .collect()
    }

    /// Full snapshot of the current run state plus population.
    pub fn to_checkpoint(&self) -> Result<Checkpoint, CheckpointError> {
        let snapshot = |programs: &[Program]| -> Result<Vec<ProgramState>, CheckpointError> {
            programs
                .iter()
                .map(|p| p.to_state().map_err(CheckpointError::from))
                .collect()
        };
        Ok(Checkpoint {
            generation: self.generation,
            status: self.status,
            converged_generation: self.converged_generation,
            elapsed_secs: self.elapsed.as_secs_f64(),
            average_complexity: self.average_complexity,
            population: snapshot(self.population.programs())?,
            best_history: snapshot(&self.best_history)?,
            first_front_history: self
                .first_front_history
                .iter()
                .map(|front| snapshot(front))
                .collect::<Result<_, _>>()?,
            hypervolume_history: self.hypervolume_history.clone(),
        })
    }

    fn write_checkpoint(&self) -> Result<(), CheckpointError> {
        let Some(config) = &self.config.checkpoint else {
            return Ok(());
        };
        self.to_checkpoint()?.save(&config.path)
    }

    // Read-only accessors for reporting collaborators.

    pub fn population(&self) -> &[Program] {
        self.population.programs()
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn best_program(&self) -> Option<&Program> {
        self.best_program.as_ref()
    }

    pub fn best_history(&self) -> &[Program] {
        &self.best_history
    }

    pub fn first_front_history(&self) -> &[Vec<Program>] {
        &self.first_front_history
    }

    pub fn hypervolume_history(&self) -> &[f64] {
        &self.hypervolume_history
    }

    pub fn converged_generation(&self) -> Option<usize> {
        self.converged_generation
    }

    pub fn average_complexity(&self) -> f64 {
        self.average_complexity
    }

    /// Cumulative productive training time, excluding checkpoint I/O.
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// Current first Pareto front (rank-1 subset).
    pub fn first_pareto_front(&self) -> Vec<&Program> {
        self.population.first_pareto_front()
    }

    /// Per-program rows for human-readable reporting.
    pub fn summary(&self) -> Vec<SummaryRow> {
        self.population
            .programs()
            .iter()
            .enumerate()
            .map(|(index, p)| SummaryRow {
                index: index + 1,
                program: p.render(),
                complexity: p.complexity(),
                rank: p.rank,
                fitness: p.fitness.clone(),
            })
            .collect()
    }
}

/// Drop offspring that repeat an earlier sibling's fitness vector, before
/// they ever reach the population.
fn dedupe_offspring(offspring: &mut Vec<Program>) {
    let mut unique: Vec<Program> = Vec::with_capacity(offspring.len());
    for child in offspring.drain(..) {
        if !unique
            .iter()
            .any(|kept| kept.fitness.values_equal(&child.fitness))
        {
            unique.push(child);
        }
    }
    *offspring = unique;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_strings() {
        assert_eq!(Status::Uninitialized.to_string(), "Uninitialized");
        assert_eq!(
            Status::GeneratingPopulation.to_string(),
            "Generating population"
        );
        assert_eq!(
            Status::GenerationsCompleted.to_string(),
            "Terminated: generations completed"
        );
        assert_eq!(Status::Converged.to_string(), "Terminated: converged");
        assert_eq!(Status::Interrupted.to_string(), "Interrupted by signal");
    }

    #[test]
    fn test_dedupe_offspring_keeps_first() {
        use crate::schema::Objective;
        use crate::testutil::affine_program;

        let scored = |value: f64| {
            let mut p = affine_program(vec![value], vec![]);
            p.fitness.push(Objective {
                name: "f".to_string(),
                value,
                minimize: true,
                hv_reference: None,
            });
            p
        };
        let mut offspring = vec![scored(1.0), scored(1.0), scored(2.0)];
        dedupe_offspring(&mut offspring);
        assert_eq!(offspring.len(), 2);
    }
}
