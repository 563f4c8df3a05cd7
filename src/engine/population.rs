//! Population registry: deduplication, invalid-pruning, and selection.

use crate::schema::Program;

/// The current generation's programs.
///
/// Ordered for deterministic duplicate detection (first occurrence wins);
/// logically unordered for ranking. All mutation happens on the controller
/// thread: workers only ever produce new programs that are merged here.
#[derive(Debug, Clone, Default)]
pub struct Population {
    programs: Vec<Program>,
}

impl Population {
    pub fn new(programs: Vec<Program>) -> Self {
        Self { programs }
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn programs_mut(&mut self) -> &mut [Program] {
        &mut self.programs
    }

    pub fn extend(&mut self, programs: impl IntoIterator<Item = Program>) {
        self.programs.extend(programs);
    }

    /// Mark and remove duplicates.
    ///
    /// A program is a duplicate when an earlier, valid, non-duplicate program
    /// has an identical fitness vector. Idempotent: running it twice yields
    /// the same population as once.
    pub fn drop_duplicates(&mut self) {
        for index in 0..self.programs.len() {
            if !self.programs[index].is_valid || self.programs[index].is_duplicate {
                continue;
            }
            let (head, tail) = self.programs.split_at_mut(index + 1);
            let reference = &head[index];
            for other in tail {
                if !other.is_duplicate && reference.fitness.values_equal(&other.fitness) {
                    other.is_duplicate = true;
                }
            }
        }
        self.programs.retain(|p| !p.is_duplicate);
    }

    /// Retain only valid programs.
    pub fn drop_invalids(&mut self) {
        self.programs.retain(|p| p.is_valid);
    }

    /// Number of fresh programs needed to restore the `2N` pool floor, if
    /// pruning dropped below it.
    pub fn refill_deficit(&self, target_size: usize) -> Option<usize> {
        let floor = 2 * target_size;
        (self.programs.len() < floor).then(|| floor - self.programs.len())
    }

    /// Keep the `target_size` best programs: rank ascending, crowding
    /// distance descending within a rank. Both passes are stable so the
    /// within-rank crowding order survives the rank sort.
    pub fn select_and_truncate(&mut self, target_size: usize) {
        self.programs
            .sort_by(|a, b| b.crowding_distance.total_cmp(&a.crowding_distance));
        self.programs.sort_by_key(|p| p.rank);
        self.programs.truncate(target_size);
    }

    /// Survivor at index 0 after the final sort.
    pub fn best(&self) -> Option<&Program> {
        self.programs.first()
    }

    /// The rank-1 subset, recomputed view.
    pub fn first_pareto_front(&self) -> Vec<&Program> {
        self.programs.iter().filter(|p| p.rank == 1).collect()
    }

    pub fn average_complexity(&self) -> f64 {
        if self.programs.is_empty() {
            return 0.0;
        }
        self.programs
            .iter()
            .map(|p| p.complexity() as f64)
            .sum::<f64>()
            / self.programs.len() as f64
    }
}
