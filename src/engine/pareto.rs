//! Non-dominated sorting, crowding distance, and hypervolume.

use crate::schema::Program;

/// Assign a 1-indexed non-domination rank to every program.
///
/// Repeatedly peels off the set of programs not dominated by any remaining
/// program. Programs with identical fitness vectors are mutually
/// non-dominating and land in the same rank, so the sort is safe to run on a
/// population that still contains duplicates.
pub fn assign_ranks(population: &mut [Program]) {
    for program in population.iter_mut() {
        program.rank = 0;
    }

    let mut remaining: Vec<usize> = (0..population.len()).collect();
    let mut rank = 1;
    while !remaining.is_empty() {
        let mut front: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                !remaining
                    .iter()
                    .any(|&j| j != i && population[j].fitness.dominates(&population[i].fitness))
            })
            .collect();
        if front.is_empty() {
            // Unreachable with strict dominance; keeps degenerate fitness
            // values (NaN) from looping forever.
            front = remaining.clone();
        }
        for &i in &front {
            population[i].rank = rank;
        }
        remaining.retain(|i| !front.contains(i));
        rank += 1;
    }
}

/// Assign crowding distances within each rank group.
///
/// Per objective, the two boundary programs of a group get `+inf`; interior
/// programs accumulate the normalized gap between their neighbors. A group
/// that is constant in an objective contributes nothing for it.
pub fn assign_crowding(population: &mut [Program]) {
    for program in population.iter_mut() {
        program.crowding_distance = 0.0;
    }
    if population.is_empty() {
        return;
    }

    let mut ranks: Vec<usize> = population.iter().map(|p| p.rank).collect();
    ranks.sort_unstable();
    ranks.dedup();

    for rank in ranks {
        let group: Vec<usize> = (0..population.len())
            .filter(|&i| population[i].rank == rank)
            .collect();
        let n_objectives = population[group[0]].fitness.len();

        for objective in 0..n_objectives {
            let mut sorted = group.clone();
            sorted.sort_by(|&a, &b| {
                let va = population[a].fitness.objectives()[objective].value;
                let vb = population[b].fitness.objectives()[objective].value;
                va.total_cmp(&vb)
            });

            let (&first, &last) = match (sorted.first(), sorted.last()) {
                (Some(first), Some(last)) => (first, last),
                _ => continue,
            };
            let min = population[first].fitness.objectives()[objective].value;
            let max = population[last].fitness.objectives()[objective].value;

            population[first].crowding_distance = f64::INFINITY;
            population[last].crowding_distance = f64::INFINITY;

            if max > min {
                for window in sorted.windows(3) {
                    let (prev, mid, next) = (window[0], window[1], window[2]);
                    let gap = population[next].fitness.objectives()[objective].value
                        - population[prev].fitness.objectives()[objective].value;
                    population[mid].crowding_distance += gap / (max - min);
                }
            }
        }
    }
}

/// Hypervolume of a Pareto front against the configured reference points.
///
/// Only objectives that are minimized and carry a reference participate.
/// Any unusable input (no reference-carrying objectives, a point at or
/// beyond the reference, non-finite values, mismatched vectors) yields `0`
/// instead of an error; a bad front must never abort a generation.
pub fn hypervolume(front: &[&Program]) -> f64 {
    let Some(first) = front.first() else {
        return 0.0;
    };

    let mut indices = Vec::new();
    let mut reference = Vec::new();
    for (k, objective) in first.fitness.objectives().iter().enumerate() {
        if objective.minimize
            && let Some(r) = objective.hv_reference
        {
            indices.push(k);
            reference.push(r);
        }
    }
    if indices.is_empty() {
        return 0.0;
    }

    let mut points = Vec::with_capacity(front.len());
    for program in front {
        let objectives = program.fitness.objectives();
        if objectives.len() != first.fitness.len() {
            return 0.0;
        }
        let point: Vec<f64> = indices.iter().map(|&k| objectives[k].value).collect();
        if point
            .iter()
            .zip(&reference)
            .any(|(v, r)| !v.is_finite() || *v >= *r)
        {
            return 0.0;
        }
        points.push(point);
    }

    slice_volume(&mut points, &reference)
}

/// Exact hypervolume by recursive slicing along the last objective.
fn slice_volume(points: &mut [Vec<f64>], reference: &[f64]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let dim = reference.len();
    if dim == 1 {
        let best = points.iter().map(|p| p[0]).fold(f64::INFINITY, f64::min);
        return (reference[0] - best).max(0.0);
    }

    points.sort_by(|a, b| a[dim - 1].total_cmp(&b[dim - 1]));
    let mut volume = 0.0;
    for k in 0..points.len() {
        let lower = points[k][dim - 1];
        let upper = if k + 1 < points.len() {
            points[k + 1][dim - 1]
        } else {
            reference[dim - 1]
        };
        let depth = upper - lower;
        if depth <= 0.0 {
            continue;
        }
        let mut projected: Vec<Vec<f64>> = points[..=k]
            .iter()
            .map(|p| p[..dim - 1].to_vec())
            .collect();
        volume += depth * slice_volume(&mut projected, &reference[..dim - 1]);
    }
    volume
}
