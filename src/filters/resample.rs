//! Low-variance (systematic) resampling
//!
//! N pointers spaced 1/N apart share a single random offset in [0, 1/N); one
//! pass over the cumulative weights assigns each pointer to the particle whose
//! interval contains it. Particle i is copied either floor(N w_i) or
//! ceil(N w_i) times.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::particle::Particle;

/// When to resample after weighting.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResamplePolicy {
    /// Every cycle
    Always,
    /// Only when ESS < threshold * N (threshold in (0, 1])
    EffectiveSampleSize { threshold: f64 },
}

impl ResamplePolicy {
    pub fn should_resample(&self, weights: &[f64]) -> bool {
        match *self {
            ResamplePolicy::Always => true,
            ResamplePolicy::EffectiveSampleSize { threshold } => {
                effective_sample_size(weights) < threshold * weights.len() as f64
            }
        }
    }
}

/// 1 / sum(w^2) for normalized weights; 0 for an empty or all-zero set.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq > 0.0 {
        1.0 / sum_sq
    } else {
        0.0
    }
}

/// Selected indices for pointers `offset + m / N`, m = 0..N.
///
/// Weights are expected to be normalized; `offset` must lie in [0, 1/N).
pub fn systematic_indices(weights: &[f64], offset: f64) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }

    let step = 1.0 / n as f64;
    let mut indices = Vec::with_capacity(n);
    let mut i = 0;
    let mut cumulative = weights[0];
    let mut last_positive = 0;
    for m in 0..n {
        let pointer = offset + m as f64 * step;
        // Half-open intervals [c_{i-1}, c_i): a zero-weight particle owns no pointer
        while pointer >= cumulative && i + 1 < n {
            if weights[i] > 0.0 {
                last_positive = i;
            }
            i += 1;
            cumulative += weights[i];
        }
        // Rounding can leave the total just under 1; never land on a zero-weight tail
        if weights[i] > 0.0 {
            last_positive = i;
            indices.push(i);
        } else {
            indices.push(last_positive);
        }
    }
    indices
}

/// Resample with one random offset; every survivor gets weight 1/N.
pub fn low_variance_resample<R: Rng + ?Sized>(particles: &[Particle], rng: &mut R) -> Vec<Particle> {
    let n = particles.len();
    if n == 0 {
        return Vec::new();
    }

    let step = 1.0 / n as f64;
    let offset = rng.gen_range(0.0..step);
    let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();

    systematic_indices(&weights, offset)
        .into_iter()
        .map(|i| Particle {
            state: particles[i].state.clone(),
            weight: step,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateVec;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn particles(weights: &[f64]) -> Vec<Particle> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| Particle {
                state: StateVec::from_element(3, i as f64),
                weight: w,
            })
            .collect()
    }

    #[test]
    fn test_ess_bounds() {
        assert_relative_eq!(effective_sample_size(&[0.25; 4]), 4.0, epsilon = 1e-12);
        assert_relative_eq!(effective_sample_size(&[1.0, 0.0, 0.0]), 1.0);
        assert_eq!(effective_sample_size(&[]), 0.0);
    }

    #[test]
    fn test_policy() {
        let skewed = [0.97, 0.01, 0.01, 0.01];
        let uniform = [0.25; 4];
        let policy = ResamplePolicy::EffectiveSampleSize { threshold: 0.5 };
        assert!(policy.should_resample(&skewed));
        assert!(!policy.should_resample(&uniform));
        assert!(ResamplePolicy::Always.should_resample(&uniform));
    }

    #[test]
    fn test_indices_follow_cumulative_weights() {
        let idx = systematic_indices(&[0.5, 0.0, 0.25, 0.25], 0.1);
        assert_eq!(idx, vec![0, 0, 2, 3]);
        assert!(systematic_indices(&[], 0.0).is_empty());
    }

    #[test]
    fn test_zero_weight_particles_never_survive() {
        // Offset exactly 0 sits on the boundary of a leading zero-weight particle
        assert_eq!(systematic_indices(&[0.0, 0.5, 0.5], 0.0), vec![1, 1, 2]);
        assert_eq!(systematic_indices(&[0.0, 0.0, 1.0], 0.0), vec![2, 2, 2]);
        // Total short of 1 must not walk onto a trailing zero-weight particle
        assert_eq!(systematic_indices(&[0.5, 0.49, 0.0], 0.333), vec![0, 1, 1]);
    }

    #[test]
    fn test_resample_preserves_count_and_resets_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let input = particles(&[0.1, 0.6, 0.05, 0.25]);
        let out = low_variance_resample(&input, &mut rng);
        assert_eq!(out.len(), 4);
        for p in &out {
            assert_eq!(p.weight, 0.25);
        }
    }

    #[test]
    fn test_copies_are_floor_or_ceil_and_unbiased() {
        let weights = [0.1, 0.2, 0.3, 0.4];
        let n = weights.len();
        let input = particles(&weights);
        let mut rng = StdRng::seed_from_u64(11);

        let trials = 5000;
        let mut totals = [0usize; 4];
        for _ in 0..trials {
            let out = low_variance_resample(&input, &mut rng);
            let mut counts = [0usize; 4];
            for p in &out {
                counts[p.state[0] as usize] += 1;
            }
            for i in 0..n {
                let expected = n as f64 * weights[i];
                assert!(counts[i] == expected.floor() as usize || counts[i] == expected.ceil() as usize);
                totals[i] += counts[i];
            }
        }
        for i in 0..n {
            let mean = totals[i] as f64 / trials as f64;
            assert!((mean - n as f64 * weights[i]).abs() < 0.05, "index {i}: {mean}");
        }
    }

    #[test]
    fn test_equal_weights_show_no_index_preference() {
        // Chi-square over repeated trials against a uniform expectation
        let n = 10;
        let input = particles(&vec![1.0 / n as f64; n]);
        let mut rng = StdRng::seed_from_u64(2024);

        let trials = 1000;
        let mut counts = vec![0usize; n];
        for _ in 0..trials {
            for p in low_variance_resample(&input, &mut rng) {
                counts[p.state[0] as usize] += 1;
            }
        }

        let expected = trials as f64;
        let chi_square: f64 = counts
            .iter()
            .map(|&c| (c as f64 - expected).powi(2) / expected)
            .sum();
        // 9 degrees of freedom, p = 0.01
        assert!(chi_square < 21.67, "chi-square {chi_square}");
    }
}
