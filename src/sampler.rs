use crate::data::{chunk_views, nid_to_oob, Frame};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Marks rows out-of-bag for one class tree before a round is grown. The
/// RNG is reseeded per (seed, round, class, chunk), so the mask only
/// depends on the configuration, never on thread scheduling.
pub struct Sampler {
    pub sample_rate: f64,
    pub sample_rate_per_class: Option<Vec<f64>>,
    pub seed: u64,
}

impl Sampler {
    fn chunk_seed(&self, round: usize, class: usize, chunk: usize) -> u64 {
        self.seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((round as u64) << 32)
            .wrapping_add((class as u64) << 16)
            .wrapping_add(chunk as u64)
    }

    fn rate_for(&self, y: f64) -> f64 {
        match &self.sample_rate_per_class {
            Some(rates) if y.is_finite() && (y as usize) < rates.len() => rates[y as usize],
            _ => self.sample_rate,
        }
    }

    /// Flag dropped rows in the nids column; kept rows are untouched.
    pub fn mark_oob(
        &self,
        frame: &Frame,
        nids: &mut [i32],
        y: &[f64],
        round: usize,
        class: usize,
    ) {
        let espc = frame.espc().to_vec();
        let nid_chunks = chunk_views(nids, &espc);
        nid_chunks
            .into_par_iter()
            .enumerate()
            .for_each(|(cidx, chunk)| {
                let mut rng = StdRng::seed_from_u64(self.chunk_seed(round, class, cidx));
                let base = espc[cidx];
                for (row, nid) in chunk.iter_mut().enumerate() {
                    let rate = self.rate_for(y[base + row]);
                    if rng.gen_range(0.0..1.0) >= rate {
                        *nid = nid_to_oob(*nid);
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{is_oob_row, Column, FRESH};

    fn frame(nrows: usize) -> Frame {
        let x = Column::numeric("x", (0..nrows).map(|v| v as f64).collect());
        Frame::new(vec![x], 16).unwrap()
    }

    #[test]
    fn test_rate_one_keeps_everything() {
        let fr = frame(100);
        let s = Sampler {
            sample_rate: 1.0,
            sample_rate_per_class: None,
            seed: 42,
        };
        let mut nids = vec![FRESH; 100];
        let y = vec![0.0; 100];
        s.mark_oob(&fr, &mut nids, &y, 0, 0);
        assert!(nids.iter().all(|&n| n == FRESH));
    }

    #[test]
    fn test_masks_are_deterministic() {
        let fr = frame(200);
        let s = Sampler {
            sample_rate: 0.6,
            sample_rate_per_class: None,
            seed: 7,
        };
        let y = vec![0.0; 200];
        let mut a = vec![FRESH; 200];
        let mut b = vec![FRESH; 200];
        s.mark_oob(&fr, &mut a, &y, 3, 0);
        s.mark_oob(&fr, &mut b, &y, 3, 0);
        assert_eq!(a, b);
        let oob = a.iter().filter(|&&n| is_oob_row(n)).count();
        assert!(oob > 40 && oob < 120, "oob count {} looks off", oob);
    }

    #[test]
    fn test_different_rounds_differ() {
        let fr = frame(200);
        let s = Sampler {
            sample_rate: 0.5,
            sample_rate_per_class: None,
            seed: 7,
        };
        let y = vec![0.0; 200];
        let mut a = vec![FRESH; 200];
        let mut b = vec![FRESH; 200];
        s.mark_oob(&fr, &mut a, &y, 0, 0);
        s.mark_oob(&fr, &mut b, &y, 1, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_per_class_rates() {
        let fr = frame(400);
        let s = Sampler {
            sample_rate: 1.0,
            sample_rate_per_class: Some(vec![1.0, 0.1]),
            seed: 11,
        };
        let y: Vec<f64> = (0..400).map(|i| (i % 2) as f64).collect();
        let mut nids = vec![FRESH; 400];
        s.mark_oob(&fr, &mut nids, &y, 0, 0);
        let class0_oob = nids.iter().step_by(2).filter(|&&n| is_oob_row(n)).count();
        let class1_oob = nids.iter().skip(1).step_by(2).filter(|&&n| is_oob_row(n)).count();
        assert_eq!(class0_oob, 0);
        assert!(class1_oob > 140);
    }
}
