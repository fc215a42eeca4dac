use std::time::Instant;

use log::debug;
use space::{Knn, KnnFromBatch, LinearKnn, Metric};

use crate::{
    algorithms::kdtree::{FlannParams, KdForest},
    config::{MatcherKind, SelectorKind},
    error::{PipelineError, Result},
    frame::{DescriptorMatrix, Descriptors, Match, Representation},
};

/// Lowe's ratio: the best candidate is kept only when it is clearly closer
/// than the second best, `d0 < RATIO_THRESHOLD * d1`.
pub const RATIO_THRESHOLD: f64 = 0.8;

/// Strict ratio test, evaluated in double precision so a ratio of exactly 0.8
/// is rejected for every pair of `f32` distances.
pub fn passes_ratio_test(best: f32, second: f32) -> bool {
    (best as f64) < RATIO_THRESHOLD * second as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistanceMetric {
    /// Number of differing bits, or of differing elements on widened rows.
    Hamming,
    /// L2 norm of the difference, not squared.
    Euclidean,
}

impl DistanceMetric {
    pub fn for_representation(representation: Representation) -> Self {
        match representation {
            Representation::Binary => DistanceMetric::Hamming,
            Representation::Float => DistanceMetric::Euclidean,
        }
    }
}

impl Representation {
    /// The metric descriptors of this representation are compared with.
    pub fn metric(self) -> DistanceMetric {
        DistanceMetric::for_representation(self)
    }
}

pub fn binary_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

pub fn float_distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Hamming => a.iter().zip(b).filter(|(x, y)| x != y).count() as f32,
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HammingBytes;

impl<'a> Metric<&'a [u8]> for HammingBytes {
    type Unit = u32;

    fn distance(&self, a: &&'a [u8], b: &&'a [u8]) -> Self::Unit {
        binary_distance(a, b)
    }
}

/// Euclidean distance carried as the bit pattern of a non-negative `f32`,
/// which orders the same way as the float itself.
#[derive(Debug, Default, Clone, Copy)]
struct EuclideanRows;

impl<'a> Metric<&'a [f32]> for EuclideanRows {
    type Unit = u32;

    fn distance(&self, a: &&'a [f32], b: &&'a [f32]) -> Self::Unit {
        float_distance(DistanceMetric::Euclidean, a, b).to_bits()
    }
}

/// Candidates per source row, sorted by `(distance, reference index)`.
type Neighbours = Vec<Vec<(usize, f32)>>;

fn sort_candidates(candidates: &mut [(usize, f32)]) {
    candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}

fn knn_hamming(source: &DescriptorMatrix<u8>, reference: &DescriptorMatrix<u8>, k: usize) -> Neighbours {
    let data = reference.iter_rows().map(|row| (row, ())).collect::<Vec<_>>();
    let search: LinearKnn<HammingBytes, _> = KnnFromBatch::from_batch(data.iter());

    source
        .iter_rows()
        .map(|row| {
            let mut candidates = search
                .knn(&row, k)
                .into_iter()
                .map(|nearest| (nearest.0.index, nearest.0.distance as f32))
                .collect::<Vec<_>>();
            sort_candidates(&mut candidates);
            candidates
        })
        .collect()
}

fn knn_euclidean(source: &DescriptorMatrix<f32>, reference: &DescriptorMatrix<f32>, k: usize) -> Neighbours {
    let data = reference.iter_rows().map(|row| (row, ())).collect::<Vec<_>>();
    let search: LinearKnn<EuclideanRows, _> = KnnFromBatch::from_batch(data.iter());

    source
        .iter_rows()
        .map(|row| {
            let mut candidates = search
                .knn(&row, k)
                .into_iter()
                .map(|nearest| (nearest.0.index, f32::from_bits(nearest.0.distance)))
                .collect::<Vec<_>>();
            sort_candidates(&mut candidates);
            candidates
        })
        .collect()
}

/// Pairs descriptor rows of an earlier frame (source) with rows of a later
/// frame (reference).
#[derive(Debug, Clone)]
pub struct DescriptorMatcher {
    matcher: MatcherKind,
    selector: SelectorKind,
    representation: Representation,
    metric: DistanceMetric,
    flann: FlannParams,
}

impl DescriptorMatcher {
    /// The metric is fixed here from the descriptor representation.
    pub fn new(matcher: MatcherKind, selector: SelectorKind, representation: Representation) -> Self {
        Self {
            matcher,
            selector,
            representation,
            metric: representation.metric(),
            flann: FlannParams::default(),
        }
    }

    pub fn with_flann_params(self, flann: FlannParams) -> Self {
        Self { flann, ..self }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn matcher(&self) -> MatcherKind {
        self.matcher
    }

    pub fn selector(&self) -> SelectorKind {
        self.selector
    }

    fn check(&self, descriptors: &Descriptors) -> Result<()> {
        if descriptors.representation() == self.representation {
            Ok(())
        } else {
            Err(PipelineError::RepresentationMismatch {
                expected: self.representation,
                found: descriptors.representation(),
            })
        }
    }

    /// Matches from `source` rows to `reference` rows under the configured
    /// selection policy. Empty inputs give no matches.
    pub fn match_descriptors(&self, source: &Descriptors, reference: &Descriptors) -> Result<Vec<Match>> {
        self.check(source)?;
        self.check(reference)?;

        let k = match self.selector {
            SelectorKind::BestSingle => 1,
            SelectorKind::KBestRatio => 2,
        };
        if source.is_empty() || reference.rows() < k {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let neighbours = self.nearest(source, reference, k);
        let matches = self.select(&neighbours);

        debug!(
            "{} + {} matching: {} of {} source rows matched in {:.3} ms",
            self.matcher,
            self.selector,
            matches.len(),
            source.rows(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(matches)
    }

    fn nearest(&self, source: &Descriptors, reference: &Descriptors, k: usize) -> Neighbours {
        match (self.matcher, source, reference) {
            (MatcherKind::BruteForce, Descriptors::Binary(source), Descriptors::Binary(reference)) => {
                knn_hamming(source, reference, k)
            }
            (MatcherKind::BruteForce, Descriptors::Float(source), Descriptors::Float(reference)) => {
                knn_euclidean(source, reference, k)
            }
            // the kd-forest works on f32 rows only, binary rows are widened bit by bit
            (MatcherKind::FlannApprox, ..) | (MatcherKind::BruteForce, ..) => {
                let (source, reference) = (source.widened(), reference.widened());
                let forest = KdForest::build(&reference, &self.flann);
                let metric = self.metric;
                source
                    .iter_rows()
                    .map(|row| forest.knn(row, k, self.flann.checks, |a, b| float_distance(metric, a, b)))
                    .collect()
            }
        }
    }

    fn select(&self, neighbours: &Neighbours) -> Vec<Match> {
        neighbours
            .iter()
            .enumerate()
            .filter_map(|(source_index, candidates)| {
                let &(reference_index, distance) = candidates.first()?;
                let accepted = match self.selector {
                    SelectorKind::BestSingle => true,
                    SelectorKind::KBestRatio => candidates
                        .get(1)
                        .map_or(false, |&(_, second)| passes_ratio_test(distance, second)),
                };
                accepted.then_some(Match {
                    source_index,
                    reference_index,
                    distance,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn binary(rows: &[&[u8]]) -> Descriptors {
        Descriptors::Binary(DescriptorMatrix::from_rows(rows[0].len(), rows))
    }

    fn float(rows: &[&[f32]]) -> Descriptors {
        Descriptors::Float(DescriptorMatrix::from_rows(rows[0].len(), rows))
    }

    fn random_binary(rows: usize, cols: usize, seed: u64) -> Descriptors {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows)
            .map(|_| (0..cols).map(|_| rng.gen()).collect::<Vec<u8>>())
            .collect::<Vec<_>>();
        Descriptors::Binary(DescriptorMatrix::from_rows(cols, data))
    }

    fn random_float(rows: usize, cols: usize, seed: u64) -> Descriptors {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows)
            .map(|_| (0..cols).map(|_| rng.gen_range(0.0..255.0)).collect::<Vec<f32>>())
            .collect::<Vec<_>>();
        Descriptors::Float(DescriptorMatrix::from_rows(cols, data))
    }

    fn all_matchers(representation: Representation) -> Vec<DescriptorMatcher> {
        let mut matchers = Vec::new();
        for &matcher in MatcherKind::ALL {
            for &selector in SelectorKind::ALL {
                matchers.push(DescriptorMatcher::new(matcher, selector, representation));
            }
        }
        matchers
    }

    #[test]
    fn metric_follows_representation() {
        assert_eq!(Representation::Binary.metric(), DistanceMetric::Hamming);
        assert_eq!(Representation::Float.metric(), DistanceMetric::Euclidean);
        let matcher = DescriptorMatcher::new(MatcherKind::FlannApprox, SelectorKind::BestSingle, Representation::Binary);
        assert_eq!(matcher.metric(), DistanceMetric::Hamming);
    }

    #[test]
    fn ratio_of_exactly_point_eight_is_rejected() {
        assert!(!passes_ratio_test(8.0, 10.0));
        assert!(!passes_ratio_test(4.0, 5.0));
        assert!(passes_ratio_test(7.999, 10.0));
        assert!(passes_ratio_test(0.0, 1.0));
        assert!(!passes_ratio_test(0.0, 0.0));
    }

    #[test]
    fn ratio_boundary_on_hamming_distances() {
        let source = binary(&[&[0b0000_0000], &[0b1110_0000]]);
        // distances from row 0: 4 and 5, from row 1: 7 and 2
        let reference = binary(&[&[0b0000_1111], &[0b1111_1000]]);
        for matcher in [MatcherKind::BruteForce, MatcherKind::FlannApprox] {
            let matches = DescriptorMatcher::new(matcher, SelectorKind::KBestRatio, Representation::Binary)
                .match_descriptors(&source, &reference)
                .unwrap();
            assert_eq!(
                matches,
                vec![Match {
                    source_index: 1,
                    reference_index: 1,
                    distance: 2.0
                }],
                "{matcher}"
            );
        }
    }

    #[test]
    fn ratio_boundary_on_euclidean_distances() {
        let reference = float(&[&[8.0], &[-10.0]]);
        let matcher = DescriptorMatcher::new(MatcherKind::BruteForce, SelectorKind::KBestRatio, Representation::Float);
        assert!(matcher.match_descriptors(&float(&[&[0.0]]), &reference).unwrap().is_empty());

        let reference = float(&[&[7.999], &[-10.0]]);
        let matches = matcher.match_descriptors(&float(&[&[0.0]]), &reference).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].reference_index, 0);
    }

    #[test]
    fn best_single_matches_every_source_row() {
        let source = random_binary(40, 32, 1);
        let reference = random_binary(25, 32, 2);
        for matcher in all_matchers(Representation::Binary) {
            let matches = matcher.match_descriptors(&source, &reference).unwrap();
            match matcher.selector() {
                SelectorKind::BestSingle => assert_eq!(matches.len(), 40),
                SelectorKind::KBestRatio => assert!(matches.len() <= 40),
            }
            for (i, m) in matches.iter().enumerate() {
                assert!(m.reference_index < 25);
                if i > 0 {
                    assert!(matches[i - 1].source_index < m.source_index);
                }
            }
        }
    }

    #[test]
    fn ratio_selection_never_exceeds_best_single() {
        let source = random_float(30, 16, 3);
        let reference = random_float(30, 16, 4);
        for matcher in [MatcherKind::BruteForce, MatcherKind::FlannApprox] {
            let best = DescriptorMatcher::new(matcher, SelectorKind::BestSingle, Representation::Float)
                .match_descriptors(&source, &reference)
                .unwrap();
            let ratio = DescriptorMatcher::new(matcher, SelectorKind::KBestRatio, Representation::Float)
                .match_descriptors(&source, &reference)
                .unwrap();
            assert!(ratio.len() <= best.len());
        }
    }

    #[test]
    fn empty_or_single_row_inputs_give_no_matches() {
        let empty = Descriptors::Binary(DescriptorMatrix::new(32));
        let some = random_binary(5, 32, 5);
        let single = random_binary(1, 32, 6);
        for matcher in all_matchers(Representation::Binary) {
            assert!(matcher.match_descriptors(&empty, &some).unwrap().is_empty());
            assert!(matcher.match_descriptors(&some, &empty).unwrap().is_empty());
            let against_one = matcher.match_descriptors(&some, &single).unwrap();
            match matcher.selector() {
                SelectorKind::BestSingle => assert_eq!(against_one.len(), 5),
                SelectorKind::KBestRatio => assert!(against_one.is_empty()),
            }
        }
    }

    #[test]
    fn exhaustive_flann_agrees_with_brute_force() {
        let source = random_float(20, 24, 7);
        let reference = random_float(60, 24, 8);
        for &selector in SelectorKind::ALL {
            let brute = DescriptorMatcher::new(MatcherKind::BruteForce, selector, Representation::Float)
                .match_descriptors(&source, &reference)
                .unwrap();
            let flann = DescriptorMatcher::new(MatcherKind::FlannApprox, selector, Representation::Float)
                .with_flann_params(FlannParams {
                    checks: usize::MAX,
                    ..FlannParams::default()
                })
                .match_descriptors(&source, &reference)
                .unwrap();
            assert_eq!(brute, flann);
        }
    }

    #[test]
    fn widened_binary_rows_keep_hamming_distances() {
        let source = random_binary(10, 32, 9);
        let reference = random_binary(30, 32, 10);
        let brute = DescriptorMatcher::new(MatcherKind::BruteForce, SelectorKind::BestSingle, Representation::Binary)
            .match_descriptors(&source, &reference)
            .unwrap();
        let flann = DescriptorMatcher::new(MatcherKind::FlannApprox, SelectorKind::BestSingle, Representation::Binary)
            .with_flann_params(FlannParams {
                checks: usize::MAX,
                ..FlannParams::default()
            })
            .match_descriptors(&source, &reference)
            .unwrap();
        // ties may resolve to different rows, the distances must agree
        let distances = |matches: &[Match]| matches.iter().map(|m| m.distance).collect::<Vec<_>>();
        assert_eq!(distances(&brute), distances(&flann));

        let (Descriptors::Binary(native), wide) = (&source, source.widened()) else {
            unreachable!()
        };
        let Descriptors::Binary(other) = &reference else { unreachable!() };
        let wide_other = reference.widened();
        assert_eq!(
            binary_distance(native.row(3), other.row(7)) as f32,
            float_distance(DistanceMetric::Hamming, wide.row(3), wide_other.row(7))
        );
    }

    #[test]
    fn mismatched_representation_is_reported() {
        let matcher = DescriptorMatcher::new(MatcherKind::BruteForce, SelectorKind::BestSingle, Representation::Binary);
        let result = matcher.match_descriptors(&random_float(2, 4, 11), &random_float(2, 4, 12));
        assert!(matches!(
            result,
            Err(PipelineError::RepresentationMismatch {
                expected: Representation::Binary,
                found: Representation::Float
            })
        ));
    }
}
