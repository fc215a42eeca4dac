//! Randomized kd-tree forest for approximate nearest neighbour search over
//! descriptor rows, searched best-bin-first across all trees with a shared
//! budget of distance evaluations.

use std::{cmp::Ordering, collections::BinaryHeap};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::frame::DescriptorMatrix;

/// Search and construction parameters of the approximate matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlannParams {
    pub trees: usize,
    /// Distance evaluations per query before the search stops. `usize::MAX`
    /// makes the search exact.
    pub checks: usize,
    pub seed: u64,
}

impl Default for FlannParams {
    fn default() -> Self {
        Self {
            trees: 4,
            checks: 32,
            seed: 0x5eed,
        }
    }
}

/// Split dimensions are drawn among this many highest variance ones.
const RANDOM_DIMS: usize = 5;
/// Points used to estimate the variance at each node.
const VARIANCE_SAMPLES: usize = 100;

#[derive(Debug)]
enum Node {
    Leaf(Vec<usize>),
    Split {
        dim: usize,
        value: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Debug)]
struct Tree {
    nodes: Vec<Node>,
    root: usize,
}

impl Tree {
    fn build(rows: &DescriptorMatrix<f32>, rng: &mut StdRng) -> Self {
        let mut tree = Tree {
            nodes: Vec::new(),
            root: 0,
        };
        let mut indices = (0..rows.rows()).collect::<Vec<_>>();
        tree.root = tree.grow(rows, &mut indices, rng);
        tree
    }

    fn grow(&mut self, rows: &DescriptorMatrix<f32>, indices: &mut [usize], rng: &mut StdRng) -> usize {
        if indices.len() <= 1 {
            return self.push(Node::Leaf(indices.to_vec()));
        }
        let Some((dim, value)) = choose_split(rows, indices, rng) else {
            return self.push(Node::Leaf(indices.to_vec()));
        };

        // partition in place, values below the split first
        let mut boundary = 0;
        for i in 0..indices.len() {
            if rows.row(indices[i])[dim] < value {
                indices.swap(i, boundary);
                boundary += 1;
            }
        }
        if boundary == 0 || boundary == indices.len() {
            return self.push(Node::Leaf(indices.to_vec()));
        }

        let (below, above) = indices.split_at_mut(boundary);
        let left = self.grow(rows, below, rng);
        let right = self.grow(rows, above, rng);
        self.push(Node::Split { dim, value, left, right })
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

/// Random dimension among the highest variance ones, split at its mean.
/// `None` when every sampled point is identical.
fn choose_split(rows: &DescriptorMatrix<f32>, indices: &[usize], rng: &mut StdRng) -> Option<(usize, f32)> {
    let cols = rows.cols();
    let sample = &indices[..indices.len().min(VARIANCE_SAMPLES)];
    let count = sample.len() as f32;

    let mut mean = vec![0f32; cols];
    for &i in sample {
        mean.iter_mut().zip(rows.row(i)).for_each(|(m, v)| *m += v / count);
    }
    let mut variance = vec![0f32; cols];
    for &i in sample {
        variance
            .iter_mut()
            .zip(rows.row(i))
            .zip(&mean)
            .for_each(|((var, v), m)| *var += (v - m) * (v - m));
    }

    let mut dims = (0..cols).filter(|&d| variance[d] > 0.0).collect::<Vec<_>>();
    if dims.is_empty() {
        return None;
    }
    dims.sort_by(|&a, &b| variance[b].total_cmp(&variance[a]).then(a.cmp(&b)));
    dims.truncate(RANDOM_DIMS);
    let dim = dims[rng.gen_range(0..dims.len())];
    Some((dim, mean[dim]))
}

/// Unexplored branch, ordered so the heap pops the smallest bound first.
#[derive(Debug, Clone, Copy)]
struct Branch {
    bound: f32,
    tree: usize,
    node: usize,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .bound
            .total_cmp(&self.bound)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Nearest neighbours found so far, sorted by `(distance, index)`.
struct Candidates {
    k: usize,
    best: Vec<(usize, f32)>,
}

impl Candidates {
    fn insert(&mut self, index: usize, distance: f32) {
        let position = self
            .best
            .partition_point(|&(i, d)| d.total_cmp(&distance).then(i.cmp(&index)) == Ordering::Less);
        if position < self.k {
            self.best.insert(position, (index, distance));
            self.best.truncate(self.k);
        }
    }

    fn worst(&self) -> f32 {
        if self.best.len() < self.k {
            f32::INFINITY
        } else {
            self.best[self.best.len() - 1].1
        }
    }
}

pub struct KdForest<'a> {
    rows: &'a DescriptorMatrix<f32>,
    trees: Vec<Tree>,
}

impl<'a> KdForest<'a> {
    pub fn build(rows: &'a DescriptorMatrix<f32>, params: &FlannParams) -> Self {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let trees = (0..params.trees.max(1)).map(|_| Tree::build(rows, &mut rng)).collect();
        Self { rows, trees }
    }

    /// Up to `k` approximate nearest rows as `(index, distance)`, closest first.
    ///
    /// `distance` must be bounded below by the absolute difference along any
    /// single dimension, which holds for Euclidean distance and for Hamming
    /// distance on rows of zeros and ones.
    pub fn knn<F>(&self, query: &[f32], k: usize, checks: usize, distance: F) -> Vec<(usize, f32)>
    where
        F: Fn(&[f32], &[f32]) -> f32,
    {
        let mut found = Candidates {
            k,
            best: Vec::with_capacity(k + 1),
        };
        if k == 0 || self.rows.is_empty() {
            return found.best;
        }

        let mut visited = vec![false; self.rows.rows()];
        let mut checked = 0;
        let mut heap = BinaryHeap::new();
        for (tree, t) in self.trees.iter().enumerate() {
            heap.push(Branch {
                bound: 0.0,
                tree,
                node: t.root,
            });
        }

        while let Some(Branch { bound, tree, node }) = heap.pop() {
            if checked >= checks || bound > found.worst() {
                break;
            }
            let mut node = node;
            loop {
                match &self.trees[tree].nodes[node] {
                    Node::Split { dim, value, left, right } => {
                        let offset = query[*dim] - value;
                        let (near, far) = if offset < 0.0 { (*left, *right) } else { (*right, *left) };
                        heap.push(Branch {
                            bound: bound.max(offset.abs()),
                            tree,
                            node: far,
                        });
                        node = near;
                    }
                    Node::Leaf(points) => {
                        for &index in points {
                            if std::mem::replace(&mut visited[index], true) {
                                continue;
                            }
                            found.insert(index, distance(query, self.rows.row(index)));
                            checked += 1;
                        }
                        break;
                    }
                }
            }
        }
        found.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn euclidean(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
    }

    fn random_rows(count: usize, cols: usize, seed: u64) -> DescriptorMatrix<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = DescriptorMatrix::new(cols);
        for _ in 0..count {
            let row = (0..cols).map(|_| rng.gen_range(0.0..100.0)).collect::<Vec<f32>>();
            rows.push_row(&row);
        }
        rows
    }

    fn exhaustive(rows: &DescriptorMatrix<f32>, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut all = rows
            .iter_rows()
            .enumerate()
            .map(|(i, row)| (i, euclidean(query, row)))
            .collect::<Vec<_>>();
        all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        all.truncate(k);
        all
    }

    #[test]
    fn unlimited_checks_are_exact() {
        let rows = random_rows(300, 8, 3);
        let queries = random_rows(20, 8, 4);
        let forest = KdForest::build(&rows, &FlannParams::default());
        for query in queries.iter_rows() {
            assert_eq!(forest.knn(query, 2, usize::MAX, euclidean), exhaustive(&rows, query, 2));
        }
    }

    #[test]
    fn budget_limits_distance_evaluations_but_finds_exact_copies() {
        let rows = random_rows(500, 16, 5);
        let forest = KdForest::build(&rows, &FlannParams::default());
        for i in [0, 17, 250, 499] {
            let found = forest.knn(rows.row(i), 1, 32, euclidean);
            assert_eq!(found, vec![(i, 0.0)]);
        }
    }

    #[test]
    fn duplicate_rows_end_in_one_leaf() {
        let mut rows = DescriptorMatrix::new(2);
        for _ in 0..10 {
            rows.push_row(&[1.0, 1.0]);
        }
        let forest = KdForest::build(&rows, &FlannParams::default());
        let found = forest.knn(&[0.0, 0.0], 3, usize::MAX, euclidean);
        assert_eq!(found.iter().map(|f| f.0).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn k_larger_than_the_set_returns_every_row() {
        let rows = random_rows(3, 4, 9);
        let forest = KdForest::build(&rows, &FlannParams::default());
        assert_eq!(forest.knn(rows.row(0), 10, usize::MAX, euclidean).len(), 3);
    }

    #[test]
    fn branches_pop_smallest_bound_first() {
        let mut heap = BinaryHeap::new();
        for (bound, node) in [(3.0, 0), (0.5, 1), (2.0, 2)] {
            heap.push(Branch { bound, tree: 0, node });
        }
        assert_eq!(heap.pop().map(|b| b.node), Some(1));
        assert_eq!(heap.pop().map(|b| b.node), Some(2));
    }
}
