//! k-d tree over particle positions for nearest-neighbour queries.
//!
//! The tree is immutable once built. It owns a copy of the positions,
//! velocities and masses of the particles it covers, which may be the whole
//! snapshot or one stride-partitioned shard of it; shard trees are
//! independent and self-contained, so they can be built concurrently.
//! Searching K shard trees instead of one full tree only approximates the
//! global neighbour result (see `smooth` for the rescaling applied).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::kernel::{CubicSpline, Kernel};

/// Total order wrapper for finite f64 distances.
#[derive(Clone, Copy, PartialEq)]
struct OrdF64(f64);

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Which per-particle field a populate pass computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopulateField {
    /// Smoothing length: half the radius enclosing the neighbour count.
    Smooth,
    /// SPH density: kernel-weighted neighbour mass sum.
    Rho,
}

struct Node {
    min: [f64; 3],
    max: [f64; 3],
    start: usize,
    end: usize,
    // usize::MAX marks a leaf
    left: usize,
    right: usize,
}

/// k-d tree with attached velocity and mass payload.
pub struct KdTree {
    pos: Vec<[f64; 3]>,
    vel: Vec<[f64; 3]>,
    mass: Vec<f64>,
    order: Vec<u32>,
    nodes: Vec<Node>,
    leafsize: usize,
}

const LEAF: usize = usize::MAX;

impl KdTree {
    /// Build a tree over the given particles.
    ///
    /// The three arrays must have equal length; local indices into the tree
    /// correspond to positions in these arrays.
    pub fn build(
        pos: Vec<[f64; 3]>,
        vel: Vec<[f64; 3]>,
        mass: Vec<f64>,
        leafsize: usize,
    ) -> Self {
        assert_eq!(pos.len(), vel.len());
        assert_eq!(pos.len(), mass.len());
        let leafsize = leafsize.max(1);
        let n = pos.len();
        let mut tree = KdTree {
            pos,
            vel,
            mass,
            order: (0..n as u32).collect(),
            nodes: Vec::new(),
            leafsize,
        };
        if n > 0 {
            tree.build_node(0, n);
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    pub fn positions(&self) -> &[[f64; 3]] {
        &self.pos
    }

    pub fn velocities(&self) -> &[[f64; 3]] {
        &self.vel
    }

    pub fn masses(&self) -> &[f64] {
        &self.mass
    }

    fn bounds(&self, start: usize, end: usize) -> ([f64; 3], [f64; 3]) {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for &i in &self.order[start..end] {
            let p = self.pos[i as usize];
            for a in 0..3 {
                min[a] = min[a].min(p[a]);
                max[a] = max[a].max(p[a]);
            }
        }
        (min, max)
    }

    /// Recursively build the node covering `order[start..end]`; returns its
    /// index in the node arena.
    fn build_node(&mut self, start: usize, end: usize) -> usize {
        let (min, max) = self.bounds(start, end);
        let idx = self.nodes.len();
        self.nodes.push(Node {
            min,
            max,
            start,
            end,
            left: LEAF,
            right: LEAF,
        });
        if end - start > self.leafsize {
            // Split the widest axis at the median particle.
            let mut axis = 0;
            for a in 1..3 {
                if max[a] - min[a] > max[axis] - min[axis] {
                    axis = a;
                }
            }
            let mid = (start + end) / 2;
            let pos = &self.pos;
            self.order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
                pos[a as usize][axis]
                    .partial_cmp(&pos[b as usize][axis])
                    .unwrap_or(Ordering::Equal)
            });
            let left = self.build_node(start, mid);
            let right = self.build_node(mid, end);
            self.nodes[idx].left = left;
            self.nodes[idx].right = right;
        }
        idx
    }

    fn dist2(a: [f64; 3], b: [f64; 3]) -> f64 {
        let dx = a[0] - b[0];
        let dy = a[1] - b[1];
        let dz = a[2] - b[2];
        dx * dx + dy * dy + dz * dz
    }

    fn box_dist2(node: &Node, q: [f64; 3]) -> f64 {
        let mut d2 = 0.0;
        for a in 0..3 {
            let d = if q[a] < node.min[a] {
                node.min[a] - q[a]
            } else if q[a] > node.max[a] {
                q[a] - node.max[a]
            } else {
                0.0
            };
            d2 += d * d;
        }
        d2
    }

    /// The `k` nearest particles to `query`, as (squared distance, local
    /// index) pairs in no particular order. The query point itself counts
    /// if it is in the tree.
    pub fn nearest(&self, query: [f64; 3], k: usize) -> Vec<(f64, u32)> {
        let mut heap: BinaryHeap<(OrdF64, u32)> = BinaryHeap::with_capacity(k + 1);
        if !self.nodes.is_empty() {
            self.search(0, query, k, &mut heap);
        }
        heap.into_iter().map(|(d, i)| (d.0, i)).collect()
    }

    fn search(&self, node_idx: usize, q: [f64; 3], k: usize, heap: &mut BinaryHeap<(OrdF64, u32)>) {
        let node = &self.nodes[node_idx];
        if heap.len() == k && OrdF64(Self::box_dist2(node, q)) >= heap.peek().unwrap().0 {
            return;
        }
        if node.left == LEAF {
            for &i in &self.order[node.start..node.end] {
                let d2 = Self::dist2(self.pos[i as usize], q);
                if heap.len() < k {
                    heap.push((OrdF64(d2), i));
                } else if OrdF64(d2) < heap.peek().unwrap().0 {
                    heap.pop();
                    heap.push((OrdF64(d2), i));
                }
            }
            return;
        }
        // Descend the nearer child first so pruning bites sooner.
        let (l, r) = (node.left, node.right);
        let dl = Self::box_dist2(&self.nodes[l], q);
        let dr = Self::box_dist2(&self.nodes[r], q);
        let (first, second) = if dl <= dr { (l, r) } else { (r, l) };
        self.search(first, q, k, heap);
        self.search(second, q, k, heap);
    }

    /// Fill `out[j]` for every particle `j` in this tree.
    ///
    /// For [`PopulateField::Smooth`] the value is half the distance to the
    /// `nn`-th nearest neighbour. For [`PopulateField::Rho`] the value is
    /// the spline-kernel-weighted mass of the `nn` nearest neighbours,
    /// using the smoothing lengths in `smooth` (indexed like `out`).
    pub fn populate(
        &self,
        out: &mut [f64],
        field: PopulateField,
        nn: usize,
        smooth: Option<&[f64]>,
    ) {
        assert_eq!(out.len(), self.len());
        let nn = nn.min(self.len()).max(1);
        let spline = CubicSpline::new();
        for j in 0..self.len() {
            let neigh = self.nearest(self.pos[j], nn);
            match field {
                PopulateField::Smooth => {
                    let r2 = neigh.iter().map(|&(d2, _)| d2).fold(0.0, f64::max);
                    out[j] = 0.5 * r2.sqrt();
                }
                PopulateField::Rho => {
                    let h = smooth.expect("density pass needs smoothing lengths")[j];
                    let h3 = h * h * h;
                    let mut rho = 0.0;
                    for &(d2, i) in &neigh {
                        rho += self.mass[i as usize] * spline.value(d2.sqrt() / h) / h3;
                    }
                    out[j] = rho;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, seed: u64) -> Vec<[f64; 3]> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()])
            .collect()
    }

    fn brute_knn(pos: &[[f64; 3]], q: [f64; 3], k: usize) -> Vec<f64> {
        let mut d: Vec<f64> = pos.iter().map(|&p| KdTree::dist2(p, q)).collect();
        d.sort_by(|a, b| a.partial_cmp(b).unwrap());
        d.truncate(k);
        d
    }

    #[test]
    fn test_knn_matches_brute_force() {
        let pos = random_points(500, 7);
        let vel = vec![[0.0; 3]; 500];
        let mass = vec![1.0; 500];
        let tree = KdTree::build(pos.clone(), vel, mass, 8);

        for &q in &pos[..20] {
            let mut got: Vec<f64> = tree.nearest(q, 12).iter().map(|&(d, _)| d).collect();
            got.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let want = brute_knn(&pos, q, 12);
            for (g, w) in got.iter().zip(want.iter()) {
                assert_relative_eq!(*g, *w, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_smooth_is_half_kth_distance() {
        let pos = random_points(200, 3);
        let vel = vec![[0.0; 3]; 200];
        let mass = vec![1.0; 200];
        let tree = KdTree::build(pos.clone(), vel, mass, 4);

        let mut sm = vec![0.0; 200];
        tree.populate(&mut sm, PopulateField::Smooth, 16, None);

        for j in [0usize, 50, 199] {
            let want = 0.5 * brute_knn(&pos, pos[j], 16).last().unwrap().sqrt();
            assert_relative_eq!(sm[j], want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_density_positive_and_scales_with_mass() {
        let pos = random_points(300, 11);
        let vel = vec![[0.0; 3]; 300];
        let tree1 = KdTree::build(pos.clone(), vel.clone(), vec![1.0; 300], 8);
        let tree2 = KdTree::build(pos, vel, vec![2.0; 300], 8);

        let mut sm = vec![0.0; 300];
        tree1.populate(&mut sm, PopulateField::Smooth, 32, None);

        let mut rho1 = vec![0.0; 300];
        let mut rho2 = vec![0.0; 300];
        tree1.populate(&mut rho1, PopulateField::Rho, 32, Some(&sm));
        tree2.populate(&mut rho2, PopulateField::Rho, 32, Some(&sm));

        for j in 0..300 {
            assert!(rho1[j] > 0.0);
            assert_relative_eq!(rho2[j], 2.0 * rho1[j], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_empty_tree() {
        let tree = KdTree::build(Vec::new(), Vec::new(), Vec::new(), 8);
        assert!(tree.is_empty());
        assert!(tree.nearest([0.0; 3], 5).is_empty());
    }
}
