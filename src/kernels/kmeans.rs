//! Lloyd's K-Means over the whole fabric.
//!
//! Samples are split across clusters and then across compute cores. Every
//! iteration has four phases:
//!
//! 1. **Assignment**: each core labels its samples with the nearest centroid
//!    and counts labels in its private counter slot.
//! 2. **Update**: each core sums its samples per label into its private
//!    centroid slot.
//! 3. **Reduction**: compute core 0 of each cluster folds its peers' slots
//!    into its own; after the inter-cluster barrier, core 0 of cluster 0 folds
//!    the other clusters' results into its slot, which is the common final
//!    buffer.
//! 4. **Normalize**: core 0 of cluster 0 divides each centroid by its count.
//!
//! After the closing global barrier every core reads the centroids from the
//! common buffer in cluster 0.

use crate::fabric::partition::{self, check_divisible};
use crate::fabric::{ClmAllocator, CoreContext, FabricError, ReductionBuffer, Topology, View};

/// Problem description. `samples` is `n_samples x n_features` doubles;
/// `centroids` holds the initial centroids and receives the final ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeansArgs {
    pub n_samples: u32,
    pub n_features: u32,
    pub n_clusters: u32,
    pub n_iter: u32,
    pub samples: u64,
    pub centroids: u64,
}

/// What normalization does with a centroid that received no samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmptyClusterPolicy {
    /// Keep the centroid from the previous iteration.
    #[default]
    KeepPrevious,
    /// Divide by zero anyway; the centroid becomes NaN.
    Propagate,
}

/// CLM placement of all K-Means buffers in one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeansLayout {
    pub samples_per_cluster: usize,
    pub local_samples: u64,
    pub local_centroids: u64,
    pub membership: u64,
    /// Per-core label counts; the common view is the final count.
    pub membership_cnt: ReductionBuffer,
    /// Per-core centroid sums; the common view is the final centroid set.
    pub centroids_acc: ReductionBuffer,
    /// Centroids of the previous iteration (used by cluster 0 only).
    pub previous: u64,
}

impl KMeansLayout {
    /// Place the buffers with `alloc`, in the same order on every core.
    pub fn new(alloc: &mut ClmAllocator, args: &KMeansArgs, clusters: usize) -> Result<Self, FabricError> {
        let samples_per_cluster = args.n_samples as usize / clusters;
        let f = args.n_features as u64;
        let k = args.n_clusters as u64;
        Ok(Self {
            samples_per_cluster,
            local_samples: alloc.alloc_aligned(View::ClusterPrivate, samples_per_cluster as u64 * f * 8)?,
            local_centroids: alloc.alloc(View::ClusterPrivate, k * f * 8)?,
            membership: alloc.alloc(View::ClusterPrivate, samples_per_cluster as u64 * 4)?,
            membership_cnt: alloc.alloc_reduction(k * 4)?,
            centroids_acc: alloc.alloc_reduction(k * f * 8)?,
            previous: alloc.alloc_aligned(View::ClusterPrivate, k * f * 8)?,
        })
    }

    /// Final label counts (cluster 0).
    pub fn final_counts(&self, topology: &Topology) -> u64 {
        self.membership_cnt.common(topology)
    }

    /// Final centroids (cluster 0).
    pub fn final_centroids(&self, topology: &Topology) -> u64 {
        self.centroids_acc.common(topology)
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn accumulate(counts: &mut [u32], sums: &mut [f64], other_counts: &[u32], other_sums: &[f64]) {
    counts.iter_mut().zip(other_counts).for_each(|(a, b)| *a += b);
    sums.iter_mut().zip(other_sums).for_each(|(a, b)| *a += b);
}

/// Run K-Means on every core.
pub fn kmeans(core: &CoreContext<'_>, args: &KMeansArgs, policy: EmptyClusterPolicy) -> Result<(), FabricError> {
    let topo = core.topology();
    let mem = core.memory();
    let (n_c, n_p) = (topo.clusters, topo.compute_cores);
    let f = args.n_features as usize;
    let k = args.n_clusters as usize;
    if f == 0 || k == 0 {
        return Err(FabricError::Precondition(
            "K-Means needs at least one feature and one centroid".to_string(),
        ));
    }
    check_divisible("K-Means sample count", args.n_samples as usize, n_c * n_p)?;

    let lay = KMeansLayout::new(&mut core.allocator(), args, n_c)?;
    let cluster = core.cluster_idx();
    let centroid_bytes = (k * f * 8) as u64;

    if core.is_dm_core() {
        let dma = core.dma()?;
        let size = (lay.samples_per_cluster * f * 8) as u64;
        dma.start_1d(lay.local_samples, args.samples + cluster as u64 * size, size)?;
        dma.start_1d(lay.local_centroids, args.centroids, centroid_bytes)?;
        dma.wait_all()?;
    }
    core.cluster_hw_barrier()?;

    let idx = core.cluster_core_idx();
    let samples = partition::core_range(lay.samples_per_cluster, topo, idx.min(n_p - 1));
    let my_cnt = lay.membership_cnt.slot(topo, cluster, idx);
    let my_acc = lay.centroids_acc.slot(topo, cluster, idx);
    let final_cnt = lay.final_counts(topo);
    let final_acc = lay.final_centroids(topo);
    let keep_previous = policy == EmptyClusterPolicy::KeepPrevious;
    let mut centroids_ptr = lay.local_centroids;

    for iter in 0..args.n_iter {
        if core.is_compute_core() {
            // Assignment
            let centroids = mem.read_f64s(centroids_ptr, k * f)?;
            let mut counts = vec![0u32; k];
            mem.write_u32s(my_cnt, &counts)?;
            core.fpu_fence();
            for s in samples.clone() {
                let sample = mem.read_f64s(lay.local_samples + (s * f * 8) as u64, f)?;
                let mut best = 0;
                let mut min_dist = f64::INFINITY;
                for (c, centroid) in centroids.chunks_exact(f).enumerate() {
                    let dist = squared_distance(&sample, centroid);
                    if dist < min_dist {
                        min_dist = dist;
                        best = c;
                    }
                }
                mem.write_u32(lay.membership + (s * 4) as u64, best as u32)?;
                counts[best] += 1;
            }
            mem.write_u32s(my_cnt, &counts)?;
        }

        core.global_barrier()?;

        if core.is_compute_core() {
            if keep_previous && cluster == 0 && idx == 0 {
                mem.copy(lay.previous, centroids_ptr, centroid_bytes)?;
            }

            // Update
            let mut sums = vec![0.0f64; k * f];
            for s in samples.clone() {
                let label = mem.read_u32(lay.membership + (s * 4) as u64)? as usize;
                let sample = mem.read_f64s(lay.local_samples + (s * f * 8) as u64, f)?;
                for (acc, x) in sums[label * f..(label + 1) * f].iter_mut().zip(&sample) {
                    *acc += x;
                }
            }
            mem.write_f64s(my_acc, &sums)?;
            core.fpu_fence();
        }

        // Partial sums of every core must be visible to core 0
        core.cluster_hw_barrier()?;

        if core.is_compute_core() && idx == 0 {
            // Intra-cluster reduction
            let mut counts = mem.read_u32s(my_cnt, k)?;
            let mut sums = mem.read_f64s(my_acc, k * f)?;
            for peer in 1..n_p {
                let peer_cnt = mem.read_u32s(lay.membership_cnt.slot(topo, cluster, peer), k)?;
                let peer_acc = mem.read_f64s(lay.centroids_acc.slot(topo, cluster, peer), k * f)?;
                accumulate(&mut counts, &mut sums, &peer_cnt, &peer_acc);
            }
            mem.write_u32s(my_cnt, &counts)?;
            mem.write_f64s(my_acc, &sums)?;

            core.inter_cluster_barrier()?;

            if cluster == 0 {
                // Inter-cluster reduction
                for remote in 1..n_c {
                    let remote_cnt = mem.read_u32s(topo.remote(my_cnt, 0, remote), k)?;
                    let remote_acc = mem.read_f64s(topo.remote(my_acc, 0, remote), k * f)?;
                    accumulate(&mut counts, &mut sums, &remote_cnt, &remote_acc);
                }
                mem.write_u32s(final_cnt, &counts)?;

                // Normalize
                let previous = if keep_previous {
                    mem.read_f64s(lay.previous, k * f)?
                } else {
                    Vec::new()
                };
                for (c, (&count, centroid)) in counts.iter().zip(sums.chunks_exact_mut(f)).enumerate() {
                    if count == 0 && keep_previous {
                        log::debug!("kmeans iter {}: centroid {} is empty, keeping it", iter, c);
                        centroid.copy_from_slice(&previous[c * f..(c + 1) * f]);
                    } else {
                        centroid.iter_mut().for_each(|x| *x /= count as f64);
                    }
                }
                mem.write_f64s(final_acc, &sums)?;
                log::trace!("kmeans iter {}: counts {:?}", iter, counts);
            }
        }

        core.global_barrier()?;
        centroids_ptr = final_acc;
    }

    core.cluster_hw_barrier()?;

    // Without iterations the staged initial centroids are the result
    if core.is_dm_core() && cluster == 0 {
        let dma = core.dma()?;
        dma.start_1d(args.centroids, centroids_ptr, centroid_bytes)?;
        dma.wait_all()?;
    }
    Ok(())
}
