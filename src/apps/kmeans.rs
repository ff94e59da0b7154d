//! K-Means on two well-separated blobs.

use crate::fabric::{CoreId, Fabric, FabricError};
use crate::kernels::kmeans::{kmeans as kmeans_kernel, EmptyClusterPolicy, KMeansArgs, KMeansLayout};
use crate::verify::{count_mismatches, kmeans_golden, AppOutcome, Tolerance};

const N_SAMPLES: usize = 64;
const N_FEATURES: usize = 2;
const N_CLUSTERS: usize = 2;
const N_ITER: usize = 3;
const TOLERANCE: Tolerance = Tolerance { abs: 1e-12, rel: 1e-10 };

/// Samples alternate between (0, 0) and (10, 10), displaced by
/// `(+d, -d)` and `(-d, +d)` in turn so every blob's mean is its centre.
fn samples() -> Vec<f64> {
    (0..N_SAMPLES)
        .flat_map(|i| {
            let centre = if i % 2 == 0 { 0.0 } else { 10.0 };
            let d = if (i / 2) % 2 == 0 { 0.5 } else { -0.5 };
            [centre + d, centre - d]
        })
        .collect()
}

pub fn kmeans(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let policy = EmptyClusterPolicy::default();
    let samples = samples();
    let initial = [1.0, 1.0, 9.0, 9.0];
    let args = KMeansArgs {
        n_samples: N_SAMPLES as u32,
        n_features: N_FEATURES as u32,
        n_clusters: N_CLUSTERS as u32,
        n_iter: N_ITER as u32,
        samples: fabric.upload_f64s(&samples)?,
        centroids: fabric.upload_f64s(&initial)?,
    };

    fabric.launch(|core| kmeans_kernel(core, &args, policy))?;

    let golden = kmeans_golden(&samples, N_FEATURES, &initial, N_ITER, policy);
    let centroids = fabric.memory().read_f64s(args.centroids, N_CLUSTERS * N_FEATURES)?;
    let mut errors = count_mismatches(&centroids, &golden.centroids, TOLERANCE);

    // Membership counts of the last iteration stay in cluster 0's CLM
    let layout = KMeansLayout::new(&mut fabric.clm_allocator(CoreId::new(0, 0)), &args, fabric.topology().clusters)?;
    let counts = fabric.memory().read_u32s(layout.final_counts(fabric.topology()), N_CLUSTERS)?;
    errors += counts.iter().zip(&golden.counts).filter(|(a, b)| a != b).count();
    log::debug!("kmeans: centroids {:?}, counts {:?}", centroids, counts);

    Ok(AppOutcome::new(errors, centroids.len() + counts.len()))
}
