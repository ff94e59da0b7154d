//! fabric-emu library
//!
//! Software model of a clustered many-core accelerator fabric: compute
//! cores and one DMA core per cluster, cluster-local memories, bulk DMA,
//! barriers and a matrix engine, plus the SPMD kernels that run on it.

pub mod apps;
pub mod config;
pub mod dma;
pub mod fabric;
pub mod hwpe;
pub mod kernels;
pub mod verify;

pub use config::FabricConfig;
pub use fabric::{CoreContext, CoreId, Fabric, FabricError, Topology};
