//! End-to-end scenarios: set up inputs in the global store, launch a
//! kernel on every core, and check the result against a golden model.

mod blas;
mod hwpe;
mod kmeans;
mod runtime;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::fabric::{Fabric, FabricError};
use crate::verify::AppOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown app '{0}'")]
pub struct UnknownApp(pub String);

/// A runnable scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum App {
    Axpy,
    Kmeans,
    Gemm,
    GemmTiled,
    Memset,
    DmaRoundtrip,
    BarrierStress,
    Hwpe,
}

impl App {
    pub const ALL: [App; 8] = [
        App::Axpy,
        App::Kmeans,
        App::Gemm,
        App::GemmTiled,
        App::Memset,
        App::DmaRoundtrip,
        App::BarrierStress,
        App::Hwpe,
    ];

    pub fn name(self) -> &'static str {
        match self {
            App::Axpy => "axpy",
            App::Kmeans => "kmeans",
            App::Gemm => "gemm",
            App::GemmTiled => "gemm-tiled",
            App::Memset => "memset",
            App::DmaRoundtrip => "dma-roundtrip",
            App::BarrierStress => "barrier-stress",
            App::Hwpe => "hwpe",
        }
    }

    /// Run the scenario on `fabric`. Host allocations of earlier runs are
    /// released first.
    pub fn run(self, fabric: &Fabric) -> Result<AppOutcome, FabricError> {
        fabric.global_reset();
        let outcome = match self {
            App::Axpy => blas::axpy(fabric)?,
            App::Kmeans => kmeans::kmeans(fabric)?,
            App::Gemm => blas::gemm(fabric)?,
            App::GemmTiled => blas::gemm_tiled(fabric)?,
            App::Memset => runtime::memset(fabric)?,
            App::DmaRoundtrip => runtime::dma_roundtrip(fabric)?,
            App::BarrierStress => runtime::barrier_stress(fabric)?,
            App::Hwpe => hwpe::hwpe(fabric)?,
        };
        log::info!(
            "{}: {} error(s) in {} checked value(s)",
            self.name(),
            outcome.errors,
            outcome.checked
        );
        Ok(outcome)
    }
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for App {
    type Err = UnknownApp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        App::ALL
            .into_iter()
            .find(|app| app.name() == s)
            .ok_or_else(|| UnknownApp(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FabricConfig;

    #[test]
    fn test_app_names_round_trip() {
        for app in App::ALL {
            assert_eq!(app.name().parse::<App>().unwrap(), app);
        }
        assert_eq!("fft".parse::<App>(), Err(UnknownApp("fft".to_string())));
    }

    #[test]
    fn test_all_apps_pass_on_default_fabric() {
        let fabric = Fabric::new(FabricConfig::default()).unwrap();
        for app in App::ALL {
            let outcome = app.run(&fabric).unwrap();
            assert!(outcome.passed(), "{}: {:?}", app, outcome);
            assert!(outcome.checked > 0, "{}", app);
        }
    }

    #[test]
    fn test_apps_without_streaming() {
        let fabric = Fabric::new(FabricConfig {
            streaming: false,
            ..FabricConfig::default()
        })
        .unwrap();
        for app in [App::Axpy, App::Gemm, App::GemmTiled] {
            assert!(app.run(&fabric).unwrap().passed(), "{}", app);
        }
    }
}
