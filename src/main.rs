//! fabric-emu: run kernel scenarios on the emulated accelerator fabric.

use std::env;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context};
use fabric_emu::apps::App;
use fabric_emu::verify::AppOutcome;
use fabric_emu::{Fabric, FabricConfig};

const USAGE: &str = "\
Usage: fabric-emu <app> [options]

Apps:
  axpy, kmeans, gemm, gemm-tiled, memset, dma-roundtrip, barrier-stress, hwpe
  all              run every app
  sample-config    print a sample configuration file

Options:
  --config FILE    read configuration from FILE instead of the default locations
  --clusters C     number of clusters
  --cores P        compute cores per cluster
  --no-streaming   disable operand streaming on compute cores";

fn flag_value<'a>(args: &mut impl Iterator<Item = &'a String>, flag: &str) -> anyhow::Result<&'a str> {
    args.next()
        .map(String::as_str)
        .with_context(|| format!("{} needs a value", flag))
}

fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut app_name = None;
    let mut config_path = None;
    let mut clusters = None;
    let mut cores = None;
    let mut streaming = true;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => config_path = Some(flag_value(&mut iter, arg)?),
            "--clusters" => clusters = Some(flag_value(&mut iter, arg)?.parse::<usize>().context("--clusters")?),
            "--cores" => cores = Some(flag_value(&mut iter, arg)?.parse::<usize>().context("--cores")?),
            "--no-streaming" => streaming = false,
            "-h" | "--help" => {
                println!("{}", USAGE);
                return Ok(ExitCode::SUCCESS);
            }
            other if other.starts_with('-') => bail!("unknown option {}\n\n{}", other, USAGE),
            other => app_name = Some(other),
        }
    }

    let Some(app_name) = app_name else {
        println!("{}", USAGE);
        return Ok(ExitCode::from(2));
    };

    if app_name == "sample-config" {
        print!("{}", FabricConfig::sample_config());
        return Ok(ExitCode::SUCCESS);
    }

    let apps: Vec<App> = if app_name == "all" {
        App::ALL.to_vec()
    } else {
        vec![app_name.parse()?]
    };

    let mut config = match config_path {
        Some(path) => FabricConfig::from_file(Path::new(path))?,
        None => FabricConfig::load(),
    };
    if let Some(c) = clusters {
        config.clusters = c;
    }
    if let Some(p) = cores {
        config.compute_cores = p;
    }
    if !streaming {
        config.streaming = false;
    }

    let fabric = Fabric::new(config)?;
    let topo = fabric.topology();
    println!(
        "Fabric: {} cluster(s) x {} compute core(s), streaming {}",
        topo.clusters,
        topo.compute_cores,
        if fabric.config().streaming { "on" } else { "off" }
    );
    println!();

    let mut total = AppOutcome::new(0, 0);
    for app in apps {
        let outcome = match app.run(&fabric) {
            Ok(outcome) => outcome,
            Err(e) => {
                println!("{:<16} ERROR  {}", app.name(), e);
                total = total + AppOutcome::new(1, 0);
                continue;
            }
        };
        println!(
            "{:<16} {}  {} error(s) / {} checked",
            app.name(),
            if outcome.passed() { "PASS " } else { "FAIL " },
            outcome.errors,
            outcome.checked
        );
        total = total + outcome;
    }

    Ok(ExitCode::from(total.exit_code() as u8))
}
