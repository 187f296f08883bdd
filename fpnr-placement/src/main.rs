use std::path::PathBuf;

use anyhow::{Context, Result};
use fpnr_common::{design::Design, device::Device};
use fpnr_placement::{
    config::Config,
    error::PlacementError,
    pipeline::{place, placed_units, NullSink, PlacedUnit, PlacementReport},
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
struct Args {
    device_file: PathBuf,
    design_file: PathBuf,
    config_file: Option<PathBuf>,
    output_file: PathBuf,
    strict_clock_check: bool,
    iterations: Option<usize>,
}

fn parse_args() -> Result<Args> {
    use clap::{App, Arg};
    let matches = App::new("FPNR Placer")
        .version(env!("CARGO_PKG_VERSION"))
        .author(clap::crate_authors!())
        .about("Packs and places a netlist onto an FPGA device")
        .arg(
            Arg::with_name("DEVICE")
                .help("Device description (JSON)")
                .index(1)
                .required(true),
        )
        .arg(
            Arg::with_name("DESIGN")
                .help("Design netlist (JSON)")
                .index(2)
                .required(true),
        )
        .arg(
            Arg::with_name("OUTPUT")
                .help("Output file location")
                .index(3)
                .required(true),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .help("Placement configuration (JSON)"),
        )
        .arg(
            Arg::with_name("iterations")
                .long("iterations")
                .short('n')
                .takes_value(true)
                .help("Global placement iteration budget, overriding the configuration"),
        )
        .arg(
            Arg::with_name("strict")
                .long("strict")
                .help("Fail when a clock region exceeds its clock budget"),
        )
        .get_matches();

    let path = |name: &str| matches.value_of_os(name).map(PathBuf::from);
    let iterations = matches
        .value_of("iterations")
        .map(|n| n.parse::<usize>())
        .transpose()
        .context("Parse --iterations")?;

    Ok(Args {
        device_file: path("DEVICE").context("Missing DEVICE")?,
        design_file: path("DESIGN").context("Missing DESIGN")?,
        config_file: path("config"),
        output_file: path("OUTPUT").context("Missing OUTPUT")?,
        strict_clock_check: matches.is_present("strict"),
        iterations,
    })
}

/// Merge the configuration document with the command line overrides. The iteration budget
/// comes from `--iterations` or the document; there is no fallback.
fn resolve_config(
    document: Option<serde_json::Value>,
    iterations: Option<usize>,
    strict_clock_check: bool,
) -> Result<Config> {
    let mut config = match (document, iterations) {
        (Some(mut value), iterations) => {
            if let (Some(n), Some(object)) = (iterations, value.as_object_mut()) {
                object.insert("global_iterations".into(), n.into());
            }
            Config::from_json(&value).context("Validate configuration")?
        }
        (None, Some(n)) => Config::with_iterations(n),
        (None, None) => {
            return Err(PlacementError::MissingConfig("global_iterations"))
                .context("Pass --iterations or a configuration file");
        }
    };
    config.strict_clock_check |= strict_clock_check;
    config.validate().context("Validate configuration")?;
    Ok(config)
}

#[derive(Serialize)]
struct Output<'a> {
    units: Vec<PlacedUnit>,
    report: &'a PlacementReport,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    let device: Device = fpnr_common::load_json(&args.device_file).context("Load device")?;
    let design: Design = fpnr_common::load_json(&args.design_file).context("Load design")?;
    let document = args
        .config_file
        .as_ref()
        .map(|path| fpnr_common::load_json(path).context("Load configuration"))
        .transpose()?;
    let config = resolve_config(document, args.iterations, args.strict_clock_check)?;

    log::info!(
        "Placing {} cells on a {}x{} device",
        design.cells().len(),
        device.width,
        device.height
    );
    let (state, report) = place(&config, &device, &design, &mut NullSink)?;

    let outf = std::fs::File::create(&args.output_file)
        .with_context(|| format!("Failed to create {:?}", args.output_file))?;
    serde_json::to_writer_pretty(
        std::io::BufWriter::new(outf),
        &Output {
            units: placed_units(&state),
            report: &report,
        },
    )
    .context("Write placement")?;

    Ok(())
}
