// This is free and unencumbered software released into the public domain.

#[cfg(not(feature = "std"))]
compile_error!("asimov-camera-cataloger requires the 'std' feature");

use asimov_camera_session::{
    cli,
    shared::{CameraConfig, DeviceListCache, SessionError, open_driver},
};
use asimov_module::SysexitsError::{self, *};
use clap::Parser;
use clientele::StandardOptions;
use serde_json::json;
use std::error::Error as StdError;

#[derive(Debug, Parser)]
struct Options {
    #[clap(flatten)]
    flags: StandardOptions,

    /// Camera driver to enumerate with
    #[arg(value_name = "NAME", short = 'd', long = "driver")]
    driver: Option<String>,

    #[arg(
        value_name = "FORMAT",
        short = 'o',
        long = "output",
        value_enum,
        default_value = "text"
    )]
    output: OutputFormat,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Jsonl,
}

pub fn main() -> Result<SysexitsError, Box<dyn StdError>> {
    asimov_module::dotenv().ok();
    let args = asimov_module::args_os()?;
    let options = Options::parse_from(args);

    if options.flags.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(EX_OK);
    }

    if options.flags.license {
        print!("{}", include_str!("../../UNLICENSE"));
        return Ok(EX_OK);
    }

    #[cfg(feature = "tracing")]
    asimov_module::init_tracing_subscriber(&options.flags).expect("failed to initialize logging");

    let exit_code = match run_cataloger(&options) {
        Ok(()) => EX_OK,
        Err(err) => cli::handle_error(&err, &options.flags),
    };

    Ok(exit_code)
}

fn run_cataloger(options: &Options) -> Result<(), SessionError> {
    let driver = open_driver(options.driver.as_deref(), CameraConfig::default())?;
    cli::info_user(
        &options.flags,
        &format!("enumerating cameras with the {} driver", driver.name()),
    );

    let cache = DeviceListCache::new(driver);
    let cameras = cache.get()?;
    if cameras.is_empty() {
        cli::warn_user(&options.flags, "no camera devices found");
        return Ok(());
    }

    for camera in cameras.iter() {
        match options.output {
            OutputFormat::Text => {
                println!("{}: {} ({})", camera.index, camera.name, camera.id);
            },
            OutputFormat::Jsonl => {
                println!(
                    "{}",
                    json!({
                        "index": camera.index,
                        "id": camera.id,
                        "name": camera.name,
                        "facing": format!("{:?}", camera.facing).to_lowercase(),
                        "orientation": camera.orientation,
                    })
                );
            },
        }
    }

    Ok(())
}
