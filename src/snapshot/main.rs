// This is free and unencumbered software released into the public domain.

#[cfg(not(feature = "std"))]
compile_error!("asimov-camera-snapshot requires the 'std' feature");

use asimov_camera_session::{
    cli,
    shared::{
        CameraConfig, CameraSession, CameraState, CaptureId, CaptureOptions, DirectoryStorage,
        HeadlessVideoOutput, ImageQuality, ImageSettings, SessionConfig, SessionError,
        SessionEvent, Size, VideoOutput, open_driver,
    },
};
use asimov_module::SysexitsError::{self, *};
use clap::Parser;
use clientele::StandardOptions;
use know::traits::ToJsonLd;
use std::{
    error::Error as StdError,
    io::{self, Write},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Parser)]
struct Options {
    #[clap(flatten)]
    flags: StandardOptions,

    /// Camera driver (defaults to the platform's)
    #[arg(long)]
    driver: Option<String>,

    /// Input device, e.g. `file:/dev/video0`
    #[arg(long)]
    device: Option<String>,

    /// Index of the camera to open
    #[arg(short = 'c', long = "camera", default_value = "0")]
    camera: usize,

    #[arg(short, long = "size", value_parser = parse_dimensions, default_value = "640x480")]
    size: (u32, u32),

    /// Stills to take before exiting
    #[arg(short = 'n', long = "count", default_value = "1")]
    count: u32,

    /// Stills per second when taking more than one
    #[arg(short, long, value_parser = parse_frequency, default_value = "1")]
    frequency: f64,

    /// Also save each still into this directory
    #[arg(short = 'O', long = "output-dir")]
    output_dir: Option<PathBuf>,

    #[arg(short = 'q', long = "quality", value_enum, default_value = "normal")]
    quality: Quality,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Quality {
    VeryLow,
    Low,
    Normal,
    High,
    VeryHigh,
}

impl From<Quality> for ImageQuality {
    fn from(q: Quality) -> Self {
        match q {
            Quality::VeryLow => ImageQuality::VeryLow,
            Quality::Low => ImageQuality::Low,
            Quality::Normal => ImageQuality::Normal,
            Quality::High => ImageQuality::High,
            Quality::VeryHigh => ImageQuality::VeryHigh,
        }
    }
}

const READY_TIMEOUT: Duration = Duration::from_secs(15);

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

    let exit_code = match run_snapshot(&options) {
        Ok(()) => EX_OK,
        Err(err) => cli::handle_error(&err, &options.flags),
    };

    Ok(exit_code)
}

fn run_snapshot(opts: &Options) -> Result<(), SessionError> {
    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = Arc::clone(&quit);
        ctrlc::set_handler(move || quit.store(true, Ordering::SeqCst))
            .map_err(|e| SessionError::resource(format!("{e}")))?;
    }

    let (width, height) = opts.size;
    let mut camera_config = CameraConfig::new(width, height, 30.0)
        .with_diagnostics(opts.flags.debug || opts.flags.verbose >= 3);
    if let Some(device) = opts.device.as_deref() {
        camera_config = camera_config.with_device(device);
    }
    let driver = open_driver(opts.driver.as_deref(), camera_config)?;

    let storage_dir = opts.output_dir.clone().unwrap_or_else(std::env::temp_dir);
    let storage = Arc::new(DirectoryStorage::new(storage_dir));

    let settings = ImageSettings::default()
        .with_resolution(Size::new(width, height))
        .with_quality(opts.quality.into());
    let config = SessionConfig::from_env()
        .with_camera_index(opts.camera)
        .with_image_settings(settings);

    let session = CameraSession::new(driver, config, storage)?;
    let output: Arc<dyn VideoOutput> = Arc::new(HeadlessVideoOutput::new());
    session.bind_video_output(&output);
    session.set_state(CameraState::Active);

    wait_until_ready(&session, &quit)?;
    let source = session
        .camera_info()
        .map(|info| info.id)
        .unwrap_or_else(|| session.driver_name());
    cli::info_user(&opts.flags, &format!("camera ready: {source}"));

    let interval = Duration::from_secs_f64(1.0 / opts.frequency);
    let options = CaptureOptions {
        file_name: None,
        to_file: opts.output_dir.is_some(),
        to_buffer: true,
    };

    for n in 0..opts.count {
        if quit.load(Ordering::SeqCst) {
            break;
        }
        let started = Instant::now();
        if n > 0 {
            wait_until_ready(&session, &quit)?;
        }

        let id = session.capture(options.clone());
        if !collect_capture(&session, id, &options, &source, opts, &quit)? {
            break;
        }

        let elapsed = started.elapsed();
        if n + 1 < opts.count && elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    session.close();
    Ok(())
}

fn wait_until_ready(session: &CameraSession, quit: &AtomicBool) -> Result<(), SessionError> {
    let deadline = Instant::now() + READY_TIMEOUT;
    while !session.is_ready_for_capture() {
        if quit.load(Ordering::SeqCst) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SessionError::not_ready("camera did not become ready in time"));
        }
        match session.events().recv_timeout(Duration::from_millis(100)) {
            Ok(SessionEvent::Error { code, message }) => {
                return Err(SessionError::camera(format!("{code}: {message}")));
            },
            Ok(_) | Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => return Err(SessionError::Closed),
        }
    }
    Ok(())
}

/// Waits for every delivery `options` asked for. Returns `false` when stdout is gone.
fn collect_capture(
    session: &CameraSession,
    id: CaptureId,
    options: &CaptureOptions,
    source: &str,
    opts: &Options,
    quit: &AtomicBool,
) -> Result<bool, SessionError> {
    let mut need_buffer = options.to_buffer;
    let mut need_file = options.to_file;
    let deadline = Instant::now() + READY_TIMEOUT;

    while need_buffer || need_file {
        if quit.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if Instant::now() >= deadline {
            return Err(SessionError::resource(format!("capture {id} did not complete")));
        }
        let event = match session.events().recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err(SessionError::Closed),
        };
        match event {
            SessionEvent::ImageAvailable { id: got, frame } if got == id => {
                need_buffer = false;
                let img = know::classes::Image {
                    id: Some(format!("{source}#{id}")),
                    width: Some(frame.width as _),
                    height: Some(frame.height as _),
                    data: frame.data.to_vec(),
                    source: Some(source.to_string()),
                };
                let json = img
                    .to_jsonld()
                    .map_err(|e| SessionError::format(format!("{e}")))?;
                let mut out = io::stdout().lock();
                if let Err(err) = writeln!(&mut out, "{json}") {
                    if err.kind() == io::ErrorKind::BrokenPipe {
                        return Ok(false);
                    }
                }
            },
            SessionEvent::ImageSaved { id: got, path } if got == id => {
                need_file = false;
                cli::info_user(&opts.flags, &format!("saved {}", path.display()));
            },
            SessionEvent::ImageCaptureError { id: got, code, message } if got == id => {
                return Err(SessionError::resource(format!("{code}: {message}")));
            },
            SessionEvent::Error { code, message } => {
                cli::warn_user(&opts.flags, &format!("{code}: {message}"));
            },
            _ => {},
        }
    }
    Ok(true)
}

fn parse_dimensions(s: &str) -> Result<(u32, u32), String> {
    let s = s.trim().replace('×', "x");
    let parts: Vec<&str> = s.split('x').map(str::trim).collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(format!("Invalid format '{s}'. Use WxH (e.g., 1920x1080)"));
    }

    let width: u32 = parts[0].parse().map_err(|_| format!("Invalid width: {}", parts[0]))?;
    let height: u32 = parts[1].parse().map_err(|_| format!("Invalid height: {}", parts[1]))?;

    if !(160..=7680).contains(&width) {
        return Err(format!("Width {width} is out of reasonable range (160-7680)"));
    }
    if !(120..=4320).contains(&height) {
        return Err(format!("Height {height} is out of reasonable range (120-4320)"));
    }

    Ok((width, height))
}

fn parse_frequency(s: &str) -> Result<f64, String> {
    let freq: f64 = s.parse().map_err(|_| format!("Invalid frequency: {s}"))?;
    if !(0.01..=30.0).contains(&freq) {
        return Err(format!("Frequency {freq} Hz is outside 0.01-30 Hz"));
    }
    Ok(freq)
}
