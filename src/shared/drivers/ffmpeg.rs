// This is free and unencumbered software released into the public domain.

//! A camera read through an `ffmpeg` child process emitting raw RGB frames.

use crate::shared::{
    CameraConfig, CameraDriver, CameraFacing, CameraInfo, DeviceCapabilities, DeviceError,
    DeviceEvents, DeviceParameters, DeviceResult, FpsRange, Frame, NativeCameraDevice,
    NativeHandle, PixelFormat, PreviewTarget, Size,
};
use alloc::borrow::Cow;
use bytes::Bytes;
use dogma::Named;
use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};
use std::{
    env,
    io::Read,
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

#[derive(Clone, Debug, Default)]
pub struct FfmpegCameraDriver {
    config: CameraConfig,
}

impl FfmpegCameraDriver {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }
}

impl Named for FfmpegCameraDriver {
    fn name(&self) -> Cow<'_, str> {
        "ffmpeg".into()
    }
}

impl CameraDriver for FfmpegCameraDriver {
    fn cameras(&self) -> DeviceResult<Vec<CameraInfo>> {
        let mut cameras = list_input_devices()?;
        if let Some(device) = self.config.device.as_deref() {
            // An explicitly configured device always appears first.
            cameras.retain(|c| c.id != device);
            cameras.insert(0, camera_info(0, device.to_string(), device.to_string()));
        }
        for (index, camera) in cameras.iter_mut().enumerate() {
            camera.index = index;
        }
        Ok(cameras)
    }

    fn open(&self, index: usize, events: DeviceEvents) -> DeviceResult<Box<dyn NativeCameraDevice>> {
        let info = match self.cameras()?.into_iter().find(|c| c.index == index) {
            Some(info) => info,
            None if index == 0 => {
                let fallback = default_device_fallback();
                camera_info(0, fallback.clone(), fallback)
            },
            None => return Err(DeviceError::NoCamera),
        };

        let size = Size::new(self.config.width, self.config.height);
        let fps = self.config.fps.round().clamp(1.0, 240.0) as u32;
        let capabilities = DeviceCapabilities {
            preview_sizes: vec![size],
            picture_sizes: vec![size],
            preferred_preview_size_for_video: Some(size),
            preview_formats: vec![PixelFormat::Rgb8],
            fps_ranges: vec![FpsRange { min: fps, max: fps }],
        };
        let parameters = DeviceParameters {
            preview_size: size,
            preview_format: PixelFormat::Rgb8,
            preview_fps: capabilities.fps_ranges.first().copied(),
            picture_size: size,
            jpeg_quality: 80,
            rotation: 0,
            display_orientation: 0,
        };
        let config = self.config.clone().with_device(info.id.clone());
        debug!(target: "asimov_camera_session", index, device = %info.id, "ffmpeg camera opened");

        Ok(Box::new(FfmpegCameraDevice {
            info,
            capabilities,
            parameters,
            config,
            events,
            child: None,
            stop: Arc::new(AtomicBool::new(false)),
            reader_join: None,
            last_frame: Arc::new(Mutex::new(None)),
            notify: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct FfmpegCameraDevice {
    info: CameraInfo,
    capabilities: DeviceCapabilities,
    parameters: DeviceParameters,
    config: CameraConfig,
    events: DeviceEvents,
    child: Option<Child>,
    stop: Arc<AtomicBool>,
    reader_join: Option<JoinHandle<()>>,
    last_frame: Arc<Mutex<Option<Frame>>>,
    notify: Arc<AtomicBool>,
}

impl FfmpegCameraDevice {
    fn spawn_reader(&mut self) -> DeviceResult<()> {
        if self.child.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::Relaxed);

        let mut child = spawn_ffmpeg(&self.config)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::other("ffmpeg stdout not piped"))?;

        let width = self.config.width;
        let height = self.config.height;
        let stride = width.saturating_mul(3);
        let frame_size = (stride as usize).saturating_mul(height as usize);

        let stop = Arc::clone(&self.stop);
        let notify = Arc::clone(&self.notify);
        let last_frame = Arc::clone(&self.last_frame);
        let events = self.events.clone();

        let join = thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn(move || {
                let mut reader = std::io::BufReader::new(stdout);
                while !stop.load(Ordering::Relaxed) {
                    let mut buf = vec![0u8; frame_size];
                    match reader.read_exact(&mut buf) {
                        Ok(()) => {
                            let frame = Frame::new_rgb8(Bytes::from(buf), width, height, stride)
                                .with_timestamp_ns(now_ns_best_effort());
                            if notify.load(Ordering::Relaxed) {
                                events.new_preview_frame(&frame);
                            }
                            *last_frame.lock().unwrap_or_else(|p| p.into_inner()) = Some(frame);
                        },
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => {
                            events.error(DeviceError::native("ffmpeg read", e));
                            break;
                        },
                    }
                }
            });

        match join {
            Ok(join) => {
                self.reader_join = Some(join);
                self.child = Some(child);
                Ok(())
            },
            Err(e) => {
                stop_child(child);
                Err(DeviceError::native("spawning ffmpeg reader", e))
            },
        }
    }

    fn stop_reader(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(child) = self.child.take() {
            stop_child(child);
        }
        if let Some(join) = self.reader_join.take() {
            let _ = join.join();
        }
    }
}

impl NativeCameraDevice for FfmpegCameraDevice {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn parameters(&self) -> DeviceParameters {
        self.parameters.clone()
    }

    fn set_parameters(&mut self, params: &DeviceParameters) -> DeviceResult<()> {
        let size = params.preview_size;
        if size.is_valid() && !self.capabilities.preview_sizes.contains(&size) {
            return Err(DeviceError::unsupported(format!("preview size {size}")));
        }
        if params.preview_format != PixelFormat::Rgb8 {
            return Err(DeviceError::unsupported(format!(
                "preview format {:?}",
                params.preview_format
            )));
        }
        self.parameters = params.clone();
        Ok(())
    }

    fn set_preview_target(&mut self, _target: PreviewTarget) -> DeviceResult<()> {
        Ok(())
    }

    fn start_preview(&mut self) -> DeviceResult<()> {
        self.spawn_reader()
    }

    fn stop_preview(&mut self) {
        self.stop_reader();
    }

    fn take_picture(&mut self) -> DeviceResult<()> {
        let frame = self
            .last_frame
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| DeviceError::other("no frame has been read yet"))?;
        let rotation = self.parameters.rotation;
        let quality = self.parameters.jpeg_quality.clamp(1, 100);
        let events = self.events.clone();

        thread::Builder::new()
            .name("ffmpeg-still".into())
            .spawn(move || {
                events.picture_exposed();
                match encode_still(&frame, rotation, quality) {
                    Ok(jpeg) => events.picture_captured(jpeg),
                    Err(err) => events.take_picture_failed(err),
                }
            })
            .map_err(|e| DeviceError::native("spawning still encoder", e))?;
        Ok(())
    }

    fn last_preview_frame(&mut self) -> Option<Frame> {
        self.last_frame.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn notify_new_frames(&mut self, enabled: bool) {
        self.notify.store(enabled, Ordering::Relaxed);
    }

    fn lock(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Frees the device node so another process can open it.
    fn unlock(&mut self) -> DeviceResult<()> {
        self.stop_reader();
        Ok(())
    }

    fn reconnect(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn recorder_handle(&self) -> NativeHandle {
        NativeHandle::new(get_input_device(&self.info.id))
    }

    fn release(&mut self) {
        self.stop_reader();
        debug!(target: "asimov_camera_session", device = %self.info.id, "ffmpeg camera released");
    }
}

impl Drop for FfmpegCameraDevice {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[inline]
fn now_ns_best_effort() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn encode_still(frame: &Frame, rotation: u32, quality: u8) -> DeviceResult<Bytes> {
    let img = frame
        .to_image()
        .map_err(|e| DeviceError::other(e.to_string()))?;
    let img = match rotation {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img,
    };
    let rgb = img.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode(&rgb, rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| DeviceError::native("encoding still", e))?;
    Ok(Bytes::from(jpeg))
}

fn stop_child(mut child: Child) {
    #[cfg(unix)]
    {
        unsafe {
            let _ = libc::kill(child.id() as i32, libc::SIGTERM);
        }
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(900) {
            if let Ok(Some(_)) = child.try_wait() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_ffmpeg(config: &CameraConfig) -> DeviceResult<Child> {
    let device = config.device.as_deref().unwrap_or("").trim();
    let input_device = get_input_device(device);
    let framerate = config.fps.round().clamp(1.0, 240.0) as u32;

    let mut ffargs: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-nostats".into(),
        "-f".into(),
        ffmpeg_format().into(),
        "-loglevel".into(),
        "error".into(),
        "-video_size".into(),
        format!("{}x{}", config.width, config.height),
        "-framerate".into(),
        framerate.to_string(),
    ];

    #[cfg(target_os = "macos")]
    {
        ffargs.push("-pixel_format".into());
        ffargs.push("0rgb".into());
    }

    ffargs.extend([
        "-i".into(),
        input_device,
        "-pix_fmt".into(),
        "rgb24".into(),
        "-f".into(),
        "rawvideo".into(),
        "pipe:1".into(),
    ]);

    let stderr = if config.diagnostics || env::var_os("ASIMOV_CAMERA_FFMPEG_STDERR").is_some() {
        Stdio::inherit()
    } else {
        Stdio::null()
    };

    Command::new("ffmpeg")
        .args(&ffargs)
        .stdout(Stdio::piped())
        .stderr(stderr)
        .spawn()
        .map_err(|e| DeviceError::native("spawning ffmpeg", e))
}

fn camera_info(index: usize, id: String, name: String) -> CameraInfo {
    CameraInfo {
        index,
        id,
        name,
        facing: CameraFacing::Back,
        orientation: 0,
    }
}

fn default_device_fallback() -> String {
    #[cfg(target_os = "macos")]
    {
        "avf:0".to_string()
    }
    #[cfg(target_os = "windows")]
    {
        "dshow:video=default".to_string()
    }
    #[cfg(target_os = "linux")]
    {
        "file:/dev/video0".to_string()
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        String::new()
    }
}

#[cfg(target_os = "macos")]
fn ffmpeg_format() -> &'static str {
    "avfoundation"
}

#[cfg(target_os = "windows")]
fn ffmpeg_format() -> &'static str {
    "dshow"
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn ffmpeg_format() -> &'static str {
    "v4l2"
}

#[cfg(target_os = "macos")]
fn get_input_device(device: &str) -> String {
    device.strip_prefix("avf:").unwrap_or(device).to_string()
}

#[cfg(target_os = "windows")]
fn get_input_device(device: &str) -> String {
    device.strip_prefix("dshow:").unwrap_or(device).to_string()
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn get_input_device(device: &str) -> String {
    let d = device.strip_prefix("file:").unwrap_or(device);
    if d.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{d}")
    } else {
        d.to_string()
    }
}

#[cfg(target_os = "linux")]
fn list_input_devices() -> DeviceResult<Vec<CameraInfo>> {
    use std::{fs, path::Path};

    let base = Path::new("/sys/class/video4linux");
    let Ok(dir) = fs::read_dir(base) else {
        return Ok(Vec::new());
    };

    let mut nodes: Vec<u32> = dir
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.strip_prefix("video")?.parse().ok())
        .collect();
    nodes.sort_unstable();

    let mut out = Vec::new();
    for node in nodes {
        let devnode = format!("/dev/video{node}");
        if !Path::new(&devnode).exists() {
            continue;
        }
        let sys_entry = base.join(format!("video{node}"));
        let name = fs::read_to_string(sys_entry.join("name"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| devnode.clone());
        let name = if linux_device_is_usb(&sys_entry) {
            format!("{name} [usb]")
        } else {
            name
        };
        out.push(camera_info(out.len(), format!("file:{devnode}"), name));
    }
    Ok(out)
}

#[cfg(target_os = "linux")]
fn linux_device_is_usb(sys_entry: &std::path::Path) -> bool {
    let device_link = sys_entry.join("device");
    let Ok(mut p) = std::fs::read_link(&device_link) else {
        return false;
    };
    if !p.is_absolute() {
        p = device_link.join(p);
    }
    if let Ok(canon) = p.canonicalize() {
        p = canon;
    }
    p.to_string_lossy().contains("/usb")
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn list_input_devices() -> DeviceResult<Vec<CameraInfo>> {
    #[cfg(target_os = "macos")]
    let (args, prefix) = (["-hide_banner", "-f", "avfoundation", "-list_devices", "true", "-i", ""], "avf:");
    #[cfg(target_os = "windows")]
    let (args, prefix) = (["-hide_banner", "-f", "dshow", "-list_devices", "true", "-i", "dummy"], "dshow:video=");

    let out = Command::new("ffmpeg")
        .args(args)
        .output()
        .map_err(|e| DeviceError::native("running ffmpeg -list_devices", e))?;
    let stderr = String::from_utf8_lossy(&out.stderr);

    Ok(parse_device_list(&stderr)
        .into_iter()
        .enumerate()
        .map(|(index, (key, name))| camera_info(index, format!("{prefix}{key}"), name))
        .collect())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn list_input_devices() -> DeviceResult<Vec<CameraInfo>> {
    Ok(Vec::new())
}

/// Extracts `(input key, display name)` pairs from ffmpeg's device listing.
///
/// AVFoundation lines look like `[...] [0] FaceTime HD Camera`, DirectShow
/// lines like `[...] "USB Camera" (video)`. Audio devices are skipped.
#[cfg_attr(not(any(target_os = "macos", target_os = "windows", test)), allow(dead_code))]
fn parse_device_list(listing: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut in_video = false;

    for line in listing.lines() {
        if line.contains("video devices") {
            in_video = true;
            continue;
        }
        if line.contains("audio devices") {
            in_video = false;
            continue;
        }

        let tail = line.find("] ").map(|pos| line[pos + 2..].trim()).unwrap_or("");
        if let Some(rest) = tail.strip_prefix('"') {
            // DirectShow marks the device kind after the name.
            let Some(end) = rest.find('"') else { continue };
            let name = &rest[..end];
            if !name.is_empty() && rest[end..].contains("(video)") {
                out.push((name.to_string(), name.to_string()));
            }
        } else if in_video {
            let Some(rest) = tail.strip_prefix('[') else { continue };
            let Some(end) = rest.find(']') else { continue };
            let Ok(idx) = rest[..end].trim().parse::<u32>() else {
                continue;
            };
            let name = rest[end + 1..].trim();
            if !name.is_empty() {
                out.push((idx.to_string(), name.to_string()));
            }
        }
    }

    if out.is_empty() {
        warn!(target: "asimov_camera_session", "ffmpeg listed no video devices");
    }
    out
}
