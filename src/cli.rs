// This is free and unencumbered software released into the public domain.

//! CLI helpers shared by the binaries (error reporting, verbosity handling).
//!
//! Compiles to no-ops without the `cli` feature so the library still links
//! in embedded configurations.

#[cfg(feature = "cli")]
use crate::shared::{DeviceError, SessionError, StorageError};

#[cfg(feature = "cli")]
use asimov_module::SysexitsError::{self, *};

#[cfg(feature = "cli")]
use clientele::StandardOptions;

#[cfg(feature = "cli")]
pub fn handle_error(err: &SessionError, flags: &StandardOptions) -> SysexitsError {
    #[cfg(feature = "tracing")]
    {
        use asimov_module::tracing::{debug, error};

        error!(target: "asimov_camera_session", %err, code = %err.code(), "camera command failed");

        if flags.debug || flags.verbose >= 2 {
            debug!(target: "asimov_camera_session", ?err, "detailed error");
        }
    }

    report_error(err, flags);
    map_error_to_sysexit(err)
}

#[cfg(feature = "cli")]
pub fn info_user(flags: &StandardOptions, msg: &str) {
    if flags.debug || flags.verbose >= 1 {
        eprintln!("INFO: {msg}");
    }

    #[cfg(feature = "tracing")]
    asimov_module::tracing::info!(target: "asimov_camera_session", "{msg}");
}

#[cfg(feature = "cli")]
pub fn warn_user(flags: &StandardOptions, msg: &str) {
    if flags.debug || flags.verbose >= 1 {
        eprintln!("WARN: {msg}");
    }

    #[cfg(feature = "tracing")]
    asimov_module::tracing::warn!(target: "asimov_camera_session", "{msg}");
}

#[cfg(feature = "cli")]
fn report_error(err: &SessionError, flags: &StandardOptions) {
    use std::error::Error as _;
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "ERROR: {err}");

    if flags.debug || flags.verbose >= 2 {
        let mut source = err.source();
        while let Some(cause) = source {
            let _ = writeln!(stderr, "  Caused by: {cause}");
            source = cause.source();
        }
    }
}

#[cfg(feature = "cli")]
pub fn map_error_to_sysexit(err: &SessionError) -> SysexitsError {
    match err {
        SessionError::Device(err) => match err {
            DeviceError::NoCamera => EX_USAGE,
            DeviceError::Busy(_) => EX_TEMPFAIL,
            DeviceError::PermissionDenied => EX_NOPERM,
            DeviceError::Unsupported(_) => EX_UNAVAILABLE,
            DeviceError::Native { .. } | DeviceError::Other(_) => EX_SOFTWARE,
        },
        SessionError::Storage(err) => match err {
            StorageError::Unavailable(_) => EX_CANTCREAT,
            StorageError::Write(_) | StorageError::OutOfSpace(_) => EX_IOERR,
        },
        SessionError::NotReady(_) | SessionError::Timeout(_) => EX_TEMPFAIL,
        SessionError::NotSupportedFeature(_) => EX_UNAVAILABLE,
        SessionError::Format(_) => EX_DATAERR,
        SessionError::Resource(_) => EX_UNAVAILABLE,
        SessionError::Camera(_) | SessionError::Closed => EX_SOFTWARE,
    }
}

#[cfg(not(feature = "cli"))]
#[inline]
pub fn info_user(_msg: &str) {}

#[cfg(not(feature = "cli"))]
#[inline]
pub fn warn_user(_msg: &str) {}
