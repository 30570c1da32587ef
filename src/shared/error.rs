// This is free and unencumbered software released into the public domain.

use derive_more::Display;
use std::{error::Error as StdError, io};
use thiserror::Error;

/// Machine-readable error code attached to every failure the session reports.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[display("ResourceError")]
    Resource,
    #[display("CameraError")]
    Camera,
    #[display("NotReadyError")]
    NotReady,
    #[display("NotSupportedFeatureError")]
    NotSupportedFeature,
    #[display("IOError")]
    Io,
    #[display("OutOfSpaceError")]
    OutOfSpace,
    #[display("FormatError")]
    Format,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Resource(String),

    #[error("{0}")]
    Camera(String),

    #[error("{0}")]
    NotReady(String),

    #[error("not supported: {0}")]
    NotSupportedFeature(String),

    #[error("{0}")]
    Format(String),

    #[error("camera actor is closed")]
    Closed,

    #[error("camera did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    #[inline]
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    #[inline]
    pub fn camera(msg: impl Into<String>) -> Self {
        Self::Camera(msg.into())
    }

    #[inline]
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    #[inline]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::NotSupportedFeature(msg.into())
    }

    #[inline]
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Resource(_) | Self::Closed | Self::Timeout(_) => ErrorCode::Resource,
            Self::Camera(_) => ErrorCode::Camera,
            Self::NotReady(_) => ErrorCode::NotReady,
            Self::NotSupportedFeature(_) => ErrorCode::NotSupportedFeature,
            Self::Format(_) => ErrorCode::Format,
            Self::Device(err) => err.code(),
            Self::Storage(err) => err.code(),
        }
    }
}

/// A failure reported by a native camera device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no camera device available")]
    NoCamera,

    #[error("camera {0} is already in use")]
    Busy(usize),

    #[error("camera permission denied")]
    PermissionDenied,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("device error while {context}")]
    Native {
        context: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    #[inline]
    pub fn native(context: &'static str, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Native {
            context,
            source: Box::new(source),
        }
    }

    #[inline]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    #[inline]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unsupported(_) => ErrorCode::NotSupportedFeature,
            Self::Busy(_) | Self::PermissionDenied => ErrorCode::Resource,
            _ => ErrorCode::Camera,
        }
    }
}

/// A failure while persisting a captured still.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file is not available: {0}")]
    Unavailable(#[source] io::Error),

    #[error("could not save to file: {0}")]
    Write(#[source] io::Error),

    #[error("not enough space to save the image")]
    OutOfSpace(#[source] io::Error),
}

impl StorageError {
    /// Classifies a write failure, separating a full disk from other I/O errors.
    pub fn from_write(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            Self::OutOfSpace(err)
        } else {
            Self::Write(err)
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable(_) => ErrorCode::Resource,
            Self::Write(_) => ErrorCode::Io,
            Self::OutOfSpace(_) => ErrorCode::OutOfSpace,
        }
    }
}
