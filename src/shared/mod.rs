// This is free and unencumbered software released into the public domain.

mod actor;

mod cache;
pub use cache::*;

mod capture;
pub use capture::*;

mod config;
pub use config::*;

mod device;
pub use device::*;

pub mod drivers {
    #[cfg(feature = "ffmpeg")]
    pub mod ffmpeg;

    pub mod synthetic;
}

mod error;
pub use error::*;

mod events;
pub use events::*;

mod frame;
pub use frame::*;

mod open;
pub use open::*;

mod orientation;
pub use orientation::*;

mod pending;
pub use pending::*;

mod probes;
pub use probes::*;

mod session;
pub use session::*;

mod settings;
pub use settings::*;

mod storage;
pub use storage::*;

mod video_output;
pub use video_output::*;
