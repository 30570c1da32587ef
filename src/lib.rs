// This is free and unencumbered software released into the public domain.

#[cfg(not(feature = "std"))]
compile_error!("asimov-camera-session requires the 'std' feature");

extern crate alloc;

pub mod cli;
pub mod shared;
