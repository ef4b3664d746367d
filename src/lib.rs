#![doc = include_str!("../README.md")]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("stepdict tagged entry handles require a 64-bit target");

pub mod dict;
