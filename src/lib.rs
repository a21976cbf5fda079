#![forbid(unsafe_code)]

pub mod assets;
pub mod config;
pub mod fetch;
pub mod jobs;
pub mod metadata;
