//! Std-backed host capabilities for running `sleepy-core` off-target.

pub mod network;
pub mod platform;
pub mod storage {
    pub mod posix_fs;
}

pub use platform::HostPlatform;
