//! Platform-specific event sources

#[cfg(target_os = "linux")]
pub mod linux;
