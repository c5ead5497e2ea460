#[cfg(target_os = "linux")]
use std::fs;

use crate::pal::Platform;

/// The operating system that the build is targeting.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetPlatform;

pub(crate) static BUILD_TARGET_PLATFORM: BuildTargetPlatform = BuildTargetPlatform;

// Exercised by integration tests on the real operating system only.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Platform for BuildTargetPlatform {
    #[cfg(target_os = "linux")]
    fn process_status_contents(&self) -> Option<String> {
        fs::read_to_string("/proc/self/status").ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn process_status_contents(&self) -> Option<String> {
        None
    }
}
