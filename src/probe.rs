/*!
 * Device Probe - Hardware Capability Detection
 *
 * Reads the core count and installed memory of the host so the admission
 * controller can size its rendering-context pool. Handheld devices are capped
 * hard regardless of their specs because their compositors drop contexts far
 * earlier than desktops do.
 */

use serde::Serialize;
use sysinfo::System;
use warden_core_resilience::{
    AdmissionConfig, DeviceClass, CONSTRAINED_MAX_CORES, CONSTRAINED_MAX_MEMORY_GIB,
};

/// Environment variable that forces the form factor (`mobile` or `desktop`)
pub const FORM_FACTOR_ENV: &str = "WARDEN_FORM_FACTOR";

/// Hardware profile of the current device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    /// Number of logical CPU cores
    pub logical_cores: usize,

    /// Total system memory in GiB
    pub total_memory_gib: u64,

    /// Available memory in GiB at probe time
    pub available_memory_gib: u64,

    /// Handheld heuristic result (or override)
    pub is_mobile: bool,

    /// Derived capability class
    pub class: DeviceClass,
}

impl DeviceProfile {
    /// Build a profile from raw numbers and an optional form-factor override
    pub fn from_parts(
        logical_cores: usize,
        total_memory_gib: u64,
        available_memory_gib: u64,
        form_factor: Option<&str>,
    ) -> Self {
        let logical_cores = logical_cores.max(1);
        let is_mobile = match form_factor.map(|f| f.trim().to_ascii_lowercase()) {
            Some(f) if f == "mobile" || f == "handheld" => true,
            Some(f) if f == "desktop" => false,
            _ => {
                logical_cores <= CONSTRAINED_MAX_CORES
                    && total_memory_gib <= CONSTRAINED_MAX_MEMORY_GIB
            }
        };
        let class = DeviceClass::from_capabilities(logical_cores, total_memory_gib, is_mobile);

        Self {
            logical_cores,
            total_memory_gib,
            available_memory_gib,
            is_mobile,
            class,
        }
    }

    /// Admission limits for this device
    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig::for_device(self.logical_cores, self.total_memory_gib, self.is_mobile)
    }
}

/// Device probing utility
pub struct DeviceProbe;

impl DeviceProbe {
    /// Scan the host and build a profile
    pub fn scan() -> DeviceProfile {
        let mut sys = System::new_all();
        sys.refresh_all();

        let logical_cores = sys.cpus().len();
        let total_memory_gib = sys.total_memory() / 1024 / 1024 / 1024;
        let available_memory_gib = sys.available_memory() / 1024 / 1024 / 1024;
        let form_factor = std::env::var(FORM_FACTOR_ENV).ok();

        let profile = DeviceProfile::from_parts(
            logical_cores,
            total_memory_gib,
            available_memory_gib,
            form_factor.as_deref(),
        );

        tracing::debug!(
            cores = profile.logical_cores,
            memory_gib = profile.total_memory_gib,
            mobile = profile.is_mobile,
            class = ?profile.class,
            "Device probed"
        );

        profile
    }
}
