//! Best-effort OS collaborators — spec.md §4.8 step 3: device
//! model/serial/firmware identification, MAC address enumeration, and
//! kernel ring-buffer capture. All three are explicitly out of scope for
//! the core engine's correctness (§1's "deliberately out of scope") but
//! are still gathered when available, gated by config flags, so the
//! archive's metadata segments are as complete as the original imager's.
//!
//! Grounded on `ident.cpp`'s `mac_addresses()`/`dmesg()`: both shell out
//! or read a well-known OS surface and tolerate total absence.

use std::process::Command;

/// Model/serial/firmware/capabilities a device identification probe can
/// contribute. Every field is best-effort; `None` means "could not be
/// determined," never an error.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub capabilities: Option<String>,
    pub cylinders: Option<u64>,
    pub heads: Option<u32>,
    pub sectors_per_track: Option<u32>,
}

pub trait DeviceIdent: Send {
    fn identify(&self, device_path: &str) -> DeviceIdentity;
}

/// No-op identifier, used for stream sources where none of this applies.
pub struct NoDeviceIdent;
impl DeviceIdent for NoDeviceIdent {
    fn identify(&self, _device_path: &str) -> DeviceIdentity {
        DeviceIdentity::default()
    }
}

pub trait MacAddressSource: Send {
    fn mac_addresses(&self) -> Vec<String>;
}

/// Reads `/sys/class/net/*/address` on Linux; returns an empty list
/// anywhere that path doesn't exist rather than erroring.
pub struct SysfsMacSource;
impl MacAddressSource for SysfsMacSource {
    fn mac_addresses(&self) -> Vec<String> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir("/sys/class/net") {
            Ok(e) => e,
            Err(_) => return out,
        };
        for entry in entries.flatten() {
            let addr_path = entry.path().join("address");
            if let Ok(addr) = std::fs::read_to_string(&addr_path) {
                let addr = addr.trim();
                if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                    out.push(addr.to_string());
                }
            }
        }
        out
    }
}

pub trait KernelLogSource: Send {
    fn kernel_log(&self) -> Option<String>;
}

/// Shells out to `dmesg`, matching `ident.cpp`'s
/// `popen("dmesg 2>/dev/null", "r")`. Returns `None` if the binary is
/// missing or the caller lacks permission — never an error.
pub struct DmesgSource;
impl KernelLogSource for DmesgSource {
    fn kernel_log(&self) -> Option<String> {
        let output = Command::new("dmesg").output().ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
