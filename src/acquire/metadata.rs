//! Fixed segment names persisted into the archive's flat metadata
//! namespace — spec.md §6.4. Kept as constants so a typo doesn't silently
//! split a value across two segment names.

pub const SEG_COMMAND_LINE: &str = "acquisition_command_line";
pub const SEG_DEVICE: &str = "acquisition_device";
pub const SEG_DEVICE_SECTORS: &str = "device_sectors";
pub const SEG_DEVICE_MANUFACTURER: &str = "device_manufacturer";
pub const SEG_DEVICE_MODEL: &str = "device_model";
pub const SEG_DEVICE_SERIAL: &str = "device_serial";
pub const SEG_DEVICE_FIRMWARE: &str = "device_firmware";
pub const SEG_DEVICE_CAPABILITIES: &str = "device_capabilities";
pub const SEG_CYLINDERS: &str = "cylinders";
pub const SEG_HEADS: &str = "heads";
pub const SEG_SECTORS_PER_TRACK: &str = "sectors_per_track";
pub const SEG_MAC_ADDRESSES: &str = "acquisition_mac_addresses";
pub const SEG_KERNEL_LOG: &str = "acquisition_kernel_log";
pub const SEG_ACQUISITION_DATE: &str = "acquisition_date";
pub const SEG_ACQUISITION_SECONDS: &str = "acquisition_seconds";
pub const SEG_BAD_SECTORS: &str = "bad_sectors_count";
pub const SEG_BLANK_SECTORS: &str = "blank_sectors_count";
pub const SEG_MD5: &str = "md5";
pub const SEG_SHA1: &str = "sha1";
pub const SEG_SHA256: &str = "sha256";
pub const SEG_CASE_NUMBER: &str = "case_number";
pub const SEG_TECHNICIAN: &str = "technician";

/// Every digest segment, for the "delete if `hash_invalid`" step of
/// §4.8's finalize.
pub const DIGEST_SEGMENTS: [&str; 3] = [SEG_MD5, SEG_SHA1, SEG_SHA256];
