//! Sysfs-backed GPIO outputs.
//!
//! Thin binding from the relay engine's [`OutputWriter`] to the Linux GPIO
//! sysfs tree.  Pins are exported and set to output direction once at
//! construction; each write is a single value-file write.  The tree root is
//! configurable so tests can point it at a scratch directory.

use std::path::PathBuf;

use tc_core::relay::{OutputError, OutputWriter};
use tracing::info;

pub struct SysfsOutputs {
    root: PathBuf,
}

impl SysfsOutputs {
    /// Export `pins` under `root` and configure them as outputs.
    pub fn new(root: PathBuf, pins: impl IntoIterator<Item = u8>) -> std::io::Result<Self> {
        for pin in pins {
            let pin_dir = root.join(format!("gpio{pin}"));
            if !pin_dir.exists() {
                std::fs::write(root.join("export"), pin.to_string())?;
            }
            std::fs::write(pin_dir.join("direction"), "out")?;
            info!(pin, "output pin configured");
        }
        Ok(SysfsOutputs { root })
    }
}

impl OutputWriter for SysfsOutputs {
    fn write(&self, pin: u8, on: bool) -> Result<(), OutputError> {
        let value_path = self.root.join(format!("gpio{pin}")).join("value");
        std::fs::write(&value_path, if on { "1" } else { "0" }).map_err(|e| {
            OutputError::Write {
                pin,
                reason: e.to_string(),
            }
        })
    }
}
