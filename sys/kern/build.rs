// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

/// Largest table the environment id encoding can address (`abi::NENV`).
const NENV: usize = 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_kconfig()?;
    Ok(())
}

fn generate_kconfig() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=KERN_CONFIG");

    // The configuration is optional; a plain `cargo build` gets the defaults.
    let kconfig: KernelConfig = match env::var("KERN_CONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelConfig::default(),
        Err(e) => return Err(e.into()),
    };
    kconfig.validate()?;

    let out = &PathBuf::from(
        env::var_os("OUT_DIR").ok_or("OUT_DIR not set by cargo")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "/// Number of slots in the environment table.\n\
         pub const ENV_COUNT: usize = {};",
        kconfig.env_count
    )?;
    writeln!(
        file,
        "/// Number of lines retained by the kernel log ring.\n\
         pub const KLOG_DEPTH: usize = {};",
        kconfig.klog_depth
    )?;

    Ok(())
}

/// Kernel build configuration, passed as RON in `KERN_CONFIG`, e.g.
/// `(env_count: 256, klog_depth: 32)`.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KernelConfig {
    env_count: usize,
    klog_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            env_count: 64,
            klog_depth: 64,
        }
    }
}

impl KernelConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.env_count.is_power_of_two() || self.env_count > NENV {
            return Err(format!(
                "env_count must be a power of two no larger than {NENV}, \
                 got {}",
                self.env_count
            ));
        }
        if self.klog_depth == 0 {
            return Err("klog_depth must be nonzero".to_string());
        }
        Ok(())
    }
}
