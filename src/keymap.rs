// Copyright 2022 initramgen contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Binary keymap generation through `loadkeys --bkeymap`.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs;
use std::path::Path;
use std::process::Command;

use crate::util::cmd_output_raw;

/// Magic prefix of a binary keymap, as produced by `loadkeys --bkeymap`
/// and consumed by busybox `loadkmap`.
pub const BKEYMAP_MAGIC: &[u8] = b"bkeymap";

/// Convert a keymap (layout name or file path) into the binary form
/// `loadkmap` reads, and write it to `dest`.
pub fn keymap_build(src: &str, dest: &Path, unicode: bool) -> Result<()> {
    debug!("Building binary keymap from {} to {}", src, dest.display());
    let keymap = cmd_output_raw(
        Command::new("loadkeys")
            .arg(if unicode { "--unicode" } else { "--ascii" })
            .arg("--bkeymap")
            .arg(src),
    )?;
    if !keymap.starts_with(BKEYMAP_MAGIC) {
        bail!("loadkeys produced data without the bkeymap magic for {src}");
    }
    fs::write(dest, keymap).with_context(|| format!("writing {}", dest.display()))?;
    Ok(())
}
