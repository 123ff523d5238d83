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

//! Kernel-module resolution: locating `.ko` files for a target kernel and
//! querying their dependencies through `modinfo`.

use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use crate::errors::{Error, Result};
use crate::util::cmd_output_raw;

/// Kernel modules are searched in `{KMOD_DIR}/{kernel}/**/*.ko`.
pub const KMOD_DIR: &str = "/lib/modules";

/// Module lookups and `modinfo` results, cached per kernel and per file.
#[derive(Default)]
pub struct KmodResolver {
    modules: HashMap<String, Vec<PathBuf>>,
    deps: HashMap<PathBuf, Vec<String>>,
}

impl KmodResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All modules installed for a kernel, in path order.
    fn all_kmods(&mut self, kernel: &str) -> &[PathBuf] {
        self.modules.entry(kernel.to_string()).or_insert_with(|| {
            WalkDir::new(format!("{KMOD_DIR}/{kernel}"))
                .sort_by(|a, b| a.file_name().cmp(b.file_name()))
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry.file_type().is_file()
                        && entry.path().extension().map_or(false, |ext| ext == "ko")
                })
                .map(|entry| entry.into_path())
                .collect()
        })
    }

    /// Search a kernel module on the system.  `_` and `-` are
    /// interchangeable in module names; an absolute path is returned as is.
    pub fn find_kmod(&mut self, module: &str, kernel: &str) -> Result<PathBuf> {
        debug!("Searching module {} for kernel {}", module, kernel);
        if module.starts_with('/') {
            return Ok(PathBuf::from(module));
        }
        let wanted = format!("{}.ko", module.replace('_', "-"));
        for kmod in self.all_kmods(kernel) {
            let name = kmod
                .file_name()
                .map(|name| name.to_string_lossy().replace('_', "-"))
                .unwrap_or_default();
            if name == wanted {
                debug!("Found module {}: {}", module, kmod.display());
                return Ok(kmod.clone());
            }
        }
        Err(Error::KmodMissing {
            module: module.to_string(),
            kernel: kernel.to_string(),
        })
    }

    /// Names of the modules a `.ko` file depends on, from
    /// `modinfo -0 -F depends`.  The field is NUL-separated between
    /// occurrences and comma-separated within one.
    pub fn find_kmod_deps(&mut self, path: &Path) -> Result<Vec<String>> {
        if let Some(cached) = self.deps.get(path) {
            return Ok(cached.clone());
        }
        let raw = cmd_output_raw(
            Command::new("modinfo")
                .arg("-0")
                .arg("-F")
                .arg("depends")
                .arg(path),
        )
        .map_err(|err| Error::ExternalTool(format!("{err:#}")))?;

        let mut deps = Vec::new();
        for field in String::from_utf8_lossy(&raw).split('\0') {
            for name in field.split(',') {
                let name = name.trim();
                if !name.is_empty() && !deps.iter().any(|dep| dep == name) {
                    deps.push(name.to_string());
                }
            }
        }
        debug!("Module {} depends on {:?}", path.display(), deps);
        self.deps.insert(path.to_path_buf(), deps.clone());
        Ok(deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_module_is_passed_through() {
        let mut resolver = KmodResolver::new();
        assert_eq!(
            resolver.find_kmod("/lib/modules/5.15.0/kernel/fs/ext4/ext4.ko", "5.15.0")
                .unwrap(),
            PathBuf::from("/lib/modules/5.15.0/kernel/fs/ext4/ext4.ko")
        );
    }

    #[test]
    fn missing_module_is_distinct_error() {
        let mut resolver = KmodResolver::new();
        assert!(matches!(
            resolver.find_kmod("no-such-module", "0.0.0-nonexistent"),
            Err(Error::KmodMissing { .. })
        ));
    }
}
