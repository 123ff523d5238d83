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

//! Loader-faithful binary resolution.
//!
//! Executables are searched through `PATH`, libraries through
//! `LD_LIBRARY_PATH`, `ld.so.conf` and the default library directories,
//! and ELF dependencies through the dynamic section the way the runtime
//! loader would walk it (`DT_RPATH`, `LD_LIBRARY_PATH`, `DT_RUNPATH`,
//! `ld.so.conf`, default libdirs, honoring `DF_1_NODEFLIB`).

use glob::Pattern;
use goblin::elf::Elf;
use log::debug;
use nix::unistd::{access, AccessFlags};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::{Error, PathContext, Result};
use crate::util::{normpath, parent_dir, strip_prefix_str};

/// OSABI values considered interchangeable on Linux:
/// ELFOSABI_NONE/SYSV (0) and ELFOSABI_GNU/LINUX (3).
const COMPAT_OSABI: [u8; 2] = [0, 3];

/// Index of the OSABI byte in `e_ident`.
const EI_OSABI: usize = 7;

/// DT_FLAGS_1 bit: do not search the default library directories.
const DF_1_NODEFLIB: u64 = 0x0800;

/// The aspects of an ELF identity the loader checks before accepting a
/// candidate: class, endianness, machine and operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfInfo {
    pub class64: bool,
    pub little_endian: bool,
    pub machine: u16,
    pub osabi: u8,
}

impl ElfInfo {
    fn of(elf: &Elf) -> Self {
        ElfInfo {
            class64: elf.is_64,
            little_endian: elf.little_endian,
            machine: elf.header.e_machine,
            osabi: elf.header.e_ident[EI_OSABI],
        }
    }

    pub fn compatible(&self, other: &ElfInfo) -> bool {
        (self.osabi == other.osabi
            || (COMPAT_OSABI.contains(&self.osabi) && COMPAT_OSABI.contains(&other.osabi)))
            && self.class64 == other.class64
            && self.little_endian == other.little_endian
            && self.machine == other.machine
    }
}

/// What a candidate path turned out to be.
enum Probe {
    Unreadable,
    NotElf,
    Elf(ElfInfo),
}

fn probe(path: &str) -> Probe {
    match fs::read(path) {
        Err(_) => Probe::Unreadable,
        Ok(buf) => match Elf::parse(&buf) {
            Err(_) => Probe::NotElf,
            Ok(elf) => Probe::Elf(ElfInfo::of(&elf)),
        },
    }
}

/// Where a search directory came from; drives the destination rule and the
/// `DF_1_NODEFLIB` skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirOrigin {
    RPath,
    LdLibraryPath,
    RunPath,
    LdSoConf,
    Default,
}

/// Binary resolver rooted at a host directory.  All lookup results are
/// memoized; create one resolver per build.
pub struct Resolver {
    root: String,
    cwd: String,
    machine: String,
    ld_library_path: Option<String>,
    exec_path: Option<String>,
    conf_cache: HashMap<String, Vec<String>>,
    libdir_cache: Option<Vec<String>>,
    dep_cache: HashMap<PathBuf, Vec<(PathBuf, String)>>,
    compat_cache: Option<ElfInfo>,
}

impl Resolver {
    pub fn new(root: &Path) -> Self {
        let machine = nix::sys::utsname::uname()
            .map(|uts| uts.machine().to_string_lossy().into_owned())
            .unwrap_or_default();
        Resolver {
            root: normpath(&root.to_string_lossy()),
            cwd: env::current_dir()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "/".to_string()),
            machine,
            ld_library_path: env::var("LD_LIBRARY_PATH").ok(),
            exec_path: env::var("PATH").ok(),
            conf_cache: HashMap::new(),
            libdir_cache: None,
            dep_cache: HashMap::new(),
            compat_cache: None,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Expand the loader's `$ORIGIN`, `$LIB` and `$PLATFORM` substitutions.
    fn expand(&self, path: &str, origin: &str) -> String {
        let lib = if cfg!(target_pointer_width = "64") {
            "lib64"
        } else {
            "lib"
        };
        path.replace("$ORIGIN", origin)
            .replace("${ORIGIN}", origin)
            .replace("$LIB", lib)
            .replace("${LIB}", lib)
            .replace("$PLATFORM", &self.machine)
            .replace("${PLATFORM}", &self.machine)
    }

    /// Parse a colon-delimited path list and apply ldso rules: an empty
    /// element is the current working directory, substitutions are applied,
    /// absolute paths are re-rooted under the resolver root.
    fn parse_ld_path(&self, ld_path: &str, origin: &str) -> Vec<String> {
        let mut dirs = Vec::new();
        for path in ld_path.split(':') {
            if path.is_empty() {
                dirs.push(normpath(&self.cwd));
            } else {
                let mut path = self.expand(path, origin);
                if path.starts_with('/') {
                    path = format!("{}/{}", self.root, path);
                }
                dirs.push(normpath(&path));
            }
        }
        dirs
    }

    /// `PATH` parsed the same way, without substitutions.
    fn parse_path_var(&self) -> Vec<String> {
        let path = match &self.exec_path {
            Some(path) => path,
            None => return Vec::new(),
        };
        path.split(':')
            .map(|dir| {
                if dir.is_empty() {
                    normpath(&self.cwd)
                } else {
                    normpath(&format!("{}/{}", self.root, dir))
                }
            })
            .collect()
    }

    /// Parse `ld.so.conf`, following `include` lines recursively.  Results
    /// are cached per file.
    fn ld_so_conf(&mut self, conf_path: Option<&str>) -> Result<Vec<String>> {
        let conf_path = match conf_path {
            Some(path) => path.to_string(),
            None => {
                let default = normpath(&format!("{}/etc/ld.so.conf", self.root));
                if !Path::new(&default).is_file() {
                    return Ok(Vec::new());
                }
                default
            }
        };
        if let Some(cached) = self.conf_cache.get(&conf_path) {
            return Ok(cached.clone());
        }
        debug!("Parsing ld.so.conf {}", conf_path);

        let mut dirs = Vec::new();
        let contents = fs::read_to_string(&conf_path).path_ctx(&conf_path)?;
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(pattern) = line.strip_prefix("include ") {
                let pattern = if pattern.starts_with('/') {
                    pattern.to_string()
                } else {
                    format!("{}/{}", parent_dir(&conf_path), pattern)
                };
                let mut matches: Vec<PathBuf> = glob::glob(&pattern)
                    .map_err(|err| Error::ConfigInvalid(format!("bad include {pattern}: {err}")))?
                    .filter_map(|entry| entry.ok())
                    .collect();
                matches.sort();
                for path in matches {
                    dirs.extend(self.ld_so_conf(Some(&normpath(&path.to_string_lossy())))?);
                }
            } else {
                dirs.push(normpath(&format!("{}/{}", self.root, line)));
            }
        }
        self.conf_cache.insert(conf_path, dirs.clone());
        Ok(dirs)
    }

    /// Default library directories existing under the root, in loader
    /// preference order.
    fn default_libdirs(&mut self) -> Vec<String> {
        if let Some(cached) = &self.libdir_cache {
            return cached.clone();
        }
        let mut dirs = Vec::new();
        for lib in ["lib64", "lib", "lib32"] {
            for prefix in ["/", "/usr/"] {
                let path = normpath(&format!("{}{}{}", self.root, prefix, lib));
                if Path::new(&path).exists() {
                    dirs.push(path);
                }
            }
        }
        self.libdir_cache = Some(dirs.clone());
        dirs
    }

    /// Initramfs libdir matching an ELF class.
    fn libdir_for(&self, class64: bool) -> &'static str {
        if class64 && Path::new(&format!("{}/lib64", self.root)).exists() {
            "/lib64"
        } else if !class64 && Path::new(&format!("{}/lib32", self.root)).exists() {
            "/lib32"
        } else {
            "/lib"
        }
    }

    /// Identity of the reference binary (`<root>/bin/sh`) used for
    /// compatibility checks of executables and libraries.
    fn compat_info(&mut self) -> Result<ElfInfo> {
        if let Some(info) = self.compat_cache {
            return Ok(info);
        }
        let path = normpath(&format!("{}/bin/sh", self.root));
        let info = match probe(&path) {
            Probe::Elf(info) => info,
            Probe::NotElf => {
                return Err(Error::Io {
                    path: PathBuf::from(path),
                    source: io::Error::new(io::ErrorKind::InvalidData, "not an ELF file"),
                })
            }
            Probe::Unreadable => {
                let source = fs::read(&path)
                    .err()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unreadable"));
                return Err(Error::Io {
                    path: PathBuf::from(path),
                    source,
                });
            }
        };
        self.compat_cache = Some(info);
        Ok(info)
    }

    /// Transitive-free ELF dependency resolution: the direct dependencies of
    /// `src`, each resolved to a `(host path, initramfs path)` pair.  A file
    /// that is not an ELF yields an empty list; an unresolvable dependency
    /// is an error.  Results are memoized per realpath.
    pub fn find_elf_deps(&mut self, src: &Path) -> Result<Vec<(PathBuf, String)>> {
        let real = fs::canonicalize(src).path_ctx(src)?;
        if let Some(cached) = self.dep_cache.get(&real) {
            return Ok(cached.clone());
        }
        debug!("Searching ELF dependencies for {}", real.display());

        let buf = fs::read(&real).path_ctx(&real)?;
        let deps = match Elf::parse(&buf) {
            Ok(elf) => self.resolve_deps(&elf, &real)?,
            Err(_) => Vec::new(),
        };
        self.dep_cache.insert(real, deps.clone());
        Ok(deps)
    }

    fn resolve_deps(&mut self, elf: &Elf, real: &Path) -> Result<Vec<(PathBuf, String)>> {
        let origin = parent_dir(&real.to_string_lossy());
        let info = ElfInfo::of(elf);

        let mut needed: Vec<String> = Vec::new();
        if let Some(interp) = elf.interpreter {
            debug!("INTERP: {}", interp);
            needed.push(interp.to_string());
        }
        for lib in &elf.libraries {
            needed.push(self.expand(lib, &origin));
        }
        let nodeflib = elf
            .dynamic
            .as_ref()
            .map_or(false, |dynamic| dynamic.info.flags_1 & DF_1_NODEFLIB != 0);

        // Search order: DT_RPATH, LD_LIBRARY_PATH, DT_RUNPATH, ld.so.conf,
        // default library directories.
        let mut search: Vec<(String, DirOrigin)> = Vec::new();
        for rpath in &elf.rpaths {
            for dir in self.parse_ld_path(rpath, &origin) {
                search.push((dir, DirOrigin::RPath));
            }
        }
        if let Some(ld_path) = self.ld_library_path.clone() {
            for dir in self.parse_ld_path(&ld_path, &origin) {
                search.push((dir, DirOrigin::LdLibraryPath));
            }
        }
        for runpath in &elf.runpaths {
            for dir in self.parse_ld_path(runpath, &origin) {
                search.push((dir, DirOrigin::RunPath));
            }
        }
        for dir in self.ld_so_conf(None)? {
            search.push((dir, DirOrigin::LdSoConf));
        }
        for dir in self.default_libdirs() {
            search.push((dir, DirOrigin::Default));
        }
        debug!(
            "ELF: deps: {:?}, nodeflib: {}, search order: {:?}",
            needed, nodeflib, search
        );

        let root_only = [(self.root.clone(), DirOrigin::RPath)];
        let mut found: Vec<(PathBuf, String)> = Vec::new();
        for dep in &needed {
            let absolute = dep.starts_with('/');
            let dirs: &[(String, DirOrigin)] = if absolute { &root_only } else { &search };

            let mut hit = None;
            for (dir, dir_origin) in dirs {
                if nodeflib && *dir_origin == DirOrigin::Default {
                    continue;
                }
                let candidate = normpath(&format!("{}/{}", dir, dep));
                match probe(&candidate) {
                    Probe::Elf(cand_info) if info.compatible(&cand_info) => {
                        hit = Some((candidate, *dir_origin));
                        break;
                    }
                    _ => continue,
                }
            }

            let (path, dir_origin) = hit.ok_or_else(|| Error::ElfDependencyMissing {
                elf: real.to_path_buf(),
                dep: dep.clone(),
            })?;
            let dest = if absolute || matches!(dir_origin, DirOrigin::RPath | DirOrigin::RunPath) {
                // Path encoded in the binary: keep it
                normpath(&format!("/{}", strip_prefix_str(&path, &self.root)))
            } else {
                normpath(&format!("{}/{}", self.libdir_for(info.class64), dep))
            };
            debug!("Found {} at {} (dest: {})", dep, path, dest);
            found.push((PathBuf::from(path), dest));
        }
        Ok(found)
    }

    /// Search an executable through `PATH`.  Non-ELF executables (scripts)
    /// are accepted; ELF candidates must be compatible with `<root>/bin/sh`.
    /// Returns `(host path, initramfs path)`.
    pub fn find_exec(&mut self, executable: &str) -> Result<(PathBuf, String)> {
        debug!("Searching executable {}", executable);
        let compat = self.compat_info()?;

        let absolute = executable.starts_with('/');
        let dirs = if absolute {
            vec![self.root.clone()]
        } else {
            let mut dirs = vec![self.cwd.clone()];
            dirs.extend(self.parse_path_var());
            dirs
        };
        let name = if absolute {
            executable
        } else {
            executable.rsplit('/').next().unwrap_or(executable)
        };

        for dir in dirs {
            let candidate = normpath(&format!("{}/{}", dir, name));
            if access(Path::new(&candidate), AccessFlags::X_OK).is_err() {
                continue;
            }
            match probe(&candidate) {
                Probe::Unreadable => continue,
                Probe::Elf(cand_info) if !compat.compatible(&cand_info) => continue,
                // Scripts and compatible ELFs both qualify
                _ => (),
            }
            let dest = normpath(&format!("/{}", strip_prefix_str(&candidate, &self.root)));
            debug!("Found {} at {} (dest: {})", executable, candidate, dest);
            return Ok((PathBuf::from(candidate), dest));
        }
        Err(Error::BinaryMissing(executable.to_string()))
    }

    /// Search a library by name or glob pattern through `LD_LIBRARY_PATH`,
    /// `ld.so.conf` and the default library directories.  The first
    /// compatible match wins; its destination is the default libdir for the
    /// binary class.
    pub fn find_lib(&mut self, lib: &str) -> Result<(PathBuf, String)> {
        debug!("Searching library {}", lib);
        let compat = self.compat_info()?;

        let absolute = lib.starts_with('/');
        let mut dirs = Vec::new();
        if absolute {
            dirs.push(self.root.clone());
        } else {
            dirs.push(self.cwd.clone());
            if let Some(ld_path) = self.ld_library_path.clone() {
                dirs.extend(self.parse_ld_path(&ld_path, ""));
            }
            dirs.extend(self.ld_so_conf(None)?);
            dirs.extend(self.default_libdirs());
        }
        let libname = lib.rsplit('/').next().unwrap_or(lib);

        for dir in dirs {
            let pattern = format!("{}/{}", Pattern::escape(&dir), libname);
            let mut matches: Vec<PathBuf> = match glob::glob(&pattern) {
                Ok(paths) => paths.filter_map(|entry| entry.ok()).collect(),
                Err(_) => continue,
            };
            matches.sort();
            for path in matches {
                let candidate = normpath(&path.to_string_lossy());
                let cand_info = match probe(&candidate) {
                    Probe::Elf(cand_info) if compat.compatible(&cand_info) => cand_info,
                    _ => continue,
                };
                let basename = candidate.rsplit('/').next().unwrap_or(&candidate);
                let dest = normpath(&format!("{}/{}", self.libdir_for(cand_info.class64), basename));
                debug!("Found {} at {} (dest: {})", lib, candidate, dest);
                return Ok((PathBuf::from(candidate), dest));
            }
        }
        Err(Error::LibraryMissing(lib.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ld_path_expansion() {
        let root = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(root.path());
        let dirs = resolver.parse_ld_path("/opt/lib:$ORIGIN/../lib", "/usr/bin");
        assert_eq!(dirs[0], format!("{}/opt/lib", resolver.root()));
        assert_eq!(dirs[1], "/usr/lib");
    }

    #[test]
    fn ld_path_empty_element_is_cwd() {
        let root = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(root.path());
        let dirs = resolver.parse_ld_path(":", "");
        let cwd = normpath(&env::current_dir().unwrap().to_string_lossy());
        assert_eq!(dirs, vec![cwd.clone(), cwd]);
    }

    #[test]
    fn ld_so_conf_includes() {
        let root = tempfile::tempdir().unwrap();
        let etc = root.path().join("etc");
        fs::create_dir_all(etc.join("ld.so.conf.d")).unwrap();
        fs::write(
            etc.join("ld.so.conf"),
            "# comment\ninclude ld.so.conf.d/*.conf\n/opt/lib # trailing\n",
        )
        .unwrap();
        fs::write(etc.join("ld.so.conf.d/10-a.conf"), "/a/lib\n").unwrap();
        fs::write(etc.join("ld.so.conf.d/20-b.conf"), "\n/b/lib\n").unwrap();

        let mut resolver = Resolver::new(root.path());
        let dirs = resolver.ld_so_conf(None).unwrap();
        let root_str = resolver.root().to_string();
        assert_eq!(
            dirs,
            vec![
                format!("{root_str}/a/lib"),
                format!("{root_str}/b/lib"),
                format!("{root_str}/opt/lib"),
            ]
        );
    }

    #[test]
    fn default_libdirs_only_existing() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("lib")).unwrap();
        fs::create_dir_all(root.path().join("usr/lib64")).unwrap();
        let mut resolver = Resolver::new(root.path());
        let root_str = resolver.root().to_string();
        assert_eq!(
            resolver.default_libdirs(),
            vec![format!("{root_str}/usr/lib64"), format!("{root_str}/lib")]
        );
    }

    #[test]
    fn non_elf_has_no_deps() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        script.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        let mut resolver = Resolver::new(Path::new("/"));
        assert!(resolver.find_elf_deps(script.path()).unwrap().is_empty());
    }

    #[test]
    fn find_exec_on_host_root() {
        let mut resolver = Resolver::new(Path::new("/"));
        let (src, dest) = resolver.find_exec("sh").unwrap();
        assert!(src.to_string_lossy().ends_with("/sh"));
        assert!(dest.ends_with("/sh"));
        assert!(dest.starts_with('/'));
    }

    #[test]
    fn missing_exec_is_distinct_error() {
        let mut resolver = Resolver::new(Path::new("/"));
        assert!(matches!(
            resolver.find_exec("definitely-not-a-real-binary-name"),
            Err(Error::BinaryMissing(_))
        ));
    }
}
