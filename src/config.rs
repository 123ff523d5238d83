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

//! INI-style configuration: one `[DEFAULT]` section with the build knobs,
//! one section per data source.  Parsed by hand, line by line.
//!
//! Source identifiers accept the prefixes `PATH=`, `UUID=`, `PARTUUID=`,
//! `LABEL=`, `PARTLABEL=` (anonymous nodes, deduplicated per identifier)
//! and `DATA=` (reference to a named section).  An unprefixed absolute
//! path is an implicit `PATH=`; any other unprefixed string names a
//! section.

use log::debug;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::{SourceGraph, SourceId};
use crate::errors::{Error, PathContext, Result};
use crate::init::{BreakScripts, InitOptions};

/// Keymap settings: `src` is the keymap to convert (`None` when the
/// binary keymap at `build` is supplied by the user), `build` the host
/// path of the converted blob, `dest` its path inside the initramfs.
#[derive(Debug, Clone)]
pub struct Keymap {
    pub src: Option<String>,
    pub build: PathBuf,
    pub dest: String,
}

/// A parsed configuration: the graph plus everything the builder and the
/// init emitter need.
pub struct Config {
    pub graph: SourceGraph,
    pub root: SourceId,
    pub mounts: Vec<SourceId>,
    pub keymap: Option<Keymap>,
    pub init: String,
    pub init_path: PathBuf,
    pub files: Vec<(String, Option<String>)>,
    pub execs: Vec<(String, Option<String>)>,
    pub libs: Vec<(String, Option<String>)>,
    pub modules: Vec<(String, Vec<String>)>,
    pub breaks: BreakScripts,
    pub build_dir: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

/// Files, executables, libraries and kernel modules the image needs:
/// the user-declared extras plus everything the sources in use register.
#[derive(Debug, Default)]
pub struct Requirements {
    pub files: Vec<(String, Option<String>)>,
    pub execs: Vec<(String, Option<String>)>,
    pub libs: Vec<(String, Option<String>)>,
    pub kmods: Vec<(String, Vec<String>)>,
}

impl Config {
    /// Aggregate the requirements of the root, the extra mounts, all their
    /// dependencies, and the user extras, preserving declaration order.
    pub fn requirements(&self) -> Requirements {
        fn push_unique<T: PartialEq + Clone>(list: &mut Vec<T>, value: &T) {
            if !list.contains(value) {
                list.push(value.clone());
            }
        }

        let mut requirements = Requirements::default();
        for id in crate::init::roots_with_deps(&self.graph, &self.sources_in_use()) {
            let node = self.graph.node(id);
            for file in node.files() {
                push_unique(&mut requirements.files, file);
            }
            for exec in node.execs() {
                push_unique(&mut requirements.execs, exec);
            }
            for lib in node.libs() {
                push_unique(&mut requirements.libs, lib);
            }
            for kmod in node.kmods() {
                push_unique(&mut requirements.kmods, kmod);
            }
        }
        for file in &self.files {
            push_unique(&mut requirements.files, file);
        }
        for exec in &self.execs {
            push_unique(&mut requirements.execs, exec);
        }
        for lib in &self.libs {
            push_unique(&mut requirements.libs, lib);
        }
        for module in &self.modules {
            if !requirements.kmods.iter().any(|(name, _)| name == &module.0) {
                requirements.kmods.push(module.clone());
            }
        }
        requirements
    }

    /// The root plus the extra mounts.
    pub fn sources_in_use(&self) -> Vec<SourceId> {
        let mut ids = vec![self.root];
        ids.extend(self.mounts.iter().copied());
        ids
    }

    /// Options for the init emitter.  User-declared modules are loaded
    /// first, then the modules registered by the sources in use.
    pub fn init_options(&self) -> InitOptions {
        let mut options = InitOptions::new();
        options.init = self.init.clone();
        options.breaks = self.breaks.clone();
        options.keymap = self
            .keymap
            .as_ref()
            .map(|keymap| (keymap.dest.clone(), locale_is_utf8()));
        options.modules = self.modules.clone();
        for id in crate::init::roots_with_deps(&self.graph, &self.sources_in_use()) {
            for (module, params) in self.graph.node(id).kmods() {
                if !options.modules.iter().any(|(name, _)| name == module) {
                    options.modules.push((module.clone(), params.clone()));
                }
            }
        }
        options
    }
}

/// The keyboard goes to unicode mode when the build locale is UTF-8.
pub fn locale_is_utf8() -> bool {
    for var in ["LC_ALL", "LC_CTYPE", "LANG"] {
        if let Ok(value) = env::var(var) {
            if !value.is_empty() {
                let value = value.to_uppercase();
                return value.contains("UTF-8") || value.contains("UTF8");
            }
        }
    }
    false
}

/// Locate a configuration file: `INITRAMGEN_CONFIG`, then
/// `./initramgen.ini`, then `/etc/initramgen.ini`.
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = env::var("INITRAMGEN_CONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    for path in ["./initramgen.ini", "/etc/initramgen.ini"] {
        if Path::new(path).is_file() {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[derive(Debug)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&str> {
        // last assignment wins
        self.entries
            .iter()
            .rev()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value.as_str())
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::ConfigInvalid(format!("[{}] is missing required field {key}", self.name))
        })
    }
}

/// Line-oriented INI parsing: `[section]` headers, `key = value` pairs,
/// `#`/`;` comments, indented continuation lines.
fn parse_ini(text: &str) -> Result<Vec<Section>> {
    let mut sections = vec![Section {
        name: "DEFAULT".to_string(),
        entries: Vec::new(),
    }];
    let mut current = 0;

    for (number, raw_line) in text.lines().enumerate() {
        let number = number + 1;
        if raw_line.trim().is_empty() {
            continue;
        }
        let trimmed = raw_line.trim_start();
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        // continuation of the previous value
        if raw_line.starts_with(|c: char| c.is_whitespace()) {
            match sections[current].entries.last_mut() {
                Some((_, value)) => {
                    value.push('\n');
                    value.push_str(trimmed.trim_end());
                    continue;
                }
                None => {
                    return Err(Error::ConfigInvalid(format!(
                        "line {number}: continuation without a preceding key"
                    )))
                }
            }
        }

        let line = raw_line.trim_end();
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            if name.eq_ignore_ascii_case("DEFAULT") {
                current = 0;
            } else {
                sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                current = sections.len() - 1;
            }
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                sections[current]
                    .entries
                    .push((key.trim().to_lowercase(), value.trim().to_string()));
            }
            None => {
                return Err(Error::ConfigInvalid(format!(
                    "line {number}: expected `key = value`, got {line:?}"
                )))
            }
        }
    }
    Ok(sections)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        other => Err(Error::ConfigInvalid(format!("invalid boolean: {other:?}"))),
    }
}

/// Split a comma or newline separated list.
fn split_list(value: &str) -> Vec<&str> {
    value
        .split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Parse `src[:dest]` lines.
fn parse_file_list(value: &str) -> Vec<(String, Option<String>)> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(':') {
            Some((src, dest)) => (src.to_string(), Some(dest.to_string())),
            None => (line.to_string(), None),
        })
        .collect()
}

struct GraphBuilder {
    graph: SourceGraph,
    named: HashMap<String, SourceId>,
    anonymous: HashMap<String, SourceId>,
}

impl GraphBuilder {
    fn new() -> Self {
        GraphBuilder {
            graph: SourceGraph::new(),
            named: HashMap::new(),
            anonymous: HashMap::new(),
        }
    }

    /// Resolve a source identifier, creating anonymous path/UUID/label
    /// nodes on first use.
    fn find_source(&mut self, identifier: &str) -> Result<SourceId> {
        let identifier = identifier.trim();
        let anon = |builder: &mut Self, key: &str, make: &dyn Fn(&mut SourceGraph) -> SourceId| {
            if let Some(id) = builder.anonymous.get(key) {
                return *id;
            }
            let id = make(&mut builder.graph);
            builder.anonymous.insert(key.to_string(), id);
            id
        };

        if let Some(path) = identifier.strip_prefix("PATH=") {
            let path = path.to_string();
            return Ok(anon(self, identifier, &move |graph| graph.add_path(&path)));
        }
        if let Some(uuid) = identifier.strip_prefix("UUID=") {
            let uuid = uuid.to_string();
            return Ok(anon(self, identifier, &move |graph| {
                graph.add_uuid(&uuid, false)
            }));
        }
        if let Some(uuid) = identifier.strip_prefix("PARTUUID=") {
            let uuid = uuid.to_string();
            return Ok(anon(self, identifier, &move |graph| {
                graph.add_uuid(&uuid, true)
            }));
        }
        if let Some(label) = identifier.strip_prefix("LABEL=") {
            let label = label.to_string();
            return Ok(anon(self, identifier, &move |graph| {
                graph.add_label(&label, false)
            }));
        }
        if let Some(label) = identifier.strip_prefix("PARTLABEL=") {
            let label = label.to_string();
            return Ok(anon(self, identifier, &move |graph| {
                graph.add_label(&label, true)
            }));
        }
        if let Some(name) = identifier.strip_prefix("DATA=") {
            return self
                .named
                .get(name)
                .copied()
                .ok_or_else(|| Error::ConfigInvalid(format!("unknown source: {name}")));
        }
        if identifier.starts_with('/') {
            let path = identifier.to_string();
            let key = format!("PATH={identifier}");
            return Ok(anon(self, &key, &move |graph| graph.add_path(&path)));
        }
        self.named
            .get(identifier)
            .copied()
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown source: {identifier}")))
    }

    fn find_source_opt(&mut self, identifier: Option<&str>) -> Result<Option<SourceId>> {
        match identifier {
            Some(identifier) => self.find_source(identifier).map(Some),
            None => Ok(None),
        }
    }

    fn build_section(&mut self, section: &Section) -> Result<()> {
        let kind = section.require("type")?.to_string();
        let id = match kind.as_str() {
            "luks" => {
                let source = self.find_source(section.require("source")?)?;
                let key = self.find_source_opt(section.get("key"))?;
                let header = self.find_source_opt(section.get("header"))?;
                let discard = match section.get("discard") {
                    Some(value) => parse_bool(value)?,
                    None => false,
                };
                self.graph
                    .add_luks(source, section.require("name")?, key, header, discard)?
            }
            "lvm" => {
                let vg_name = section.require("vg-name")?.to_string();
                let lv_name = section.require("lv-name")?.to_string();
                self.graph.add_lvm(&vg_name, &lv_name)
            }
            "mount" => {
                let source = match section.get("source") {
                    None | Some("none") => None,
                    Some(identifier) => Some(self.find_source(identifier)?),
                };
                let mountpoint = section.require("mountpoint")?.to_string();
                let filesystem = section.require("filesystem")?.to_string();
                let options = section.get("options").unwrap_or("ro").to_string();
                self.graph
                    .add_mount(source, &mountpoint, &filesystem, &options)?
            }
            "md" => {
                let mut sources = Vec::new();
                for identifier in split_list(section.require("source")?) {
                    sources.push(self.find_source(identifier)?);
                }
                self.graph.add_md(&sources, section.require("name")?)?
            }
            "clone" => {
                let source = self.find_source(section.require("source")?)?;
                let dest = self.find_source(section.require("dest")?)?;
                self.graph.add_clone(source, dest)?
            }
            "zfspool" => {
                let cache = self.find_source_opt(section.get("cache"))?;
                self.graph.add_zfs_pool(section.require("pool")?, cache)?
            }
            "zfscrypt" => {
                let pool = self.find_source(section.require("pool")?)?;
                let key = self.find_source_opt(section.get("key"))?;
                self.graph
                    .add_zfs_crypt(pool, section.require("dataset")?, key)?
            }
            "network" => self.graph.add_network(
                section.require("device")?,
                section.get("ip"),
                section.get("mask"),
                section.get("gateway"),
            )?,
            "iscsi" => {
                let port = match section.get("port") {
                    Some(port) => port.parse().map_err(|_| {
                        Error::ConfigInvalid(format!("[{}] invalid port: {port}", section.name))
                    })?,
                    None => 3260,
                };
                let portal_group = section.require("portal-group")?;
                let portal_group = portal_group.parse().map_err(|_| {
                    Error::ConfigInvalid(format!(
                        "[{}] invalid portal-group: {portal_group}",
                        section.name
                    ))
                })?;
                self.graph.add_iscsi(
                    section.require("initiator")?,
                    section.require("target")?,
                    portal_group,
                    section.require("address")?,
                    port,
                    section.get("username"),
                    section.get("password"),
                    section.get("username-in"),
                    section.get("password-in"),
                )?
            }
            other => {
                return Err(Error::ConfigInvalid(format!(
                    "[{}] has unknown type {other:?}",
                    section.name
                )))
            }
        };
        self.named.insert(section.name.clone(), id);
        Ok(())
    }
}

/// Read and materialize a configuration file.
pub fn read_config(path: &Path) -> Result<Config> {
    debug!("Reading configuration {}", path.display());
    let text = fs::read_to_string(path).path_ctx(path)?;
    parse_config(&text)
}

/// Materialize a configuration from its text.
pub fn parse_config(text: &str) -> Result<Config> {
    let sections = parse_ini(text)?;
    let (default, sources) = sections.split_first().expect("DEFAULT always present");

    let mut builder = GraphBuilder::new();
    for section in sources {
        builder.build_section(section)?;
    }

    // Dependency edges may point forward, so they are wired after every
    // section exists
    for section in sources {
        let id = builder.named[&section.name];
        if let Some(need) = section.get("need").map(str::to_string) {
            for identifier in split_list(&need) {
                let dep = builder.find_source(identifier)?;
                builder.graph.add_hard_dep(id, dep)?;
            }
        }
        if let Some(lneed) = section.get("load-need").map(str::to_string) {
            for identifier in split_list(&lneed) {
                let dep = builder.find_source(identifier)?;
                builder.graph.add_load_dep(id, dep)?;
            }
        }
    }

    let root = builder.find_source(default.require("root")?)?;
    let mut mounts = Vec::new();
    if let Some(mountpoints) = default.get("mountpoints").map(str::to_string) {
        for identifier in split_list(&mountpoints) {
            mounts.push(builder.find_source(identifier)?);
        }
    }

    let keymap = match default.get("keymap") {
        Some(value) if parse_bool(value)? => Some(Keymap {
            src: default.get("keymap-src").map(str::to_string),
            build: PathBuf::from(default.get("keymap-path").unwrap_or("/tmp/keymap.bmap")),
            dest: default
                .get("keymap-dest")
                .unwrap_or("/root/keymap.bmap")
                .to_string(),
        }),
        _ => None,
    };

    let modules = default
        .get("modules")
        .map(|value| {
            value
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| {
                    let mut words = line.split_whitespace().map(str::to_string);
                    let name = words.next().expect("line is not empty");
                    (name, words.collect())
                })
                .collect()
        })
        .unwrap_or_default();

    let breaks = BreakScripts {
        early: default.get("break-early").map(str::to_string),
        init: default.get("break-init").map(str::to_string),
        module: default.get("break-module").map(str::to_string),
        rootfs: default.get("break-rootfs").map(str::to_string),
        mount: default.get("break-mount").map(str::to_string),
    };

    let mut config = Config {
        root,
        mounts,
        keymap,
        init: default.get("init").unwrap_or("/sbin/init").to_string(),
        init_path: PathBuf::from(default.get("init-path").unwrap_or("/tmp/init.sh")),
        files: default.get("files").map(parse_file_list).unwrap_or_default(),
        execs: default.get("execs").map(parse_file_list).unwrap_or_default(),
        libs: default.get("libs").map(parse_file_list).unwrap_or_default(),
        modules,
        breaks,
        build_dir: default.get("build-dir").map(PathBuf::from),
        output: default.get("output").map(PathBuf::from),
        graph: builder.graph,
    };

    // The root and the persistent mounts survive until switch_root
    config.graph.set_final(config.root);
    for mount in config.mounts.clone() {
        config.graph.set_final(mount);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SourceKind;

    const SAMPLE: &str = r#"
# boot from LVM over LUKS, with a key file on a removable device
root = DATA=rootfs
mountpoints = home
init = /lib/systemd/systemd
files =
	/etc/fstab
	/etc/hosts:/etc/hosts.boot
modules =
	ext4
	zswap enabled=1

[keys]
type = mount
source = UUID=5678-dcba
mountpoint = /mnt/keys
filesystem = vfat

[cryptroot]
type = luks
source = UUID=abcd-1234
name = root
key = PATH=/mnt/keys/root.key
load-need = keys

[rootvg]
type = lvm
vg-name = vg0
lv-name = root
need = cryptroot

[rootfs]
type = mount
source = DATA=rootvg
mountpoint = /newroot
filesystem = ext4

[home]
type = mount
source = LABEL=home
mountpoint = /home
filesystem = ext4
options = rw
"#;

    #[test]
    fn parses_graph_and_defaults() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.init, "/lib/systemd/systemd");
        assert_eq!(config.mounts.len(), 1);
        assert!(matches!(
            config.graph.node(config.root).kind(),
            SourceKind::Mount { mountpoint, .. } if mountpoint == "/newroot"
        ));
        // finality propagated over hard edges
        assert!(config.graph.node(config.root).is_final());
        let deps = config.graph.iter_all_deps(config.root);
        assert!(deps
            .iter()
            .any(|id| matches!(config.graph.node(*id).kind(), SourceKind::Luks { .. })));
        // the key mount is a load dependency, not final
        let keys = deps
            .iter()
            .find(|id| {
                matches!(config.graph.node(**id).kind(),
                    SourceKind::Mount { mountpoint, .. } if mountpoint == "/mnt/keys")
            })
            .unwrap();
        assert!(!config.graph.node(*keys).is_final());

        assert_eq!(
            config.files,
            vec![
                ("/etc/fstab".to_string(), None),
                (
                    "/etc/hosts".to_string(),
                    Some("/etc/hosts.boot".to_string())
                ),
            ]
        );
        assert_eq!(config.modules[1], ("zswap".into(), vec!["enabled=1".into()]));
    }

    #[test]
    fn anonymous_sources_are_deduplicated() {
        let mut builder = GraphBuilder::new();
        let first = builder.find_source("UUID=aaaa").unwrap();
        let second = builder.find_source("UUID=aaaa").unwrap();
        let third = builder.find_source("UUID=bbbb").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, third);
        let implicit = builder.find_source("/dev/sda1").unwrap();
        let explicit = builder.find_source("PATH=/dev/sda1").unwrap();
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let text = "root = DATA=nope\n";
        assert!(matches!(
            parse_config(text),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn missing_field_is_rejected() {
        let text = "root = /dev/sda1\n\n[broken]\ntype = luks\nname = x\n";
        assert!(matches!(parse_config(text), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let text = "\
root = /dev/sda1

[a]
type = lvm
vg-name = vg
lv-name = a
need = b

[b]
type = lvm
vg-name = vg
lv-name = b
need = a
";
        assert!(matches!(parse_config(text), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn requirements_aggregate_without_duplicates() {
        let config = parse_config(SAMPLE).unwrap();
        let requirements = config.requirements();
        let cryptsetup = requirements
            .execs
            .iter()
            .filter(|(name, _)| name == "cryptsetup")
            .count();
        assert_eq!(cryptsetup, 1);
        // three ext4 mounts, one dm-crypt, user modules ext4 + zswap
        assert!(requirements.kmods.iter().any(|(name, _)| name == "dm-crypt"));
        assert_eq!(
            requirements
                .kmods
                .iter()
                .filter(|(name, _)| name == "ext4")
                .count(),
            1
        );
        let options = config.init_options();
        assert!(options.modules.iter().any(|(name, _)| name == "zswap"));
    }

    #[test]
    fn mount_source_none() {
        let text = "\
root = tmp

[tmp]
type = mount
source = none
mountpoint = /newroot
filesystem = tmpfs
options = rw
";
        let config = parse_config(text).unwrap();
        assert!(matches!(
            config.graph.node(config.root).kind(),
            SourceKind::Mount { source: None, .. }
        ));
    }
}
