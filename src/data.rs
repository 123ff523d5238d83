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

//! The dependency graph of data sources the init script brings up.
//!
//! Every node describes one piece of data on the booting system (a block
//! device, an unlocked LUKS volume, a mount point...).  Nodes are held in
//! an arena and referenced by [`SourceId`]; hard edges keep a dependency
//! loaded for as long as the dependent is, load edges only keep it during
//! the load step.  A [`Scheduler`] walks the graph once and writes the
//! shell fragments that load (and unload) everything in order; the graph
//! itself stays immutable during emission, so it can be emitted any number
//! of times.

use log::debug;
use std::io::Write;

use crate::errors::{Error, Result};
use crate::util::{parent_dir, quote};

/// Handle to a node of a [`SourceGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

/// Discriminant of a source variant, used to emit each variant's one-shot
/// init-script setup exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTag {
    Path,
    Uuid,
    Label,
    Luks,
    Lvm,
    Md,
    Mount,
    Clone,
    ZfsPool,
    ZfsCrypt,
    Network,
    Iscsi,
}

#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Absolute path on the booting system.
    Path { path: String },
    /// Filesystem UUID, or partition UUID when `partition` is set.
    Uuid { uuid: String, partition: bool },
    /// Filesystem label, or partition label when `partition` is set.
    Label { label: String, partition: bool },
    /// LUKS encrypted block device.
    Luks {
        source: SourceId,
        name: String,
        key: Option<SourceId>,
        header: Option<SourceId>,
        discard: bool,
    },
    /// LVM logical volume.
    Lvm { vg_name: String, lv_name: String },
    /// MD software RAID.
    Md { sources: Vec<SourceId>, name: String },
    /// Mount point.  `source` is `None` for virtual filesystems declared
    /// with source `none`; the filesystem check is skipped for those.
    Mount {
        source: Option<SourceId>,
        mountpoint: String,
        filesystem: String,
        options: String,
    },
    /// Copy of one source into another.
    Clone { source: SourceId, dest: SourceId },
    /// Imported ZFS pool.
    ZfsPool {
        pool: String,
        cache: Option<SourceId>,
    },
    /// Unlocked ZFS encrypted dataset.
    ZfsCrypt {
        pool: SourceId,
        dataset: String,
        key: Option<SourceId>,
    },
    /// Configured network interface, selected by MAC address.  No address
    /// means DHCP.
    Network {
        device: String,
        ip: Option<String>,
        mask: Option<String>,
        gateway: Option<String>,
    },
    /// iSCSI target login.
    Iscsi {
        initiator: String,
        target: String,
        portal_group: u32,
        address: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        username_in: Option<String>,
        password_in: Option<String>,
    },
}

impl SourceKind {
    pub fn tag(&self) -> KindTag {
        match self {
            SourceKind::Path { .. } => KindTag::Path,
            SourceKind::Uuid { .. } => KindTag::Uuid,
            SourceKind::Label { .. } => KindTag::Label,
            SourceKind::Luks { .. } => KindTag::Luks,
            SourceKind::Lvm { .. } => KindTag::Lvm,
            SourceKind::Md { .. } => KindTag::Md,
            SourceKind::Mount { .. } => KindTag::Mount,
            SourceKind::Clone { .. } => KindTag::Clone,
            SourceKind::ZfsPool { .. } => KindTag::ZfsPool,
            SourceKind::ZfsCrypt { .. } => KindTag::ZfsCrypt,
            SourceKind::Network { .. } => KindTag::Network,
            SourceKind::Iscsi { .. } => KindTag::Iscsi,
        }
    }
}

/// One node of the graph: a variant plus the files, executables,
/// libraries, shell commands and kernel modules it pulls into the image,
/// and its edges.
#[derive(Debug, Clone)]
pub struct SourceNode {
    kind: SourceKind,
    files: Vec<(String, Option<String>)>,
    execs: Vec<(String, Option<String>)>,
    libs: Vec<(String, Option<String>)>,
    shell_cmds: Vec<String>,
    kmods: Vec<(String, Vec<String>)>,
    need: Vec<SourceId>,
    lneed: Vec<SourceId>,
    needed_by: Vec<SourceId>,
    is_final: bool,
}

impl SourceNode {
    fn new(kind: SourceKind) -> Self {
        SourceNode {
            kind,
            files: Vec::new(),
            execs: Vec::new(),
            libs: Vec::new(),
            shell_cmds: Vec::new(),
            kmods: Vec::new(),
            need: Vec::new(),
            lneed: Vec::new(),
            needed_by: Vec::new(),
            is_final: false,
        }
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn files(&self) -> &[(String, Option<String>)] {
        &self.files
    }

    pub fn execs(&self) -> &[(String, Option<String>)] {
        &self.execs
    }

    pub fn libs(&self) -> &[(String, Option<String>)] {
        &self.libs
    }

    pub fn shell_cmds(&self) -> &[String] {
        &self.shell_cmds
    }

    pub fn kmods(&self) -> &[(String, Vec<String>)] {
        &self.kmods
    }

    pub fn hard_deps(&self) -> &[SourceId] {
        &self.need
    }

    pub fn load_deps(&self) -> &[SourceId] {
        &self.lneed
    }

    pub fn reverse_deps(&self) -> &[SourceId] {
        &self.needed_by
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    fn add_exec(&mut self, exec: &str) {
        self.execs.push((exec.to_string(), None));
    }

    fn add_lib(&mut self, lib: &str) {
        self.libs.push((lib.to_string(), None));
    }

    fn add_cmds(&mut self, cmds: &[&str]) {
        for cmd in cmds {
            self.shell_cmds.push(cmd.to_string());
        }
    }

    fn add_kmod(&mut self, kmod: &str) {
        self.kmods.push((kmod.to_string(), Vec::new()));
    }
}

/// Arena of [`SourceNode`]s.  Edge additions keep the reverse-dependency
/// lists consistent and reject cycles.
#[derive(Debug, Default)]
pub struct SourceGraph {
    nodes: Vec<SourceNode>,
}

impl SourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: SourceId) -> &SourceNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, node: SourceNode) -> SourceId {
        self.nodes.push(node);
        SourceId(self.nodes.len() - 1)
    }

    pub fn add_path(&mut self, path: &str) -> SourceId {
        self.push(SourceNode::new(SourceKind::Path {
            path: path.to_string(),
        }))
    }

    pub fn add_uuid(&mut self, uuid: &str, partition: bool) -> SourceId {
        let mut node = SourceNode::new(SourceKind::Uuid {
            uuid: uuid.to_string(),
            partition,
        });
        if partition {
            // PARTUUID is only available in util-linux findfs
            node.add_exec("findfs");
        } else {
            node.add_cmds(&["findfs"]);
        }
        self.push(node)
    }

    pub fn add_label(&mut self, label: &str, partition: bool) -> SourceId {
        let mut node = SourceNode::new(SourceKind::Label {
            label: label.to_string(),
            partition,
        });
        if partition {
            // PARTLABEL is only available in util-linux findfs
            node.add_exec("findfs");
        } else {
            node.add_cmds(&["findfs"]);
        }
        self.push(node)
    }

    pub fn add_luks(
        &mut self,
        source: SourceId,
        name: &str,
        key: Option<SourceId>,
        header: Option<SourceId>,
        discard: bool,
    ) -> Result<SourceId> {
        let mut node = SourceNode::new(SourceKind::Luks {
            source,
            name: name.to_string(),
            key,
            header,
            discard,
        });
        node.add_exec("cryptsetup");
        node.add_lib("libgcc_s.so.1");
        node.add_kmod("dm-crypt");
        let id = self.push(node);
        self.add_hard_dep(id, source)?;
        if let Some(key) = key {
            self.add_load_dep(id, key)?;
        }
        if let Some(header) = header {
            self.add_load_dep(id, header)?;
        }
        Ok(id)
    }

    pub fn add_lvm(&mut self, vg_name: &str, lv_name: &str) -> SourceId {
        let mut node = SourceNode::new(SourceKind::Lvm {
            vg_name: vg_name.to_string(),
            lv_name: lv_name.to_string(),
        });
        node.add_exec("lvm");
        self.push(node)
    }

    pub fn add_md(&mut self, sources: &[SourceId], name: &str) -> Result<SourceId> {
        if sources.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "MD RAID {name} has no source defined"
            )));
        }
        let mut node = SourceNode::new(SourceKind::Md {
            sources: sources.to_vec(),
            name: name.to_string(),
        });
        node.add_exec("mdadm");
        let id = self.push(node);
        for source in sources {
            self.add_hard_dep(id, *source)?;
        }
        Ok(id)
    }

    pub fn add_mount(
        &mut self,
        source: Option<SourceId>,
        mountpoint: &str,
        filesystem: &str,
        options: &str,
    ) -> Result<SourceId> {
        let mut node = SourceNode::new(SourceKind::Mount {
            source,
            mountpoint: mountpoint.to_string(),
            filesystem: filesystem.to_string(),
            options: options.to_string(),
        });
        node.add_cmds(&["fsck", "[", "reboot", "mkdir", "mount", "umount"]);
        match filesystem {
            "btrfs" => {
                node.add_exec("btrfs");
                node.add_exec("fsck.btrfs");
                node.add_kmod("btrfs");
            }
            "ext4" => {
                node.add_exec("fsck.ext4");
                node.add_exec("e2fsck");
                node.add_kmod("ext4");
            }
            "xfs" => {
                node.add_exec("fsck.xfs");
                node.add_exec("xfs_repair");
                node.add_kmod("xfs");
            }
            "fat" | "vfat" => {
                node.add_exec("fsck.fat");
                node.add_exec("fsck.vfat");
                node.add_kmod("vfat");
            }
            "exfat" => {
                node.add_exec("fsck.exfat");
                node.add_kmod("exfat");
            }
            "f2fs" => {
                node.add_exec("fsck.f2fs");
                node.add_kmod("f2fs");
            }
            "zfs" => {
                node.add_exec("fsck.zfs");
                node.add_kmod("zfs");
            }
            _ => (),
        }
        let id = self.push(node);
        if let Some(source) = source {
            self.add_hard_dep(id, source)?;
        }
        Ok(id)
    }

    pub fn add_clone(&mut self, source: SourceId, dest: SourceId) -> Result<SourceId> {
        let mut node = SourceNode::new(SourceKind::Clone { source, dest });
        node.add_cmds(&["cp"]);
        let id = self.push(node);
        self.add_load_dep(id, source)?;
        self.add_hard_dep(id, dest)?;
        Ok(id)
    }

    pub fn add_zfs_pool(&mut self, pool: &str, cache: Option<SourceId>) -> Result<SourceId> {
        let mut node = SourceNode::new(SourceKind::ZfsPool {
            pool: pool.to_string(),
            cache,
        });
        node.add_exec("zpool");
        node.add_kmod("zfs");
        let id = self.push(node);
        if let Some(cache) = cache {
            self.add_load_dep(id, cache)?;
        }
        Ok(id)
    }

    pub fn add_zfs_crypt(
        &mut self,
        pool: SourceId,
        dataset: &str,
        key: Option<SourceId>,
    ) -> Result<SourceId> {
        let pool_name = match self.node(pool).kind() {
            SourceKind::ZfsPool { pool, .. } => pool.clone(),
            other => {
                return Err(Error::ConfigInvalid(format!(
                    "ZFS dataset {dataset}: parent is not a ZFS pool ({:?})",
                    other.tag()
                )))
            }
        };
        let top = dataset.split('/').next().unwrap_or("");
        if top.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "ZFS dataset name is empty or ill-formed: {dataset:?}"
            )));
        }
        if top != pool_name {
            return Err(Error::ConfigInvalid(format!(
                "ZFS dataset {dataset} is not on pool {pool_name}"
            )));
        }
        let mut node = SourceNode::new(SourceKind::ZfsCrypt {
            pool,
            dataset: dataset.to_string(),
            key,
        });
        node.add_exec("zfs");
        let id = self.push(node);
        self.add_hard_dep(id, pool)?;
        if let Some(key) = key {
            self.add_load_dep(id, key)?;
        }
        Ok(id)
    }

    pub fn add_network(
        &mut self,
        device: &str,
        ip: Option<&str>,
        mask: Option<&str>,
        gateway: Option<&str>,
    ) -> Result<SourceId> {
        let mask = match (ip, mask) {
            (Some(ip), None) => Some(classful_mask(ip)?),
            (_, mask) => mask.map(str::to_string),
        };
        let mut node = SourceNode::new(SourceKind::Network {
            device: device.to_string(),
            ip: ip.map(str::to_string),
            mask,
            gateway: gateway.map(str::to_string),
        });
        node.add_cmds(&["ip", "udhcpc", "grep", "basename"]);
        node.files.push((
            "/usr/share/udhcpc/default.script".to_string(),
            Some("/etc/udhcpc.script".to_string()),
        ));
        Ok(self.push(node))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_iscsi(
        &mut self,
        initiator: &str,
        target: &str,
        portal_group: u32,
        address: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        username_in: Option<&str>,
        password_in: Option<&str>,
    ) -> Result<SourceId> {
        if username.is_some() != password.is_some() {
            return Err(Error::ConfigInvalid(format!(
                "iSCSI target {target}: both username and password must be set"
            )));
        }
        if username_in.is_some() != password_in.is_some() {
            return Err(Error::ConfigInvalid(format!(
                "iSCSI target {target}: both username-in and password-in must be set"
            )));
        }
        let mut node = SourceNode::new(SourceKind::Iscsi {
            initiator: initiator.to_string(),
            target: target.to_string(),
            portal_group,
            address: address.to_string(),
            port,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            username_in: username_in.map(str::to_string),
            password_in: password_in.map(str::to_string),
        });
        node.add_exec("iscsistart");
        Ok(self.push(node))
    }

    /// Add a hard dependency edge.  A pre-existing load edge to the same
    /// dependency is promoted.  Rejects cycles.
    pub fn add_hard_dep(&mut self, node: SourceId, dep: SourceId) -> Result<()> {
        self.check_cycle(node, dep)?;
        let entry = &mut self.nodes[node.0];
        entry.lneed.retain(|id| *id != dep);
        if !entry.need.contains(&dep) {
            entry.need.push(dep);
        }
        if !self.nodes[dep.0].needed_by.contains(&node) {
            self.nodes[dep.0].needed_by.push(node);
        }
        Ok(())
    }

    /// Add a load-only dependency edge.  A hard edge to the same dependency
    /// wins.  Rejects cycles.
    pub fn add_load_dep(&mut self, node: SourceId, dep: SourceId) -> Result<()> {
        self.check_cycle(node, dep)?;
        let entry = &mut self.nodes[node.0];
        if !entry.lneed.contains(&dep) && !entry.need.contains(&dep) {
            entry.lneed.push(dep);
        }
        if !self.nodes[dep.0].needed_by.contains(&node) {
            self.nodes[dep.0].needed_by.push(node);
        }
        Ok(())
    }

    /// An edge `node -> dep` creates a cycle iff `node` is reachable from
    /// `dep`.
    fn check_cycle(&self, node: SourceId, dep: SourceId) -> Result<()> {
        let mut stack = vec![dep];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(current) = stack.pop() {
            if current == node {
                return Err(Error::ConfigInvalid(format!(
                    "dependency cycle through {}",
                    self.name(node)
                )));
            }
            if seen[current.0] {
                continue;
            }
            seen[current.0] = true;
            let entry = &self.nodes[current.0];
            stack.extend(entry.need.iter().chain(entry.lneed.iter()).copied());
        }
        Ok(())
    }

    /// Mark a node as required by the final boot environment: it is never
    /// unloaded, and neither are its hard dependencies, recursively.
    pub fn set_final(&mut self, id: SourceId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.nodes[current.0].is_final = true;
            stack.extend(self.nodes[current.0].need.iter().copied());
        }
    }

    /// All dependencies of a node, recursively, in declaration order.
    /// A node reachable through several edges appears several times.
    pub fn iter_all_deps(&self, id: SourceId) -> Vec<SourceId> {
        let mut deps = Vec::new();
        let entry = &self.nodes[id.0];
        for dep in entry.need.iter().chain(entry.lneed.iter()) {
            deps.push(*dep);
            deps.extend(self.iter_all_deps(*dep));
        }
        deps
    }

    /// Variant tags used by the given roots and their dependencies, in
    /// first-seen order.
    pub fn kinds_in_use(&self, roots: &[SourceId]) -> Vec<KindTag> {
        let mut tags = Vec::new();
        for root in roots {
            let mut ids = vec![*root];
            ids.extend(self.iter_all_deps(*root));
            for id in ids {
                let tag = self.node(id).kind().tag();
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        tags
    }

    /// Human-readable name of a node, also used inside emitted messages.
    pub fn name(&self, id: SourceId) -> String {
        match self.node(id).kind() {
            SourceKind::Path { path } => path.clone(),
            SourceKind::Uuid { uuid, partition } => {
                format!("{}{}", if *partition { "PARTUUID=" } else { "UUID=" }, uuid)
            }
            SourceKind::Label { label, partition } => format!(
                "{}{}",
                if *partition { "PARTLABEL=" } else { "LABEL=" },
                label
            ),
            SourceKind::Luks { name, .. } => name.clone(),
            SourceKind::Lvm { vg_name, lv_name } => format!("{vg_name}/{lv_name}"),
            SourceKind::Md { name, .. } => name.clone(),
            SourceKind::Mount { mountpoint, .. } => mountpoint.clone(),
            SourceKind::Clone { source, dest } => {
                format!("{} to {}", self.name(*source), self.name(*dest))
            }
            SourceKind::ZfsPool { pool, .. } => format!("ZFS pool {pool}"),
            SourceKind::ZfsCrypt { dataset, .. } => {
                format!("ZFS encrypted dataset {dataset}")
            }
            SourceKind::Network { device, .. } => format!("network interface {device}"),
            SourceKind::Iscsi { target, .. } => format!("iSCSI target {target}"),
        }
    }

    /// Shell expression evaluating to the path of this data from within the
    /// init environment.  Already quoted for direct insertion.  `None` for
    /// variants that have no filesystem path (network, iSCSI).
    pub fn path(&self, id: SourceId) -> Option<String> {
        match self.node(id).kind() {
            SourceKind::Path { path } => Some(quote(path).into_owned()),
            SourceKind::Uuid { uuid, partition } => {
                let prefix = if *partition { "PARTUUID=" } else { "UUID=" };
                Some(format!("\"$(findfs {})\"", quote(&format!("{prefix}{uuid}"))))
            }
            SourceKind::Label { label, partition } => {
                let prefix = if *partition { "PARTLABEL=" } else { "LABEL=" };
                Some(format!("\"$(findfs {})\"", quote(&format!("{prefix}{label}"))))
            }
            SourceKind::Luks { name, .. } => Some(quote(&format!("/dev/mapper/{name}")).into_owned()),
            SourceKind::Lvm { vg_name, lv_name } => {
                // LVM doubles every hyphen of the VG and LV in the mapper name
                Some(
                    quote(&format!(
                        "/dev/mapper/{}-{}",
                        vg_name.replace('-', "--"),
                        lv_name.replace('-', "--")
                    ))
                    .into_owned(),
                )
            }
            SourceKind::Md { name, .. } => Some(quote(&format!("/dev/md/{name}")).into_owned()),
            SourceKind::Mount { mountpoint, .. } => Some(quote(mountpoint).into_owned()),
            SourceKind::Clone { dest, .. } => self.path(*dest),
            SourceKind::ZfsPool { pool, .. } => Some(quote(pool).into_owned()),
            SourceKind::ZfsCrypt { dataset, .. } => Some(quote(dataset).into_owned()),
            SourceKind::Network { .. } | SourceKind::Iscsi { .. } => None,
        }
    }

    fn path_or_err(&self, id: SourceId) -> Result<String> {
        self.path(id).ok_or_else(|| {
            Error::GraphInvariantBroken(format!("{} has no path", self.name(id)))
        })
    }

    /// Variant-specific one-shot initialization, emitted once per variant
    /// before any load.
    pub fn write_class_init(tag: KindTag, out: &mut dyn Write) -> Result<()> {
        match tag {
            KindTag::Mount => write_fun_mount_fsck(out),
            KindTag::Lvm => write_lvm_conf(out),
            KindTag::Network => write_fun_find_iface(out),
            _ => Ok(()),
        }
    }

    /// The variant-specific load fragment.
    fn write_load(&self, id: SourceId, out: &mut dyn Write) -> Result<()> {
        let name = self.name(id);
        match self.node(id).kind() {
            SourceKind::Path { .. }
            | SourceKind::Uuid { .. }
            | SourceKind::Label { .. } => Ok(()),
            SourceKind::Luks {
                source,
                key,
                header,
                discard,
                ..
            } => {
                let header = match header {
                    Some(header) => format!("--header {} ", self.path_or_err(*header)?),
                    None => String::new(),
                };
                let key = match key {
                    Some(key) => format!("--key-file {} ", self.path_or_err(*key)?),
                    None => String::new(),
                };
                let discard = if *discard { "--allow-discards " } else { "" };
                writeln!(out, "info 'Unlocking LUKS device {name}'")?;
                writeln!(
                    out,
                    "cryptsetup {header}{key}{discard}open {} {} || die {}",
                    self.path_or_err(*source)?,
                    quote(&name),
                    quote(&format!("Failed to unlock LUKS device {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Lvm { vg_name, lv_name } => {
                writeln!(out, "info 'Enabling LVM logical volume {name}'")?;
                writeln!(
                    out,
                    "lvm lvchange --sysinit -a ly {} || die {}",
                    quote(&format!("{vg_name}/{lv_name}")),
                    quote(&format!("Failed to enable LVM logical volume {name}"))
                )?;
                writeln!(
                    out,
                    "lvm vgmknodes || err {}",
                    quote(&format!("Failed to create LVM nodes for {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Md { sources, .. } => {
                let mut source_args = String::new();
                for source in sources {
                    match self.node(*source).kind() {
                        SourceKind::Uuid { uuid, .. } => {
                            source_args.push_str(&format!("--uuid {} ", quote(uuid)));
                        }
                        _ => {
                            source_args.push_str(&format!("{} ", self.path_or_err(*source)?));
                        }
                    }
                }
                writeln!(out, "info 'Assembling MD RAID {name}'")?;
                writeln!(
                    out,
                    "MDADM_NO_UDEV=1 mdadm --assemble {}{} || die {}",
                    source_args,
                    quote(&name),
                    quote(&format!("Failed to assemble MD RAID {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Mount {
                source,
                mountpoint,
                filesystem,
                options,
            } => {
                let source_path = match source {
                    Some(source) => self.path_or_err(*source)?,
                    None => "none".to_string(),
                };
                writeln!(out, "info 'Mounting filesystem {name}'")?;
                if source.is_some() {
                    let fsck = if filesystem == "zfs" {
                        "fsck.zfs".to_string()
                    } else {
                        format!("fsck -t {}", quote(filesystem))
                    };
                    writeln!(
                        out,
                        "mount_fsck {fsck} {source_path} || die {}",
                        quote(&format!("Failed to check filesystem {name}"))
                    )?;
                }
                if parent_dir(mountpoint) == "/mnt" {
                    let mountpoint = quote(mountpoint);
                    writeln!(
                        out,
                        "[ -d {mountpoint} ] || mkdir {mountpoint} || err {}",
                        quote(&format!("Failed to create directory {mountpoint}"))
                    )?;
                }
                writeln!(
                    out,
                    "mount -t {} -o {} {source_path} {} || die {}",
                    quote(filesystem),
                    quote(options),
                    quote(mountpoint),
                    quote(&format!("Failed to mount filesystem {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Clone { source, dest } => {
                writeln!(out, "info 'Cloning {name}'")?;
                writeln!(
                    out,
                    "cp -aT {} {} || die {}",
                    self.path_or_err(*source)?,
                    self.path_or_err(*dest)?,
                    quote(&format!("Failed to clone {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::ZfsPool { pool, cache } => {
                let cache = match cache {
                    Some(cache) => format!("-c {} ", self.path_or_err(*cache)?),
                    None => String::new(),
                };
                writeln!(out, "info {}", quote(&format!("Importing {name}")))?;
                writeln!(
                    out,
                    "zpool import -N {cache}{} || die {}",
                    quote(pool),
                    quote(&format!("Failed to import {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::ZfsCrypt { dataset, key, .. } => {
                let key = match key {
                    Some(key) => format!("-L {} ", self.path_or_err(*key)?),
                    None => String::new(),
                };
                writeln!(out, "info {}", quote(&format!("Unlocking {name}")))?;
                writeln!(
                    out,
                    "zfs load-key -r {key}{} 1>&2 || die {}",
                    quote(dataset),
                    quote(&format!("Failed to unlock {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Network {
                device,
                ip,
                mask,
                gateway,
            } => {
                let iface = format!("{} \"${{iface}}\" {}", quote(&format!("{device} (")), quote(")"));
                writeln!(out, "info {}", quote(&format!("Raising {name}")))?;
                writeln!(
                    out,
                    "iface=\"$(find_iface {})\" || die {}",
                    quote(device),
                    quote(&format!("Failed to find network interface {device}"))
                )?;
                writeln!(
                    out,
                    "ip link set \"${{iface}}\" up || die {} {iface}",
                    quote("Failed to raise network interface ")
                )?;
                match ip {
                    Some(ip) => {
                        writeln!(
                            out,
                            "ip addr add {}/{} dev \"${{iface}}\" || die {} {iface}",
                            quote(ip),
                            quote(mask.as_deref().unwrap_or("")),
                            quote(&format!("Failed to add {ip} to "))
                        )?;
                    }
                    None => {
                        writeln!(
                            out,
                            "udhcpc -nqfS -s /etc/udhcpc.script -i \"${{iface}}\" || die {} {iface}",
                            quote("DHCP failed on ")
                        )?;
                    }
                }
                if let Some(gateway) = gateway {
                    writeln!(
                        out,
                        "ip route add default via {} dev \"${{iface}}\" || die {} {iface}",
                        quote(gateway),
                        quote(&format!("Failed to set gateway {gateway} on "))
                    )?;
                }
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Iscsi {
                initiator,
                target,
                portal_group,
                address,
                port,
                username,
                password,
                username_in,
                password_in,
            } => {
                let mut cmd = format!(
                    "iscsistart -i {} -t {} -g {} -a {} -p {}",
                    quote(initiator),
                    quote(target),
                    portal_group,
                    quote(address),
                    port
                );
                if let (Some(username), Some(password)) = (username, password) {
                    cmd.push_str(&format!(" -u {} -w {}", quote(username), quote(password)));
                }
                if let (Some(username_in), Some(password_in)) = (username_in, password_in) {
                    cmd.push_str(&format!(
                        " -U {} -W {}",
                        quote(username_in),
                        quote(password_in)
                    ));
                }
                writeln!(out, "info {}", quote(&format!("Loading {name}")))?;
                writeln!(
                    out,
                    "{cmd} || die {}",
                    quote(&format!("Failed to load {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
        }
    }

    /// The variant-specific unload fragment.
    fn write_unload(&self, id: SourceId, out: &mut dyn Write) -> Result<()> {
        let name = self.name(id);
        match self.node(id).kind() {
            SourceKind::Path { .. }
            | SourceKind::Uuid { .. }
            | SourceKind::Label { .. }
            | SourceKind::Clone { .. }
            | SourceKind::Iscsi { .. } => Ok(()),
            SourceKind::Luks { name: luks_name, .. } => {
                writeln!(out, "info 'Closing LUKS device {name}'")?;
                writeln!(
                    out,
                    "cryptsetup close {} || die {}",
                    quote(luks_name),
                    quote(&format!("Failed to close LUKS device {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Lvm { vg_name, lv_name } => {
                writeln!(out, "info 'Disabling LVM logical volume {name}'")?;
                writeln!(
                    out,
                    "lvm lvchange --sysinit -a ln {} || die {}",
                    quote(&format!("{vg_name}/{lv_name}")),
                    quote(&format!("Failed to disable LVM logical volume {name}"))
                )?;
                writeln!(
                    out,
                    "lvm vgmknodes || err {}",
                    quote(&format!("Failed to remove LVM nodes for {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Md { name: md_name, .. } => {
                writeln!(out, "info 'Stopping MD RAID {name}'")?;
                writeln!(
                    out,
                    "MDADM_NO_UDEV=1 mdadm --stop {} || die {}",
                    quote(md_name),
                    quote(&format!("Failed to stop MD RAID {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Mount { mountpoint, .. } => {
                writeln!(out, "info 'Unmounting filesystem {name}'")?;
                writeln!(
                    out,
                    "umount {} || die {}",
                    quote(mountpoint),
                    quote(&format!("Failed to unmount filesystem {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::ZfsPool { pool, .. } => {
                writeln!(out, "info {}", quote(&format!("Exporting {name}")))?;
                writeln!(
                    out,
                    "zpool export {} || die {}",
                    quote(pool),
                    quote(&format!("Failed to export {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::ZfsCrypt { dataset, .. } => {
                writeln!(out, "info {}", quote(&format!("Locking {name}")))?;
                writeln!(
                    out,
                    "zfs unload-key -r {} || die {}",
                    quote(dataset),
                    quote(&format!("Failed to lock {name}"))
                )?;
                writeln!(out)?;
                Ok(())
            }
            SourceKind::Network { device, .. } => {
                let iface = format!("{} \"${{iface}}\" {}", quote(&format!("{device} (")), quote(")"));
                writeln!(out, "info {}", quote(&format!("Shutting down {name}")))?;
                writeln!(
                    out,
                    "iface=\"$(find_iface {})\" || die {}",
                    quote(device),
                    quote(&format!("Failed to find network interface {device}"))
                )?;
                writeln!(
                    out,
                    "ip link set \"${{iface}}\" down || die {} {iface}",
                    quote("Failed to shutdown network interface ")
                )?;
                writeln!(out)?;
                Ok(())
            }
        }
    }
}

/// Classful network mask of an IPv4 address.  Addresses in the multicast
/// range and above have none; a mask must be given explicitly for those.
fn classful_mask(ip: &str) -> Result<String> {
    let first: u32 = ip
        .split('.')
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid IPv4 address: {ip}")))?;
    if first < 128 {
        Ok("255.0.0.0".to_string())
    } else if first < 192 {
        Ok("255.255.0.0".to_string())
    } else if first < 224 {
        Ok("255.255.255.0".to_string())
    } else {
        Err(Error::ConfigInvalid(format!(
            "no classful network mask for {ip}"
        )))
    }
}

/// `mount_fsck` runs `fsck` through `"$@"` and classifies its exit code:
/// harmless codes are logged and ignored, a reboot request reboots, fatal
/// codes return 1.
fn write_fun_mount_fsck(out: &mut dyn Write) -> Result<()> {
    const FSCK_ERR: [(u32, &str, &str); 7] = [
        (1, "notice", "Filesystem errors corrected"),
        (2, "notice", "System should be rebooted"),
        (4, "alert", "Filesystem errors left uncorrected"),
        (8, "crit", "Operational error"),
        (16, "crit", "Usage or syntax error"),
        (32, "err", "Checking canceled by user request"),
        (128, "crit", "Shared-library error"),
    ];
    const CODE_ERR: u32 = 4 | 8 | 16 | 32 | 64 | 128;

    writeln!(out, "mount_fsck()")?;
    writeln!(out, "{{")?;
    writeln!(out, "\tFSTAB_FILE=/dev/null \"$@\"")?;
    writeln!(out, "\tfsck_ret=$?")?;
    writeln!(out, "\t[ \"${{fsck_ret}}\" -eq 0 ] && return 0")?;
    for (code, level, message) in FSCK_ERR {
        writeln!(
            out,
            "\t[ \"$((fsck_ret & {code}))\" -eq {code} ] && {level} {}",
            quote(&format!("fsck: {message}"))
        )?;
    }
    writeln!(out, "\t[ \"$((fsck_ret & {CODE_ERR}))\" -ne 0 ] && return 1")?;
    writeln!(
        out,
        "\tif [ \"$((fsck_ret & 2))\" -eq 2 ]; then notice 'Rebooting...'; reboot -f; fi"
    )?;
    writeln!(out, "\treturn 0")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    Ok(())
}

/// Overrides written to `/etc/lvm/lvmlocal.conf`: no udev, no lvmetad, no
/// lvmpolld inside the initramfs.
fn write_lvm_conf(out: &mut dyn Write) -> Result<()> {
    const LVM_CONF: [&str; 11] = [
        "activation/monitoring = 0",
        "activation/udev_rules = 0",
        "activation/udev_sync = 0",
        "devices/external_device_info_source = \"none\"",
        "devices/md_component_detection = 0",
        "devices/multipath_component_detection = 0",
        "devices/obtain_device_list_from_udev = 0",
        "global/locking_type = 4",
        "global/use_lvmetad = 0",
        "global/use_lvmlockd = 0",
        "global/use_lvmpolld = 0",
    ];

    writeln!(out, "debug 'Writing LVM configuration'")?;
    writeln!(
        out,
        "mkdir -p /etc/lvm && touch /etc/lvm/lvmlocal.conf || warn 'Failed to create LVM configuration file'"
    )?;
    writeln!(out, "{{")?;
    for line in LVM_CONF {
        writeln!(out, "\techo {}", quote(line))?;
    }
    writeln!(
        out,
        "}} >>/etc/lvm/lvmlocal.conf || warn 'Failed to write LVM configuration file'"
    )?;
    writeln!(out)?;
    Ok(())
}

/// `find_iface` maps a MAC address to the interface name.
fn write_fun_find_iface(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "find_iface()")?;
    writeln!(out, "{{")?;
    writeln!(out, "\tfor k in /sys/class/net/*; do")?;
    writeln!(
        out,
        "\t\tif ! grep -q \"${{1}}\" \"${{k}}/address\" 1>/dev/null 2>&1; then continue; fi"
    )?;
    writeln!(out, "\t\techo \"$(basename -- \"${{k}}\")\"")?;
    writeln!(out, "\t\treturn 0")?;
    writeln!(out, "\tdone")?;
    writeln!(out, "\treturn 1")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    Ok(())
}

/// One emission pass over a [`SourceGraph`].  Load state and the working
/// copy of the reverse-dependency lists are pass-local, so the same graph
/// can be emitted several times.
pub struct Scheduler<'a> {
    graph: &'a SourceGraph,
    loaded: Vec<bool>,
    needed_by: Vec<Vec<SourceId>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(graph: &'a SourceGraph) -> Self {
        Scheduler {
            graph,
            loaded: vec![false; graph.len()],
            needed_by: graph.nodes.iter().map(|node| node.needed_by.clone()).collect(),
        }
    }

    pub fn is_loaded(&self, id: SourceId) -> bool {
        self.loaded[id.0]
    }

    /// Emit the load of a node: dependencies first, then the node itself.
    /// After a non-final node loads, its reverse dependencies are loaded
    /// immediately so load-only dependencies can be dropped as early as
    /// possible (a LUKS key should not stay around).
    pub fn load(&mut self, id: SourceId, out: &mut dyn Write) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(id);
        if self.loaded[id.0] {
            return Err(Error::GraphInvariantBroken(format!(
                "{} is already loaded",
                graph.name(id)
            )));
        }
        debug!("Loading {}", graph.name(id));
        self.loaded[id.0] = true;
        for dep in node.need.iter().chain(node.lneed.iter()) {
            if !self.loaded[dep.0] {
                self.load(*dep, out)?;
            }
        }

        graph.write_load(id, out)?;

        if !node.is_final {
            for rev in self.needed_by[id.0].clone() {
                if !self.loaded[rev.0] {
                    self.load(rev, out)?;
                }
            }
        }
        for dep in node.lneed.clone() {
            self.needed_by[dep.0].retain(|rev| *rev != id);
            if self.needed_by[dep.0].is_empty() {
                self.unload(dep, out)?;
            }
        }
        Ok(())
    }

    /// Emit the unload of a node, then of any hard dependency this release
    /// leaves unreferenced.
    pub fn unload(&mut self, id: SourceId, out: &mut dyn Write) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(id);
        if !self.loaded[id.0] {
            return Err(Error::GraphInvariantBroken(format!(
                "{} is not loaded",
                graph.name(id)
            )));
        }
        if node.is_final || !self.needed_by[id.0].is_empty() {
            return Err(Error::GraphInvariantBroken(format!(
                "{} is still needed or not temporary",
                graph.name(id)
            )));
        }
        debug!("Unloading {}", graph.name(id));

        graph.write_unload(id, out)?;

        for dep in node.need.clone() {
            self.needed_by[dep.0].retain(|rev| *rev != id);
            if self.needed_by[dep.0].is_empty() {
                self.unload(dep, out)?;
            }
        }
        self.loaded[id.0] = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_load(graph: &SourceGraph, id: SourceId) -> String {
        let mut out = Vec::new();
        Scheduler::new(graph).load(id, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn offset(script: &str, needle: &str) -> usize {
        script
            .find(needle)
            .unwrap_or_else(|| panic!("{needle:?} not found in:\n{script}"))
    }

    #[test]
    fn hard_edge_promotes_load_edge() {
        let mut graph = SourceGraph::new();
        let a = graph.add_path("/dev/sda1");
        let b = graph.add_path("/dev/sdb1");
        graph.add_load_dep(a, b).unwrap();
        assert_eq!(graph.node(a).load_deps(), &[b]);
        graph.add_hard_dep(a, b).unwrap();
        assert_eq!(graph.node(a).load_deps(), &[] as &[SourceId]);
        assert_eq!(graph.node(a).hard_deps(), &[b]);
        // back edge stays unique
        assert_eq!(graph.node(b).reverse_deps(), &[a]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = SourceGraph::new();
        let a = graph.add_path("/a");
        let b = graph.add_path("/b");
        let c = graph.add_path("/c");
        graph.add_hard_dep(a, b).unwrap();
        graph.add_hard_dep(b, c).unwrap();
        assert!(matches!(
            graph.add_hard_dep(c, a),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            graph.add_load_dep(a, a),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn finality_propagates_over_hard_edges_only() {
        let mut graph = SourceGraph::new();
        let hard = graph.add_path("/hard");
        let hard2 = graph.add_path("/hard2");
        let loadonly = graph.add_path("/loadonly");
        let top = graph.add_path("/top");
        graph.add_hard_dep(top, hard).unwrap();
        graph.add_hard_dep(hard, hard2).unwrap();
        graph.add_load_dep(top, loadonly).unwrap();
        graph.set_final(top);
        assert!(graph.node(top).is_final());
        assert!(graph.node(hard).is_final());
        assert!(graph.node(hard2).is_final());
        assert!(!graph.node(loadonly).is_final());
    }

    #[test]
    fn lvm_path_doubles_hyphens() {
        let mut graph = SourceGraph::new();
        let lv = graph.add_lvm("foo-bar", "baz-qux");
        assert_eq!(
            graph.path(lv).unwrap(),
            "/dev/mapper/foo--bar-baz--qux"
        );
    }

    #[test]
    fn luks_load_with_key_file() {
        // Golden scenario: LUKS over UUID with a key file.
        let mut graph = SourceGraph::new();
        let uuid = graph.add_uuid("abcd-1234", false);
        let key = graph.add_path("/root/keyfile");
        let luks = graph
            .add_luks(uuid, "root", Some(key), None, false)
            .unwrap();
        graph.set_final(luks);
        let script = emit_load(&graph, luks);
        assert!(script.contains(
            "cryptsetup --key-file /root/keyfile open \"$(findfs UUID=abcd-1234)\" root || die 'Failed to unlock LUKS device root'"
        ));
        assert_eq!(graph.path(luks).unwrap(), "/dev/mapper/root");
    }

    #[test]
    fn lvm_on_luks_orders_loads() {
        // Golden scenario: LVM on LUKS.
        let mut graph = SourceGraph::new();
        let disk = graph.add_path("/dev/sda2");
        let luks = graph.add_luks(disk, "cryptroot", None, None, true).unwrap();
        let lvm = graph.add_lvm("vg0", "root");
        graph.add_hard_dep(lvm, luks).unwrap();
        graph.set_final(lvm);
        let script = emit_load(&graph, lvm);
        let unlock = offset(&script, "cryptsetup --allow-discards open /dev/sda2 cryptroot");
        let enable = offset(&script, "lvm lvchange --sysinit -a ly vg0/root");
        assert!(unlock < enable);
        assert!(script.contains("lvm vgmknodes || err"));
        assert_eq!(graph.path(lvm).unwrap(), "/dev/mapper/vg0-root");
        // No unloads: everything is final
        assert!(!script.contains("cryptsetup close"));
    }

    #[test]
    fn md_sources_serialize_uuids() {
        // Golden scenario: MD RAID assembled from two UUIDs.
        let mut graph = SourceGraph::new();
        let first = graph.add_uuid("aaaa", false);
        let second = graph.add_uuid("bbbb", false);
        let md = graph.add_md(&[first, second], "0").unwrap();
        graph.set_final(md);
        let script = emit_load(&graph, md);
        assert!(script
            .contains("MDADM_NO_UDEV=1 mdadm --assemble --uuid aaaa --uuid bbbb 0 || die"));
        assert_eq!(graph.path(md).unwrap(), "/dev/md/0");
    }

    #[test]
    fn mount_under_mnt_gets_mkdir() {
        // Golden scenario: extra mount under /mnt triggers auto-mkdir.
        let mut graph = SourceGraph::new();
        let dev = graph.add_path("/dev/sdb1");
        let mount = graph.add_mount(Some(dev), "/mnt/data", "ext4", "ro").unwrap();
        graph.set_final(mount);
        let script = emit_load(&graph, mount);
        let fsck = offset(&script, "mount_fsck fsck -t ext4 /dev/sdb1 || die");
        let mkdir = offset(&script, "[ -d /mnt/data ] || mkdir /mnt/data || err");
        let mnt = offset(&script, "mount -t ext4 -o ro /dev/sdb1 /mnt/data || die");
        assert!(fsck < mkdir && mkdir < mnt);
    }

    #[test]
    fn mount_outside_mnt_gets_no_mkdir() {
        let mut graph = SourceGraph::new();
        let dev = graph.add_path("/dev/sdb1");
        let mount = graph.add_mount(Some(dev), "/home", "ext4", "ro").unwrap();
        graph.set_final(mount);
        let script = emit_load(&graph, mount);
        assert!(!script.contains("mkdir"));
    }

    #[test]
    fn mount_without_source_skips_fsck() {
        let mut graph = SourceGraph::new();
        let mount = graph.add_mount(None, "/mnt/virtual", "tmpfs", "rw").unwrap();
        graph.set_final(mount);
        let script = emit_load(&graph, mount);
        assert!(!script.contains("mount_fsck"));
        assert!(script.contains("mount -t tmpfs -o rw none /mnt/virtual || die"));
    }

    #[test]
    fn load_only_dep_is_unloaded_after_use() {
        // The key mount is a load-only dependency of the LUKS device: its
        // unload comes after the unlock.
        let mut graph = SourceGraph::new();
        let keydev = graph.add_path("/dev/sdc1");
        let keymount = graph
            .add_mount(Some(keydev), "/mnt/keys", "ext4", "ro")
            .unwrap();
        let disk = graph.add_path("/dev/sda2");
        let luks = graph
            .add_luks(disk, "secure", Some(keymount), None, false)
            .unwrap();
        graph.set_final(luks);
        let script = emit_load(&graph, luks);
        let mount = offset(&script, "mount -t ext4");
        let unlock = offset(&script, "cryptsetup --key-file /mnt/keys open");
        let umount = offset(&script, "umount /mnt/keys");
        assert!(mount < unlock && unlock < umount);
    }

    #[test]
    fn every_load_emitted_once() {
        // A diamond: two mounts over the same LVM volume.
        let mut graph = SourceGraph::new();
        let lv = graph.add_lvm("vg0", "data");
        let first = graph.add_mount(Some(lv), "/mnt/a", "ext4", "ro").unwrap();
        let second = graph.add_mount(Some(lv), "/mnt/b", "ext4", "ro").unwrap();
        graph.set_final(first);
        graph.set_final(second);
        let mut out = Vec::new();
        let mut scheduler = Scheduler::new(&graph);
        scheduler.load(first, &mut out).unwrap();
        scheduler.load(second, &mut out).unwrap();
        let script = String::from_utf8(out).unwrap();
        assert_eq!(script.matches("lvm lvchange --sysinit -a ly").count(), 1);
        assert_eq!(script.matches("mount -t ext4").count(), 2);
    }

    #[test]
    fn double_load_is_invariant_violation() {
        let mut graph = SourceGraph::new();
        let path = graph.add_path("/dev/sda1");
        let mut scheduler = Scheduler::new(&graph);
        let mut out = Vec::new();
        scheduler.load(path, &mut out).unwrap();
        assert!(matches!(
            scheduler.load(path, &mut out),
            Err(Error::GraphInvariantBroken(_))
        ));
    }

    #[test]
    fn unload_guards() {
        let mut graph = SourceGraph::new();
        let final_node = graph.add_lvm("vg0", "root");
        graph.set_final(final_node);
        let mut out = Vec::new();
        let mut scheduler = Scheduler::new(&graph);
        // not loaded
        assert!(matches!(
            scheduler.unload(final_node, &mut out),
            Err(Error::GraphInvariantBroken(_))
        ));
        scheduler.load(final_node, &mut out).unwrap();
        // final
        assert!(matches!(
            scheduler.unload(final_node, &mut out),
            Err(Error::GraphInvariantBroken(_))
        ));
    }

    #[test]
    fn graph_is_reusable_across_passes() {
        let mut graph = SourceGraph::new();
        let disk = graph.add_path("/dev/sda2");
        let luks = graph.add_luks(disk, "root", None, None, false).unwrap();
        graph.set_final(luks);
        let first = emit_load(&graph, luks);
        let second = emit_load(&graph, luks);
        assert_eq!(first, second);
    }

    #[test]
    fn classful_mask_rejects_multicast() {
        assert_eq!(classful_mask("10.0.0.1").unwrap(), "255.0.0.0");
        assert_eq!(classful_mask("172.16.0.1").unwrap(), "255.255.0.0");
        assert_eq!(classful_mask("192.168.0.1").unwrap(), "255.255.255.0");
        assert!(classful_mask("224.0.0.1").is_err());
    }

    #[test]
    fn zfs_crypt_validates_dataset() {
        let mut graph = SourceGraph::new();
        let pool = graph.add_zfs_pool("tank", None).unwrap();
        assert!(graph.add_zfs_crypt(pool, "tank/secure", None).is_ok());
        let pool2 = graph.add_zfs_pool("tank2", None).unwrap();
        assert!(matches!(
            graph.add_zfs_crypt(pool2, "other/secure", None),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            graph.add_zfs_crypt(pool2, "", None),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn kinds_in_use_first_seen_order() {
        let mut graph = SourceGraph::new();
        let disk = graph.add_path("/dev/sda2");
        let luks = graph.add_luks(disk, "root", None, None, false).unwrap();
        let mount = graph.add_mount(Some(luks), "/newroot", "ext4", "ro").unwrap();
        let extra_dev = graph.add_path("/dev/sdz1");
        let extra = graph.add_mount(Some(extra_dev), "/mnt/x", "ext4", "ro").unwrap();
        let kinds = graph.kinds_in_use(&[mount, extra]);
        assert_eq!(
            kinds,
            vec![KindTag::Mount, KindTag::Luks, KindTag::Path]
        );
    }
}
