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

//! The initramfs image: an ordered store of [`Item`]s plus the operations
//! that fill it (skeleton layout, files with their ELF dependencies,
//! executables, libraries, kernel modules, busybox).
//!
//! Identical files are merged into hard-link sets; insertion order is
//! preserved so serialization is deterministic.

use log::{debug, info, warn};
use nix::unistd::{access, AccessFlags};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::elf::Resolver;
use crate::errors::{Error, PathContext, Result};
use crate::item::{DirectoryItem, FileItem, Item, NodeItem, NodeType, SymlinkItem};
use crate::kmod::{KmodResolver, KMOD_DIR};
use crate::runcmd_output;
use crate::util::{cmd_output, hash_file, normpath, parent_dir, strip_prefix_str};

/// Shell special built-in commands, always provided by `/bin/sh`.
pub const SHELL_SPECIAL_BUILTIN: &[&str] = &[
    "break", ":", "continue", ".", "eval", "exec", "exit", "export", "readonly", "return", "set",
    "shift", "times", "trap", "unset",
];

/// Shell reserved words, always provided by `/bin/sh`.
pub const SHELL_RESERVED_WORDS: &[&str] = &[
    "!", "{", "}", "case", "do", "done", "elif", "else", "esac", "fi", "for", "if", "in", "then",
    "until", "while",
];

/// An initramfs image under construction.
pub struct Initramfs {
    user: u32,
    group: u32,
    binroot: PathBuf,
    kernels: Vec<String>,
    items: Vec<Item>,
    resolver: Resolver,
    kmods: KmodResolver,
    visited_elf: HashSet<PathBuf>,
    hashes: std::collections::HashMap<PathBuf, [u8; 64]>,
}

impl Initramfs {
    /// Create the image and lay out its skeleton.  `kernels` are the
    /// target kernel versions; `None` targets the running kernel.
    pub fn new(
        user: u32,
        group: u32,
        binroot: &Path,
        kernels: Option<Vec<String>>,
    ) -> Result<Self> {
        let kernels = match kernels {
            Some(kernels) => kernels,
            None => vec![running_kernel()?],
        };
        debug!("Target kernels: {:?}", kernels);
        let mut initramfs = Initramfs {
            user,
            group,
            binroot: binroot.to_path_buf(),
            kernels,
            items: Vec::new(),
            resolver: Resolver::new(binroot),
            kmods: KmodResolver::new(),
            visited_elf: HashSet::new(),
            hashes: std::collections::HashMap::new(),
        };
        initramfs.mklayout()?;
        Ok(initramfs)
    }

    /// Base layout: standard directories, `/lib*` mirrored from the host,
    /// core device nodes, per-kernel module metadata.
    fn mklayout(&mut self) -> Result<()> {
        debug!("Creating initramfs layout");
        self.items.push(self.directory("/", 0o755));

        for dir in ["/bin", "/dev", "/etc", "/mnt", "/proc", "/root", "/run", "/sbin", "/sys"] {
            let item = self.directory(dir, 0o755);
            self.add_item(item)?;
        }

        // Only create /lib* mirroring what the host has
        for libdir in ["/lib", "/lib32", "/lib64"] {
            let host = self.binroot.join(libdir.trim_start_matches('/'));
            let meta = match fs::symlink_metadata(&host) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&host).path_ctx(&host)?;
                self.add_item(Item::Symlink(SymlinkItem {
                    mode: 0o777,
                    uid: self.user,
                    gid: self.group,
                    dest: libdir.to_string(),
                    target: target.to_string_lossy().into_owned(),
                }))?;
            } else if meta.is_dir() {
                let item = self.directory(libdir, 0o755);
                self.add_item(item)?;
            }
        }

        for (dest, mode, major, minor) in [
            ("/dev/console", 0o600, 5, 1),
            ("/dev/tty", 0o666, 5, 0),
            ("/dev/null", 0o666, 1, 3),
            ("/dev/kmsg", 0o644, 1, 11),
        ] {
            self.add_item(Item::Node(NodeItem {
                mode,
                uid: self.user,
                gid: self.group,
                dest: dest.to_string(),
                nodetype: NodeType::Character,
                major,
                minor,
            }))?;
        }

        for kernel in self.kernels.clone() {
            let kmod_dir = format!("{KMOD_DIR}/{kernel}");
            self.mkdir(&kmod_dir, 0o755, true)?;
            for name in ["modules.order", "modules.builtin", "modules.builtin.modinfo"] {
                self.add_file(Path::new(&format!("{kmod_dir}/{name}")), None, Some(0o640))?;
            }
        }
        Ok(())
    }

    fn directory(&self, dest: &str, mode: u32) -> Item {
        Item::Directory(DirectoryItem {
            mode,
            uid: self.user,
            gid: self.group,
            dest: dest.to_string(),
        })
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Check if a destination path exists in the image.
    pub fn contains(&self, path: &str) -> bool {
        self.items.iter().any(|item| item.contains(path))
    }

    /// Add an item to the image.  An identical (or hash-identical, for
    /// files) item absorbs the new destinations; a different item claiming
    /// the same destination is a conflict, and every destination's parent
    /// directory must already exist.
    pub fn add_item(&mut self, new_item: Item) -> Result<()> {
        let mut mergeable: Option<usize> = None;
        for (index, cur_item) in self.items.iter().enumerate() {
            if cur_item.is_mergeable(&new_item) {
                debug_assert!(mergeable.is_none());
                mergeable = Some(index);
                continue;
            }
            for dest in new_item.dests() {
                if cur_item.contains(dest) {
                    return Err(Error::ItemConflict {
                        item: new_item.to_string(),
                        other: cur_item.to_string(),
                    });
                }
            }
        }

        let missing: Vec<String> = new_item
            .dests()
            .iter()
            .filter(|dest| dest.as_str() != "/")
            .map(|dest| parent_dir(dest))
            .filter(|parent| !self.contains(parent))
            .collect();
        if !missing.is_empty() {
            return Err(Error::ItemMissingParent {
                item: new_item.to_string(),
                parents: missing,
            });
        }

        match mergeable {
            Some(index) => self.items[index].merge(new_item)?,
            None => {
                debug!("New item: {}", new_item);
                self.items.push(new_item);
            }
        }
        Ok(())
    }

    /// Normalize a destination path: make it canonical, strip the `/usr`
    /// merge, warn about whitespace (`gen_init_cpio` separates fields with
    /// spaces).
    fn normalize(&self, path: &str) -> Result<String> {
        let mut path = normpath(path);
        if !path.starts_with('/') {
            return Err(Error::ConfigInvalid(format!(
                "{path} is not an absolute path"
            )));
        }
        if path.starts_with("/usr/local/") {
            debug!("Stripping /usr/local/ from {}", path);
            path = strip_prefix_str(&path, "/usr/local").to_string();
        } else if path.starts_with("/usr/") {
            debug!("Stripping /usr/ from {}", path);
            path = strip_prefix_str(&path, "/usr").to_string();
        }
        if path.split_whitespace().count() != 1 {
            warn!("Whitespaces are not supported by gen_init_cpio: {}", path);
        }
        Ok(path)
    }

    /// Create a directory in the image, optionally with its parents.
    pub fn mkdir(&mut self, path: &str, mode: u32, parents: bool) -> Result<()> {
        let path = normpath(path);
        if parents && path != "/" && !self.contains(&parent_dir(&path)) {
            self.mkdir(&parent_dir(&path), mode, true)?;
        }
        let item = self.directory(&path, mode);
        self.add_item(item)
    }

    /// Add a file to the image.  Symlinks are dereferenced; a dynamically
    /// linked ELF brings in its dependencies, recursively.
    pub fn add_file(&mut self, src: &Path, dest: Option<&str>, mode: Option<u32>) -> Result<()> {
        let meta = fs::metadata(src).path_ctx(src)?;

        let src = if src.is_absolute() {
            src.to_path_buf()
        } else {
            env::current_dir().path_ctx(".")?.join(src)
        };
        let src = PathBuf::from(normpath(&src.to_string_lossy()));
        let dest = match dest {
            Some(dest) => dest.to_string(),
            None => src.to_string_lossy().into_owned(),
        };
        let dest = self.normalize(&dest)?;
        debug!("Adding {} as {}", src.display(), dest);

        // Pull in ELF dependencies, each of which recurses into its own
        if self.visited_elf.insert(src.clone()) {
            for (dep_src, dep_dest) in self.resolver.find_elf_deps(&src)? {
                self.add_file(&dep_src, Some(&dep_dest), None)?;
            }
        }

        let mode = match mode {
            Some(mode) => mode,
            None => meta.permissions().mode() & 0o7777,
        };
        let hash = self.hash(&src)?;
        self.add_item(Item::File(FileItem::new(
            mode, self.user, self.group, dest, src, hash,
        )))
    }

    /// Add an executable found through `PATH`.
    pub fn add_executable(&mut self, exec: &str, dest: Option<&str>, mode: Option<u32>) -> Result<()> {
        let (src, exec_dest) = self.resolver.find_exec(exec)?;
        self.add_file(&src, Some(dest.unwrap_or(&exec_dest)), mode)
    }

    /// Add a library found through the loader search directories.  The name
    /// may be a glob pattern.
    pub fn add_library(&mut self, lib: &str, dest: Option<&str>, mode: Option<u32>) -> Result<()> {
        let (src, lib_dest) = self.resolver.find_lib(lib)?;
        self.add_file(&src, Some(dest.unwrap_or(&lib_dest)), mode)
    }

    /// Add a kernel module and its dependencies for every target kernel.
    pub fn add_kmod(&mut self, module: &str, mode: Option<u32>) -> Result<()> {
        for kernel in self.kernels.clone() {
            self.add_kmod_for(module, &kernel, mode)?;
        }
        Ok(())
    }

    fn add_kmod_for(&mut self, module: &str, kernel: &str, mode: Option<u32>) -> Result<()> {
        let kmod = self.kmods.find_kmod(module, kernel)?;
        for dep in self.kmods.find_kmod_deps(&kmod)? {
            self.add_kmod_for(&dep, kernel, mode)?;
        }
        self.mkdir(&parent_dir(&kmod.to_string_lossy()), 0o755, true)?;
        self.add_file(&kmod, None, mode)
    }

    /// Add busybox and a hard link for every applet it reports.  Applets
    /// whose destination is already taken are skipped; any needed command
    /// that is neither an applet nor a shell built-in falls back to the
    /// host executable of that name.  Run this after everything else so the
    /// real binaries win over applets.
    pub fn add_busybox(&mut self, needed: &[String], sys_busybox: Option<&Path>) -> Result<()> {
        let sys_busybox = match sys_busybox {
            Some(path) => path.to_path_buf(),
            None => find_in_path("busybox").ok_or_else(|| Error::BinaryMissing("busybox".into()))?,
        };
        let mut applets: Vec<String> = SHELL_SPECIAL_BUILTIN
            .iter()
            .chain(SHELL_RESERVED_WORDS.iter())
            .map(|word| word.to_string())
            .collect();

        let (busybox_src, busybox_dest) = self.resolver.find_exec("busybox")?;
        self.add_file(&busybox_src, Some(&busybox_dest), None)?;

        let listing = runcmd_output!(&sys_busybox, "--list-full")
            .map_err(|err| Error::ExternalTool(format!("{err:#}")))?;
        for line in listing.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let applet = format!("/{line}");
            applets.push(
                applet
                    .rsplit('/')
                    .next()
                    .unwrap_or(&applet)
                    .to_string(),
            );
            match self.add_file(&busybox_src, Some(&applet), None) {
                Err(Error::ItemConflict { .. }) | Err(Error::ItemMissingParent { .. }) => {
                    debug!("Not adding applet {}: file exists", applet);
                }
                other => other?,
            }
        }

        for command in needed {
            if !applets.contains(command) {
                debug!("Adding missing command: {}", command);
                self.add_executable(command, None, None)?;
            }
        }
        Ok(())
    }

    fn hash(&mut self, path: &Path) -> Result<[u8; 64]> {
        if let Some(hash) = self.hashes.get(path) {
            return Ok(*hash);
        }
        let hash = hash_file(path).path_ctx(path)?;
        self.hashes.insert(path.to_path_buf(), hash);
        Ok(hash)
    }

    /// Write the image as a `gen_init_cpio` list, in insertion order.
    pub fn build_to_cpio_list(&self, dest: &mut dyn Write) -> Result<()> {
        for item in &self.items {
            debug!("Outputting {}", item);
            writeln!(dest, "{}", item.to_cpio_list())?;
        }
        Ok(())
    }

    /// Materialize the image into `dest`, which must not exist yet.  With
    /// `do_nodes` unset, device nodes are skipped (creating them needs
    /// `CAP_MKNOD`).
    pub fn build_to_directory(&self, dest: &Path, do_nodes: bool) -> Result<()> {
        for item in &self.items {
            if !do_nodes && matches!(item, Item::Node(_)) {
                warn!("Not building {}", item);
                continue;
            }
            debug!("Building {}", item);
            item.build_to_directory(dest)?;
        }
        Ok(())
    }
}

/// The version of the running kernel.
pub fn running_kernel() -> Result<String> {
    nix::sys::utsname::uname()
        .map(|uts| uts.release().to_string_lossy().into_owned())
        .map_err(|err| Error::Io {
            path: PathBuf::from("/proc/sys/kernel/osrelease"),
            source: err.into(),
        })
}

/// Search an executable in the build environment's own `PATH`.
fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var("PATH").ok()?;
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() && access(&candidate, AccessFlags::X_OK).is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Fill an image from resolved requirements: the init script, user files,
/// executables, libraries, kernel modules, the keymap, and finally busybox
/// with every shell command the init script relies on.
#[allow(clippy::too_many_arguments)]
pub fn populate(
    initramfs: &mut Initramfs,
    init: &Path,
    files: &[(String, Option<String>)],
    execs: &[(String, Option<String>)],
    libs: &[(String, Option<String>)],
    kmods: &[(String, Vec<String>)],
    keymap: Option<(&Path, &str)>,
    needed_cmds: &[String],
) -> Result<()> {
    info!("Generating /init");
    initramfs.add_file(init, Some("/init"), Some(0o755))?;

    info!("Copying files");
    for (src, dest) in files {
        initramfs.add_file(Path::new(src), dest.as_deref(), None)?;
    }
    info!("Copying executables");
    for (exec, dest) in execs {
        initramfs.add_executable(exec, dest.as_deref(), None)?;
    }
    info!("Copying libraries");
    for (lib, dest) in libs {
        initramfs.add_library(lib, dest.as_deref(), None)?;
    }
    info!("Copying kernel modules");
    for (module, _params) in kmods {
        initramfs.add_kmod(module, None)?;
    }
    if let Some((keymap_src, keymap_dest)) = keymap {
        info!("Copying keymap to {}", keymap_dest);
        initramfs.add_file(keymap_src, Some(keymap_dest), Some(0o644))?;
    }

    info!("Installing busybox");
    initramfs.add_busybox(needed_cmds, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;

    fn test_image() -> (tempfile::TempDir, Initramfs) {
        let binroot = tempfile::tempdir().unwrap();
        let initramfs = Initramfs::new(0, 0, binroot.path(), Some(Vec::new())).unwrap();
        (binroot, initramfs)
    }

    fn write_host_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    fn cpio_list(initramfs: &Initramfs) -> String {
        let mut out = Vec::new();
        initramfs.build_to_cpio_list(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn skeleton_layout() {
        let (_binroot, initramfs) = test_image();
        let list = cpio_list(&initramfs);
        assert!(list.starts_with("dir / 755 0 0\n"));
        for dir in ["/bin", "/dev", "/etc", "/mnt", "/proc", "/root", "/run", "/sbin", "/sys"] {
            assert!(list.contains(&format!("dir {dir} 755 0 0\n")));
        }
        assert!(list.contains("nod /dev/console 600 0 0 c 5 1\n"));
        assert!(list.contains("nod /dev/tty 666 0 0 c 5 0\n"));
        assert!(list.contains("nod /dev/null 666 0 0 c 1 3\n"));
        assert!(list.contains("nod /dev/kmsg 644 0 0 c 1 11\n"));
    }

    #[test]
    fn host_libdirs_are_mirrored() {
        let binroot = tempfile::tempdir().unwrap();
        fs::create_dir(binroot.path().join("lib")).unwrap();
        std::os::unix::fs::symlink("lib", binroot.path().join("lib64")).unwrap();
        let initramfs = Initramfs::new(0, 0, binroot.path(), Some(Vec::new())).unwrap();
        let list = cpio_list(&initramfs);
        assert!(list.contains("dir /lib 755 0 0\n"));
        assert!(list.contains("slink /lib64 lib 777 0 0\n"));
    }

    #[test]
    fn identical_files_become_hardlinks() {
        // Golden scenario: hash-merged hard links in the image.
        let binroot = tempfile::tempdir().unwrap();
        // own everything as the current user so materialization also works
        // without privileges
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();
        let mut initramfs =
            Initramfs::new(uid, gid, binroot.path(), Some(Vec::new())).unwrap();
        let first = write_host_file(binroot.path(), "first", b"identical");
        let second = write_host_file(binroot.path(), "second", b"identical");
        initramfs
            .add_file(&first, Some("/bin/first"), Some(0o755))
            .unwrap();
        initramfs
            .add_file(&second, Some("/bin/second"), Some(0o755))
            .unwrap();
        let list = cpio_list(&initramfs);
        let line = list
            .lines()
            .find(|line| line.contains("/bin/first"))
            .unwrap();
        assert!(line.ends_with("/bin/second"));
        assert_eq!(list.lines().filter(|l| l.contains("/bin/second")).count(), 1);

        // On-disk materialization: one inode, two names
        use std::os::linux::fs::MetadataExt;
        let build = tempfile::tempdir().unwrap();
        let dest = build.path().join("image");
        // device nodes need privileges
        initramfs.build_to_directory(&dest, false).unwrap();
        let meta_a = fs::metadata(dest.join("bin/first")).unwrap();
        let meta_b = fs::metadata(dest.join("bin/second")).unwrap();
        assert_eq!(meta_a.st_ino(), meta_b.st_ino());
    }

    #[test]
    fn conflicting_destination_is_an_error() {
        let (binroot, mut initramfs) = test_image();
        let first = write_host_file(binroot.path(), "first", b"one");
        let second = write_host_file(binroot.path(), "second", b"two");
        initramfs.add_file(&first, Some("/bin/tool"), Some(0o755)).unwrap();
        assert!(matches!(
            initramfs.add_file(&second, Some("/bin/tool"), Some(0o755)),
            Err(Error::ItemConflict { .. })
        ));
    }

    #[test]
    fn missing_parent_is_an_error() {
        let (binroot, mut initramfs) = test_image();
        let file = write_host_file(binroot.path(), "file", b"data");
        assert!(matches!(
            initramfs.add_file(&file, Some("/nonexistent/file"), None),
            Err(Error::ItemMissingParent { .. })
        ));
    }

    #[test]
    fn usr_prefix_is_stripped() {
        let (binroot, mut initramfs) = test_image();
        let file = write_host_file(binroot.path(), "tool", b"data");
        initramfs
            .add_file(&file, Some("/usr/bin/tool"), Some(0o755))
            .unwrap();
        initramfs
            .add_file(&file, Some("/usr/local/sbin/tool"), Some(0o755))
            .unwrap();
        assert!(initramfs.contains("/bin/tool"));
        assert!(initramfs.contains("/sbin/tool"));
        assert!(!initramfs.contains("/usr/bin/tool"));
    }

    #[test]
    fn mkdir_with_parents() {
        let (_binroot, mut initramfs) = test_image();
        initramfs.mkdir("/lib/modules/5.15.0/kernel", 0o755, true).unwrap();
        assert!(initramfs.contains("/lib/modules"));
        assert!(initramfs.contains("/lib/modules/5.15.0/kernel"));
        // repeated mkdir merges
        initramfs.mkdir("/lib/modules", 0o755, false).unwrap();
    }

    #[test]
    fn cpio_list_is_deterministic() {
        let build = |content: &[u8]| {
            let (binroot, mut initramfs) = test_image();
            let file = write_host_file(binroot.path(), "file", content);
            initramfs.add_file(&file, Some("/etc/data"), Some(0o644)).unwrap();
            // src paths differ between runs (tempdir), compare shapes
            cpio_list(&initramfs)
                .replace(&binroot.path().to_string_lossy().into_owned(), "BINROOT")
        };
        assert_eq!(build(b"data"), build(b"data"));
    }
}
