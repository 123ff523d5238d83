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

//! Emission of the `/init` script.
//!
//! The script is written section by section in a fixed order: header and
//! helper functions, early breakpoint, environment initialization, kernel
//! command-line parsing, keymap, per-variant one-shot setup, breakpoints
//! interleaved with kernel-module loads, the root filesystem, the extra
//! mounts, and the final switch_root.

use std::io::Write;

use crate::data::{Scheduler, SourceGraph, SourceId};
use crate::errors::Result;
use crate::util::quote;

/// Breakpoints of the generated script.  Each can be enabled from the
/// kernel command line (`rd.break=init,mount`) or through its environment
/// variable (`RD_BREAK_EARLY=1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakpoint {
    /// Before any action, including command-line parsing.
    Early,
    /// After initramfs initialization.
    Init,
    /// After loading kernel modules.
    Module,
    /// After mounting the root filesystem.
    Rootfs,
    /// After mounting all filesystems.
    Mount,
}

impl Breakpoint {
    fn variable(&self) -> &'static str {
        match self {
            Breakpoint::Early => "RD_BREAK_EARLY",
            Breakpoint::Init => "RD_BREAK_INIT",
            Breakpoint::Module => "RD_BREAK_MODULE",
            Breakpoint::Rootfs => "RD_BREAK_ROOTFS",
            Breakpoint::Mount => "RD_BREAK_MOUNT",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Breakpoint::Early => "early",
            Breakpoint::Init => "init",
            Breakpoint::Module => "module",
            Breakpoint::Rootfs => "rootfs",
            Breakpoint::Mount => "mount",
        }
    }
}

/// User-supplied shell fragments run right before each breakpoint gate.
#[derive(Debug, Clone, Default)]
pub struct BreakScripts {
    pub early: Option<String>,
    pub init: Option<String>,
    pub module: Option<String>,
    pub rootfs: Option<String>,
    pub mount: Option<String>,
}

impl BreakScripts {
    fn get(&self, breakpoint: Breakpoint) -> Option<&str> {
        match breakpoint {
            Breakpoint::Early => self.early.as_deref(),
            Breakpoint::Init => self.init.as_deref(),
            Breakpoint::Module => self.module.as_deref(),
            Breakpoint::Rootfs => self.rootfs.as_deref(),
            Breakpoint::Mount => self.mount.as_deref(),
        }
    }
}

/// Everything the emitter needs besides the graph.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Keymap to load: destination path inside the image, and whether the
    /// keyboard goes to unicode mode.
    pub keymap: Option<(String, bool)>,
    /// Kernel modules to modprobe, with their parameters.
    pub modules: Vec<(String, Vec<String>)>,
    /// Init process executed after switch_root, unless `init=` overrides it.
    pub init: String,
    /// Per-breakpoint user commands.
    pub breaks: BreakScripts,
}

impl InitOptions {
    pub fn new() -> Self {
        InitOptions {
            keymap: None,
            modules: Vec::new(),
            init: "/sbin/init".to_string(),
            breaks: BreakScripts::default(),
        }
    }
}

/// Shell commands the script itself needs from busybox, on top of what the
/// data sources declare.
pub const INIT_SHELL_CMDS: &[&str] = &[
    "sh", "mount", "umount", "echo", "test", "[", "cat", "awk", "env", "kill", "sync", "uname",
    "depmod", "switch_root",
];

/// Commands needed only when a keymap is loaded.
pub const KEYMAP_SHELL_CMDS: &[&str] = &["kbd_mode", "loadkmap"];

/// Command needed only when kernel modules are loaded.
pub const MODULE_SHELL_CMDS: &[&str] = &["modprobe"];

/// The `log` family: one function per syslog severity, writing to the
/// kernel ring buffer and mirroring to stderr depending on
/// `RD_DEBUG`/`RD_QUIET`.  `log` always returns 0 so it can sit in `&&`
/// chains.
fn write_fun_log(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "log()")?;
    writeln!(out, "{{")?;
    writeln!(out, "\t_lvl=\"$1\"")?;
    writeln!(out, "\tshift")?;
    writeln!(out, "\techo \"<${{_lvl}}>initramfs: $*\" 1>/dev/kmsg")?;
    writeln!(out, "\tif [ -n \"${{RD_DEBUG+x}}\" ]; then _thresh=7")?;
    writeln!(out, "\telif [ -n \"${{RD_QUIET+x}}\" ]; then _thresh=3")?;
    writeln!(out, "\telse _thresh=6")?;
    writeln!(out, "\tfi")?;
    writeln!(out, "\t[ \"${{_lvl}}\" -le \"${{_thresh}}\" ] && echo \"$*\" 1>&2")?;
    writeln!(out, "\treturn 0")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    for (level, name) in [
        (0, "emerg"),
        (1, "alert"),
        (2, "crit"),
        (3, "err"),
        (4, "warn"),
        (5, "notice"),
        (6, "info"),
        (7, "debug"),
    ] {
        writeln!(out, "{name}() {{ log {level} \"$@\"; }}")?;
    }
    writeln!(out)?;
    Ok(())
}

/// `rescue_shell` drops the user into `/bin/sh` after printing the error.
/// Must not be called from a subshell.
fn write_fun_rescue_shell(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "rescue_shell()")?;
    writeln!(out, "{{")?;
    writeln!(out, "\terr \"$*\"")?;
    writeln!(out, "\tnotice 'Dropping you into a shell'")?;
    writeln!(out, "\texec '/bin/sh'")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    Ok(())
}

/// `panic` causes a kernel panic by exiting PID 1.
fn write_fun_panic(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "panic()")?;
    writeln!(out, "{{")?;
    writeln!(out, "\tcrit \"$*\"")?;
    writeln!(out, "\tnotice 'Terminating init'")?;
    writeln!(out, "\tsync")?;
    writeln!(out, "\texit")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    Ok(())
}

/// `die` routes fatal errors: kernel panic when `RD_PANIC` is set, rescue
/// shell otherwise.
fn write_fun_die(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "die()")?;
    writeln!(out, "{{")?;
    writeln!(
        out,
        "\t[ -n \"${{RD_PANIC+x}}\" ] && panic \"$@\" || rescue_shell \"$@\""
    )?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    Ok(())
}

/// Shebang, environment, helper functions.
pub fn do_header(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "#!/bin/sh")?;
    writeln!(out)?;
    writeln!(out, "HOME='/root'")?;
    writeln!(out, "export HOME")?;
    writeln!(out, "PATH='/bin:/sbin'")?;
    writeln!(out, "export PATH")?;
    writeln!(out)?;
    write_fun_log(out)?;
    write_fun_rescue_shell(out)?;
    write_fun_panic(out)?;
    write_fun_die(out)?;
    writeln!(out, "echo 'INITRAMFS: Start'")?;
    writeln!(out)?;
    Ok(())
}

/// Drop into a rescue shell if the breakpoint is enabled, running the
/// user's commands for this gate first.
pub fn do_break(out: &mut dyn Write, breakpoint: Breakpoint, scripts: &BreakScripts) -> Result<()> {
    if let Some(commands) = scripts.get(breakpoint) {
        for line in commands.lines() {
            writeln!(out, "{line}")?;
        }
    }
    writeln!(
        out,
        "[ -n \"${{{}+x}}\" ] && rescue_shell {}",
        breakpoint.variable(),
        quote(&format!("Reached breakpoint: {}", breakpoint.label()))
    )?;
    writeln!(out)?;
    Ok(())
}

/// PID-1 assertion, pseudo-filesystem mounts, kernel log level, and
/// `modules.dep` generation when the initramfs ships modules for the
/// running kernel.
pub fn do_init(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "info 'Initialization'")?;
    writeln!(out, "test $$ -eq 1 || die 'init expects to be run as PID 1'")?;
    writeln!(out, "mount -t proc none /proc || die 'Failed to mount /proc'")?;
    writeln!(out, "mount -t sysfs none /sys || die 'Failed to mount /sys'")?;
    writeln!(out, "mount -t devtmpfs none /dev || die 'Failed to mount /dev'")?;
    writeln!(
        out,
        "printk_level=\"$(awk '{{ print $1 }}' /proc/sys/kernel/printk)\""
    )?;
    writeln!(out, "echo 4 1>'/proc/sys/kernel/printk'")?;
    writeln!(out, "if [ -d \"/lib/modules/$(uname -r)\" ]; then")?;
    writeln!(out, "\tdepmod || die 'Failed to generate modules.dep'")?;
    writeln!(out, "else")?;
    writeln!(
        out,
        "\twarn \"This initramfs may be incompatible with the current kernel $(uname -r)\""
    )?;
    writeln!(out, "fi")?;
    writeln!(out)?;
    Ok(())
}

/// Kernel command-line parsing, up to the first `--`.  Unknown keys are
/// collected and reported once.
pub fn do_cmdline(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "info 'Parsing command-line'")?;
    writeln!(out, "unknown=''")?;
    writeln!(out, "for cmdline in $(cat /proc/cmdline); do")?;
    writeln!(out, "\tcase \"${{cmdline}}\" in")?;
    writeln!(out, "\t--) break ;;")?;
    writeln!(out, "\tinit=*) INIT=\"${{cmdline#*=}}\" ;;")?;
    writeln!(out, "\tdebug|rd.debug) RD_DEBUG=true ;;")?;
    writeln!(out, "\tquiet|rd.quiet) RD_QUIET=true ;;")?;
    writeln!(out, "\trd.panic) RD_PANIC=true ;;")?;
    writeln!(out, "\trd.break) RD_BREAK_ROOTFS=true ;;")?;
    writeln!(out, "\trd.break=*)")?;
    writeln!(out, "\t\tOLDIFS=\"${{IFS}}\"")?;
    writeln!(out, "\t\tIFS=','")?;
    writeln!(out, "\t\tfor bpoint in ${{cmdline#*=}}; do")?;
    writeln!(out, "\t\t\tcase \"${{bpoint}}\" in")?;
    writeln!(out, "\t\t\tinit) RD_BREAK_INIT=true ;;")?;
    writeln!(out, "\t\t\tmodule|modules) RD_BREAK_MODULE=true ;;")?;
    writeln!(out, "\t\t\trootfs) RD_BREAK_ROOTFS=true ;;")?;
    writeln!(out, "\t\t\tmount|mounts) RD_BREAK_MOUNT=true ;;")?;
    writeln!(out, "\t\t\t*) err \"Unknown breakpoint ${{bpoint}}\" ;;")?;
    writeln!(out, "\t\t\tesac")?;
    writeln!(out, "\t\tdone")?;
    writeln!(out, "\t\tIFS=\"${{OLDIFS}}\"")?;
    writeln!(out, "\t\t;;")?;
    writeln!(out, "\t*) unknown=\"${{unknown}} ${{cmdline}}\" ;;")?;
    writeln!(out, "\tesac")?;
    writeln!(out, "done")?;
    writeln!(
        out,
        "[ -n \"${{unknown}}\" ] && warn \"Ignoring unknown kernel parameters:${{unknown}}\""
    )?;
    writeln!(out)?;
    writeln!(
        out,
        "[ -n \"${{RD_DEBUG+x}}\" ] && [ -z \"${{RD_QUIET+x}}\" ] && PS4='+ $0:$LINENO: ' && set -x"
    )?;
    writeln!(out)?;
    Ok(())
}

/// Keyboard mode and keymap load.
pub fn do_keymap(out: &mut dyn Write, keymap_file: &str, unicode: bool) -> Result<()> {
    let keymap = quote(keymap_file);
    writeln!(out, "info 'Loading keymap'")?;
    writeln!(
        out,
        "[ -f {keymap} ] || die {}",
        quote(&format!("Failed to load keymap, file {keymap_file} not found"))
    )?;
    writeln!(
        out,
        "kbd_mode {} || die {}",
        if unicode { "-u" } else { "-a" },
        quote(&format!(
            "Failed to set keyboard mode to {}",
            if unicode { "unicode" } else { "ASCII" }
        ))
    )?;
    writeln!(
        out,
        "loadkmap <{keymap} || die {}",
        quote(&format!("Failed to load keymap {keymap_file}"))
    )?;
    writeln!(out)?;
    Ok(())
}

/// One `modprobe` invocation.
pub fn do_module(out: &mut dyn Write, module: &str, params: &[String]) -> Result<()> {
    writeln!(out, "info {}", quote(&format!("Loading kernel module {module}")))?;
    let mut command = format!("modprobe {}", quote(module));
    for param in params {
        command.push(' ');
        command.push_str(&quote(param));
    }
    writeln!(
        out,
        "{command} || die {}",
        quote(&format!("Failed to load module {module}"))
    )?;
    writeln!(out)?;
    Ok(())
}

/// Cleanup and `switch_root`: restore the console and kernel log level,
/// terminate everything else, unmount the pseudo-filesystems, and exec the
/// real init.
pub fn do_switch_root(
    out: &mut dyn Write,
    graph: &SourceGraph,
    newroot: SourceId,
    init: &str,
) -> Result<()> {
    let root_path = graph
        .path(newroot)
        .ok_or_else(|| crate::errors::Error::GraphInvariantBroken(format!(
            "{} cannot be used as root",
            graph.name(newroot)
        )))?;
    writeln!(out, "[ -z \"${{INIT+x}}\" ] && INIT={}", quote(init))?;
    writeln!(out, "info \"Running ${{INIT}} as init process\"")?;
    writeln!(out, "if [ -n \"${{RD_DEBUG+x}}\" ]; then")?;
    writeln!(out, "\tdebug '  with arguments:'")?;
    writeln!(out, "\tfor arg in \"$@\"; do debug \"    ${{arg}}\"; done")?;
    writeln!(out, "\tdebug '  with environment:'")?;
    writeln!(out, "\tenv | while read -r var; do debug \"    ${{var}}\"; done")?;
    writeln!(out, "fi")?;
    writeln!(out, "echo \"${{printk_level}}\" 1>'/proc/sys/kernel/printk'")?;
    writeln!(
        out,
        "exec 0<>'/dev/console' 1<>'/dev/console' 2<>'/dev/console'"
    )?;
    writeln!(out, "kill -TERM -1")?;
    writeln!(out, "umount /dev || umount -l /dev || die 'Failed to unmount /dev'")?;
    writeln!(out, "umount /proc || umount -l /proc || die 'Failed to unmount /proc'")?;
    writeln!(out, "umount /sys || umount -l /sys || die 'Failed to unmount /sys'")?;
    writeln!(out, "echo 'INITRAMFS: End'")?;
    writeln!(
        out,
        "exec switch_root {root_path} \"${{INIT}}\" \"$@\" || die 'Failed to switch root'"
    )?;
    writeln!(out)?;
    Ok(())
}

/// Write the whole init script.
pub fn write_init(
    out: &mut dyn Write,
    graph: &SourceGraph,
    root: SourceId,
    mounts: &[SourceId],
    options: &InitOptions,
) -> Result<()> {
    do_header(out)?;
    do_break(out, Breakpoint::Early, &options.breaks)?;
    do_init(out)?;
    do_cmdline(out)?;
    if let Some((keymap_file, unicode)) = &options.keymap {
        do_keymap(out, keymap_file, *unicode)?;
    }

    let mut roots = vec![root];
    roots.extend_from_slice(mounts);
    for tag in graph.kinds_in_use(&roots) {
        SourceGraph::write_class_init(tag, out)?;
    }

    do_break(out, Breakpoint::Init, &options.breaks)?;
    for (module, params) in &options.modules {
        do_module(out, module, params)?;
    }
    do_break(out, Breakpoint::Module, &options.breaks)?;

    let mut scheduler = Scheduler::new(graph);
    scheduler.load(root, out)?;
    do_break(out, Breakpoint::Rootfs, &options.breaks)?;
    for mount in mounts {
        if !scheduler.is_loaded(*mount) {
            scheduler.load(*mount, out)?;
        }
    }
    do_break(out, Breakpoint::Mount, &options.breaks)?;

    do_switch_root(out, graph, root, &options.init)?;
    Ok(())
}

/// Shell commands the generated script needs busybox (or fallback host
/// executables) to provide: the emitter's own plus everything declared by
/// the sources in use.
pub fn needed_commands(
    graph: &SourceGraph,
    root: SourceId,
    mounts: &[SourceId],
    options: &InitOptions,
) -> Vec<String> {
    let mut commands: Vec<String> = INIT_SHELL_CMDS.iter().map(|cmd| cmd.to_string()).collect();
    if options.keymap.is_some() {
        commands.extend(KEYMAP_SHELL_CMDS.iter().map(|cmd| cmd.to_string()));
    }
    if !options.modules.is_empty() {
        commands.extend(MODULE_SHELL_CMDS.iter().map(|cmd| cmd.to_string()));
    }
    let mut ids = vec![root];
    ids.extend_from_slice(mounts);
    for root in roots_with_deps(graph, &ids) {
        for command in graph.node(root).shell_cmds() {
            if !commands.contains(command) {
                commands.push(command.clone());
            }
        }
    }
    commands
}

/// The given nodes followed by all their dependencies, in declaration
/// order, deduplicated.
pub fn roots_with_deps(graph: &SourceGraph, roots: &[SourceId]) -> Vec<SourceId> {
    let mut ids = Vec::new();
    for root in roots {
        for id in std::iter::once(*root).chain(graph.iter_all_deps(*root)) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(graph: &SourceGraph, root: SourceId, mounts: &[SourceId], options: &InitOptions) -> String {
        let mut out = Vec::new();
        write_init(&mut out, graph, root, mounts, options).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn offset(script: &str, needle: &str) -> usize {
        script
            .find(needle)
            .unwrap_or_else(|| panic!("{needle:?} not found in:\n{script}"))
    }

    #[test]
    fn plain_path_root() {
        // Golden scenario: plain path root.
        let mut graph = SourceGraph::new();
        let root = graph.add_path("/dev/sda1");
        graph.set_final(root);
        let script = emit(&graph, root, &[], &InitOptions::new());

        assert!(script.starts_with("#!/bin/sh\n"));
        let sections = [
            "export PATH",
            "RD_BREAK_EARLY+x",
            "info 'Initialization'",
            "info 'Parsing command-line'",
            "RD_BREAK_INIT+x",
            "RD_BREAK_MODULE+x",
            "RD_BREAK_ROOTFS+x",
            "RD_BREAK_MOUNT+x",
            "exec switch_root /dev/sda1 \"${INIT}\" \"$@\"",
        ];
        let mut last = 0;
        for section in sections {
            let position = offset(&script, section);
            assert!(position >= last, "{section} out of order");
            last = position;
        }
        // Path is a no-op: no per-variant init, no load fragment, no modprobe
        assert!(!script.contains("modprobe"));
        assert!(!script.contains("mount_fsck"));
        assert!(!script.contains("find_iface"));
    }

    #[test]
    fn luks_root_emits_class_free_sections_in_order() {
        // Golden scenario: LUKS over UUID with key file.
        let mut graph = SourceGraph::new();
        let uuid = graph.add_uuid("abcd-1234", false);
        let key = graph.add_path("/root/keyfile");
        let root = graph.add_luks(uuid, "root", Some(key), None, false).unwrap();
        graph.set_final(root);
        let script = emit(&graph, root, &[], &InitOptions::new());
        assert!(script.contains(
            "cryptsetup --key-file /root/keyfile open \"$(findfs UUID=abcd-1234)\" root || die"
        ));
        assert!(script.contains("exec switch_root /dev/mapper/root \"${INIT}\" \"$@\""));
    }

    #[test]
    fn class_init_emitted_once_before_loads() {
        let mut graph = SourceGraph::new();
        let first_dev = graph.add_path("/dev/sda1");
        let root = graph.add_mount(Some(first_dev), "/newroot", "ext4", "ro").unwrap();
        let second_dev = graph.add_path("/dev/sdb1");
        let extra = graph
            .add_mount(Some(second_dev), "/mnt/data", "ext4", "ro")
            .unwrap();
        graph.set_final(root);
        graph.set_final(extra);
        let script = emit(&graph, root, &[extra], &InitOptions::new());
        assert_eq!(script.matches("mount_fsck()").count(), 1);
        assert!(offset(&script, "mount_fsck()") < offset(&script, "mount -t ext4"));
        // Extra mount loads between the rootfs and mount gates
        let rootfs_gate = offset(&script, "RD_BREAK_ROOTFS+x");
        let data_mount = offset(&script, "mount -t ext4 -o ro /dev/sdb1 /mnt/data");
        let mount_gate = offset(&script, "RD_BREAK_MOUNT+x");
        assert!(rootfs_gate < data_mount && data_mount < mount_gate);
    }

    #[test]
    fn modules_load_between_init_and_module_gates() {
        let mut graph = SourceGraph::new();
        let root = graph.add_path("/dev/sda1");
        graph.set_final(root);
        let mut options = InitOptions::new();
        options.modules = vec![
            ("ext4".to_string(), Vec::new()),
            ("zswap".to_string(), vec!["enabled=1".to_string()]),
        ];
        let script = emit(&graph, root, &[], &options);
        let init_gate = offset(&script, "RD_BREAK_INIT+x");
        let first = offset(&script, "modprobe ext4 || die");
        let second = offset(&script, "modprobe zswap enabled=1 || die");
        let module_gate = offset(&script, "RD_BREAK_MODULE+x");
        assert!(init_gate < first && first < second && second < module_gate);
    }

    #[test]
    fn keymap_section_present_when_configured() {
        let mut graph = SourceGraph::new();
        let root = graph.add_path("/dev/sda1");
        graph.set_final(root);
        let mut options = InitOptions::new();
        options.keymap = Some(("/root/keymap.bmap".to_string(), true));
        let script = emit(&graph, root, &[], &options);
        assert!(script.contains("kbd_mode -u || die"));
        assert!(script.contains("loadkmap </root/keymap.bmap || die"));
    }

    #[test]
    fn break_scripts_run_before_their_gate() {
        let mut graph = SourceGraph::new();
        let root = graph.add_path("/dev/sda1");
        graph.set_final(root);
        let mut options = InitOptions::new();
        options.breaks.early = Some("ls /dev".to_string());
        let script = emit(&graph, root, &[], &options);
        assert!(offset(&script, "ls /dev") < offset(&script, "RD_BREAK_EARLY+x"));
    }

    #[test]
    fn custom_init_process() {
        let mut graph = SourceGraph::new();
        let root = graph.add_path("/dev/sda1");
        graph.set_final(root);
        let mut options = InitOptions::new();
        options.init = "/lib/systemd/systemd".to_string();
        let script = emit(&graph, root, &[], &options);
        assert!(script.contains("[ -z \"${INIT+x}\" ] && INIT=/lib/systemd/systemd"));
    }

    #[test]
    fn needed_commands_aggregate() {
        let mut graph = SourceGraph::new();
        let dev = graph.add_path("/dev/sda1");
        let root = graph.add_mount(Some(dev), "/newroot", "ext4", "ro").unwrap();
        graph.set_final(root);
        let mut options = InitOptions::new();
        options.keymap = Some(("/root/keymap.bmap".to_string(), true));
        let commands = needed_commands(&graph, root, &[], &options);
        for command in ["sh", "switch_root", "kbd_mode", "loadkmap", "fsck", "reboot"] {
            assert!(commands.contains(&command.to_string()), "{command} missing");
        }
        assert!(!commands.contains(&"modprobe".to_string()));
    }
}
