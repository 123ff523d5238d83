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

use anyhow::{anyhow, Result};
use clap::{AppSettings, Args, Parser};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::archive::Compression;

// Args are listed in --help in the order declared in these structs/enums.

#[derive(Debug, Parser)]
#[clap(version)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
pub enum Cmd {
    /// Print the generated init script
    Script(ScriptConfig),
    /// Build the initramfs into a directory
    Tree(TreeConfig),
    /// Build a gen_init_cpio compatible file list
    List(ListConfig),
    /// Build the initramfs CPIO archive
    Archive(ArchiveConfig),
}

impl Cmd {
    pub fn common(&self) -> &CommonConfig {
        match self {
            Cmd::Script(config) => &config.common,
            Cmd::Tree(config) => &config.common,
            Cmd::List(config) => &config.common,
            Cmd::Archive(config) => &config.common,
        }
    }
}

#[derive(Debug, Args)]
pub struct CommonConfig {
    /// Configuration file to use
    #[clap(short = 'c', long, value_name = "PATH", env = "INITRAMGEN_CONFIG")]
    pub config: Option<PathBuf>,
    /// Be verbose
    #[clap(short, long)]
    pub verbose: bool,
    /// Be quiet (can be repeated)
    #[clap(short, long, parse(from_occurrences))]
    pub quiet: u32,
}

#[derive(Debug, Parser)]
pub struct ScriptConfig {
    #[clap(flatten)]
    pub common: CommonConfig,
    /// Output file for the init script ("-" for stdout)
    #[clap(short, long, value_name = "PATH", default_value = "-")]
    pub output: String,
}

#[derive(Debug, Parser)]
pub struct TreeConfig {
    #[clap(flatten)]
    pub common: CommonConfig,
    /// Location of the initramfs directory
    #[clap(short = 'b', long, value_name = "DIR")]
    pub build_dir: Option<PathBuf>,
    /// Overwrite the build directory if it exists, use carefully
    #[clap(short = 'C', long)]
    pub clean: bool,
    /// Non-root mode: skip device nodes, own files as the current user
    #[clap(short = 'd', long)]
    pub dry_run: bool,
    /// Target kernel version (can be repeated, defaults to the running
    /// kernel)
    #[clap(long = "kernel", value_name = "VERSION")]
    pub kernels: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct ListConfig {
    #[clap(flatten)]
    pub common: CommonConfig,
    /// Output file for the CPIO list ("-" for stdout)
    #[clap(short, long, value_name = "PATH", default_value = "-")]
    pub output: String,
    /// Keep the generated init script and keymap
    #[clap(short = 'k', long)]
    pub keep: bool,
    /// Build for the current user instead of root
    #[clap(short = 'd', long)]
    pub dry_run: bool,
    /// Target kernel version (can be repeated, defaults to the running
    /// kernel)
    #[clap(long = "kernel", value_name = "VERSION")]
    pub kernels: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct ArchiveConfig {
    #[clap(flatten)]
    pub common: CommonConfig,
    /// Output file for the CPIO archive ("-" for stdout)
    #[clap(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Compression applied to the archive
    #[clap(long, value_name = "FORMAT", default_value = "none", parse(try_from_str))]
    pub compress: Compression,
    /// How to produce the archive
    #[clap(long, value_name = "METHOD", default_value = "geninitcpio", parse(try_from_str))]
    pub method: ArchiveMethod,
    /// Location of the intermediate CPIO list (geninitcpio method)
    #[clap(short = 'l', long, value_name = "PATH")]
    pub cpio_list: Option<PathBuf>,
    /// Location of the intermediate initramfs directory (dir method)
    #[clap(short = 'b', long, value_name = "DIR")]
    pub build_dir: Option<PathBuf>,
    /// Keep the intermediate files
    #[clap(short = 'k', long)]
    pub keep: bool,
    /// Overwrite the build directory if it exists, use carefully
    #[clap(short = 'C', long)]
    pub clean: bool,
    /// Non-root mode: skip device nodes, own files as the current user
    #[clap(short = 'd', long)]
    pub dry_run: bool,
    /// Target kernel version (can be repeated, defaults to the running
    /// kernel)
    #[clap(long = "kernel", value_name = "VERSION")]
    pub kernels: Vec<String>,
}

/// Way of turning the image into a newc archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMethod {
    /// Write a file list and feed it to `gen_init_cpio`
    GenInitCpio,
    /// Build a directory and pipe `find` into `cpio`
    Dir,
    /// Write the newc stream in process
    Internal,
}

impl FromStr for ArchiveMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "geninitcpio" => Ok(ArchiveMethod::GenInitCpio),
            "dir" => Ok(ArchiveMethod::Dir),
            "internal" => Ok(ArchiveMethod::Internal),
            other => Err(anyhow!("unknown archive method: {other}")),
        }
    }
}

impl fmt::Display for ArchiveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveMethod::GenInitCpio => "geninitcpio",
            ArchiveMethod::Dir => "dir",
            ArchiveMethod::Internal => "internal",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_subcommands() {
        let cmd = Cmd::try_parse_from(["initramgen", "script", "-c", "/etc/x.ini"]).unwrap();
        assert!(matches!(cmd, Cmd::Script(_)));
        assert_eq!(
            cmd.common().config.as_deref(),
            Some(std::path::Path::new("/etc/x.ini"))
        );

        let cmd = Cmd::try_parse_from([
            "initramgen",
            "archive",
            "--compress",
            "xz",
            "--method",
            "internal",
            "-o",
            "/boot/initramfs.img",
        ])
        .unwrap();
        match cmd {
            Cmd::Archive(config) => {
                assert_eq!(config.compress, Compression::Xz);
                assert_eq!(config.method, ArchiveMethod::Internal);
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cmd::try_parse_from(["initramgen", "archive", "--compress", "rar"]).is_err());
    }

    #[test]
    fn quiet_accumulates() {
        let cmd = Cmd::try_parse_from(["initramgen", "list", "-qq"]).unwrap();
        assert_eq!(cmd.common().quiet, 2);
    }
}
