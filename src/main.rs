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

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use libinitramgen::archive::{self, CompressWriter};
use libinitramgen::cmdline::{ArchiveConfig, ArchiveMethod, Cmd, CommonConfig, ListConfig, ScriptConfig, TreeConfig};
use libinitramgen::config::{self, locale_is_utf8, Config};
use libinitramgen::init;
use libinitramgen::initramfs::{self, Initramfs};
use libinitramgen::keymap;

fn main() -> Result<()> {
    let cmd = Cmd::parse();
    setup_logging(cmd.common());

    match cmd {
        Cmd::Script(config) => script(config),
        Cmd::Tree(config) => tree(config),
        Cmd::List(config) => list(config),
        Cmd::Archive(config) => archive_cmd(config),
    }
}

fn setup_logging(common: &CommonConfig) {
    let level = if common.verbose {
        LevelFilter::Debug
    } else if common.quiet >= 2 {
        LevelFilter::Error
    } else if common.quiet == 1 {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn load_config(common: &CommonConfig) -> Result<Config> {
    let path = common
        .config
        .clone()
        .or_else(config::find_config_file)
        .context("no configuration file found")?;
    config::read_config(&path).with_context(|| format!("parsing {}", path.display()))
}

/// Generate the init script into memory.
fn generate_script(config: &Config) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    init::write_init(
        &mut out,
        &config.graph,
        config.root,
        &config.mounts,
        &config.init_options(),
    )?;
    Ok(out)
}

fn script(options: ScriptConfig) -> Result<()> {
    let config = load_config(&options.common)?;
    let script = generate_script(&config)?;
    if options.output == "-" {
        io::stdout().write_all(&script)?;
    } else {
        fs::write(&options.output, &script)
            .with_context(|| format!("writing {}", options.output))?;
    }
    Ok(())
}

/// Intermediate artifacts of a build, removable on completion.
struct BuildArtifacts {
    init_path: PathBuf,
    keymap_path: Option<PathBuf>,
}

impl BuildArtifacts {
    fn cleanup(&self) {
        for path in std::iter::once(&self.init_path).chain(self.keymap_path.iter()) {
            if path.exists() {
                info!("Cleaning {}", path.display());
                if let Err(err) = fs::remove_file(path) {
                    warn!("Failed to remove {}: {err}", path.display());
                }
            }
        }
    }
}

/// Build the keymap and init script, then fill an image with everything
/// the configuration requires.
fn build_image(
    config: &Config,
    kernels: &[String],
    dry_run: bool,
) -> Result<(Initramfs, BuildArtifacts)> {
    // Keymap
    let mut keymap_path = None;
    if let Some(keymap) = &config.keymap {
        if let Some(src) = &keymap.src {
            keymap::keymap_build(src, &keymap.build, locale_is_utf8())?;
        }
        keymap_path = Some(keymap.build.clone());
    }

    // Init script; the image copies it from disk
    info!("Generating init script to {}", config.init_path.display());
    fs::write(&config.init_path, generate_script(config)?)
        .with_context(|| format!("writing {}", config.init_path.display()))?;

    let (user, group) = if dry_run {
        (
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        )
    } else {
        (0, 0)
    };
    let kernels = if kernels.is_empty() {
        None
    } else {
        Some(kernels.to_vec())
    };

    info!("Creating initramfs");
    let mut image = Initramfs::new(user, group, Path::new("/"), kernels)?;
    let requirements = config.requirements();
    let needed = init::needed_commands(
        &config.graph,
        config.root,
        &config.mounts,
        &config.init_options(),
    );
    let keymap_pair = match (&keymap_path, &config.keymap) {
        (Some(path), Some(keymap)) => Some((path.as_path(), keymap.dest.as_str())),
        _ => None,
    };
    initramfs::populate(
        &mut image,
        &config.init_path,
        &requirements.files,
        &requirements.execs,
        &requirements.libs,
        &requirements.kmods,
        keymap_pair,
        &needed,
    )?;

    Ok((
        image,
        BuildArtifacts {
            init_path: config.init_path.clone(),
            keymap_path,
        },
    ))
}

/// Prepare the build directory: refuse to reuse an existing one unless the
/// caller asked for a forced clean.
fn prepare_build_dir(build_dir: &Path, clean: bool) -> Result<()> {
    if build_dir.exists() {
        if !clean {
            bail!(
                "{} already exists, use --clean to overwrite it",
                build_dir.display()
            );
        }
        warn!("Overwriting {}", build_dir.display());
        fs::remove_dir_all(build_dir)
            .with_context(|| format!("removing {}", build_dir.display()))?;
    }
    Ok(())
}

fn tree(options: TreeConfig) -> Result<()> {
    let config = load_config(&options.common)?;
    let build_dir = options
        .build_dir
        .clone()
        .or_else(|| config.build_dir.clone())
        .unwrap_or_else(|| PathBuf::from("/tmp/initramfs"));

    let (image, _artifacts) = build_image(&config, &options.kernels, options.dry_run)?;
    prepare_build_dir(&build_dir, options.clean)?;
    info!("Building initramfs to directory {}", build_dir.display());
    image.build_to_directory(&build_dir, !options.dry_run)?;
    Ok(())
}

fn list(options: ListConfig) -> Result<()> {
    let config = load_config(&options.common)?;
    let (image, artifacts) = build_image(&config, &options.kernels, options.dry_run)?;

    info!("Generating CPIO list");
    if options.output == "-" {
        let stdout = io::stdout();
        image.build_to_cpio_list(&mut stdout.lock())?;
    } else {
        let mut out = fs::File::create(&options.output)
            .with_context(|| format!("creating {}", options.output))?;
        image.build_to_cpio_list(&mut out)?;
    }

    if !options.keep {
        artifacts.cleanup();
    }
    Ok(())
}

fn open_output(path: &Path) -> Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        let file =
            fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
        Ok(Box::new(file))
    }
}

fn archive_cmd(options: ArchiveConfig) -> Result<()> {
    let config = load_config(&options.common)?;
    let output = options
        .output
        .clone()
        .or_else(|| config.output.clone())
        .unwrap_or_else(|| PathBuf::from("/usr/src/initramfs.cpio"));

    let (image, artifacts) = build_image(&config, &options.kernels, options.dry_run)?;

    info!(
        "Generating CPIO archive to {} ({}, {})",
        output.display(),
        options.method,
        options.compress
    );
    let mut dest = CompressWriter::new(open_output(&output)?, options.compress)?;
    let mut build_dir_used = None;
    match options.method {
        ArchiveMethod::GenInitCpio => {
            let cpio_list = options
                .cpio_list
                .clone()
                .unwrap_or_else(|| PathBuf::from("/tmp/initramfs.list"));
            let mut list_file = fs::File::create(&cpio_list)
                .with_context(|| format!("creating {}", cpio_list.display()))?;
            image.build_to_cpio_list(&mut list_file)?;
            drop(list_file);
            archive::cpio_from_list(&cpio_list, &mut dest)?;
            if !options.keep {
                info!("Cleaning {}", cpio_list.display());
                let _ = fs::remove_file(&cpio_list);
            }
        }
        ArchiveMethod::Dir => {
            let build_dir = options
                .build_dir
                .clone()
                .or_else(|| config.build_dir.clone())
                .unwrap_or_else(|| PathBuf::from("/tmp/initramfs"));
            prepare_build_dir(&build_dir, options.clean)?;
            info!("Building initramfs to directory {}", build_dir.display());
            image.build_to_directory(&build_dir, !options.dry_run)?;
            archive::cpio_from_dir(&build_dir, &mut dest)?;
            build_dir_used = Some(build_dir);
        }
        ArchiveMethod::Internal => {
            dest = archive::write_archive(&image, dest)?;
        }
    }
    let mut inner = dest.finish()?;
    inner.flush()?;
    drop(inner);

    if !options.keep {
        artifacts.cleanup();
        if let Some(build_dir) = build_dir_used {
            info!("Cleaning {}", build_dir.display());
            if let Err(err) = fs::remove_dir_all(&build_dir) {
                warn!("Failed to remove {}: {err}", build_dir.display());
            }
        }
    }
    Ok(())
}
