// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Loads raw machine code into an executable region and calls into it.

mod logger;

use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, ValueHint};
use color_eyre::eyre::{Context, bail, ensure};
use jit_region::{
    EntryPoint, ExecutableRegion, RETURN_INSTRUCTION, RegionConfig, SystemProvider,
};
use serde::Deserialize;

#[derive(Debug, Parser)]
#[clap(version)]
struct Args {
    /// Size hint for the region in bytes. Zero picks the configured default.
    #[clap(short, long, default_value_t = 0)]
    size: usize,

    /// Offset of the entry point, relative to the start of the region.
    #[clap(short, long, default_value_t = 0)]
    entry: usize,

    /// Path to the runner configuration file, in TOML.
    #[clap(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Enables verbose logging
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Machine code as hex strings, e.g. `c3` or `"48 31 c0 c3"`.
    ///
    /// Defaults to a single return instruction for the host architecture.
    code: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Configuration {
    #[serde(default)]
    region: RegionConfig,
}

impl Configuration {
    fn from_file(path: &Path) -> color_eyre::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse configuration {}", path.display()))
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    logger::init(args.verbose)?;

    let config = match &args.config {
        Some(path) => Configuration::from_file(path)?,
        None => Configuration::default(),
    };
    tracing::debug!("{config:?}");

    let code = if args.code.is_empty() {
        RETURN_INSTRUCTION.to_vec()
    } else {
        parse_code(&args.code)?
    };

    let mut region = ExecutableRegion::allocate_with(SystemProvider, &config.region, args.size)
        .wrap_err("failed to allocate region")?;
    region
        .write(0, &code)
        .wrap_err("failed to write machine code")?;
    tracing::debug!("wrote {:#x} bytes of machine code", code.len());

    let entry = EntryPoint::new(args.entry);
    let Some(entrypoint) = region.entry_address(entry) else {
        bail!(
            "entry offset {:#x} is outside of the {:#x} byte region",
            args.entry,
            region.len()
        );
    };
    println!("entrypoint: {entrypoint:#x}");

    // Safety: the user asserts the provided bytes are a valid function for the host
    unsafe { region.finalize_and_run(entry) }
        .wrap_err("failed to run machine code")?;

    println!("ok");

    Ok(())
}

/// Decodes every argument as hex, ignoring whitespace, and concatenates the bytes.
fn parse_code(args: &[String]) -> color_eyre::Result<Vec<u8>> {
    let mut code = Vec::new();

    for arg in args {
        let digits: Vec<char> = arg.chars().filter(|c| !c.is_whitespace()).collect();
        if let Some(c) = digits.iter().find(|c| !c.is_ascii_hexdigit()) {
            bail!("invalid hex digit {c:?} in {arg:?}");
        }
        if digits.len() % 2 != 0 {
            bail!("odd number of hex digits in {arg:?}");
        }

        for pair in digits.chunks_exact(2) {
            let pair: String = pair.iter().collect();
            let byte = u8::from_str_radix(&pair, 16)
                .with_context(|| format!("invalid hex byte {pair:?} in {arg:?}"))?;
            code.push(byte);
        }
    }

    ensure!(!code.is_empty(), "no machine code given");

    Ok(code)
}
