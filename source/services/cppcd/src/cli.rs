// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use crate::config::DaemonConfig;
use crate::{simulation, CppcError};

pub fn help() -> &'static str {
    "cppcd drives CPPC performance requests over a PCC channel. Usage: cppcd [--help] [--config <file.toml>]"
}

/// Parses `args`, runs the simulation and returns the summary.
pub fn execute(args: &[&str]) -> Result<String, CppcError> {
    if args.contains(&"--help") {
        return Ok(help().to_string());
    }
    let config = match args {
        [] => DaemonConfig::default(),
        ["--config", path] => DaemonConfig::load(Path::new(path))?,
        _ => return Err(CppcError::Usage(args.join(" "))),
    };
    Ok(simulation::run(&config)?.to_string())
}

pub fn run() -> i32 {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    match execute(&refs) {
        Ok(summary) => {
            println!("{summary}");
            0
        }
        Err(err) => {
            eprintln!("cppcd: {err}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{execute, help};
    use crate::CppcError;

    #[test]
    fn help_contains_name() {
        assert!(help().contains("cppcd"));
        assert!(execute(&["--help"]).unwrap().contains("--config"));
    }

    #[test]
    fn stray_arguments_are_usage_errors() {
        assert!(matches!(execute(&["--verbose"]), Err(CppcError::Usage(_))));
        assert!(matches!(execute(&["--config"]), Err(CppcError::Usage(_))));
    }
}
