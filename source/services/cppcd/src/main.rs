// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: CPPC daemon entrypoint wiring to service logic

fn main() {
    env_logger::init();
    std::process::exit(cppcd::run());
}
