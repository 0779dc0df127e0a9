// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

use anyhow::Result;
use argh::FromArgs;

pub mod explore;
pub mod version;

#[derive(FromArgs, PartialEq, Debug)]
/// a distributed experiment executor.
/// For more information, see: https://github.com/diegofps/patas
pub struct TopLevel {
    #[argh(subcommand)]
    nested: Args,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
/// patas commands
pub enum Args {
    Explore(explore::Args),
    Version(version::Args),
}

pub fn run(args: &TopLevel) -> Result<()> {
    match &args.nested {
        Args::Explore(args) => explore::run(args),
        Args::Version(args) => version::run(args),
    }
}
