// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

use std::env::current_dir;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::process::Output;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use dirs::home_dir;

pub fn run_bash_command(cmd: &str, dir: Option<&str>) -> Result<Output> {
    let mut c = Command::new("bash");
    let c = if let Some(dir) = dir {
        c.current_dir(dir)
    } else {
        &mut c
    };
    c.arg("-c")
        .arg(cmd)
        .output()
        .context("Failed to execute cmd")
}

/// Resolves `~` and relative paths into absolute ones. An empty string is
/// returned unchanged so optional paths can pass through.
pub fn expand_path(filepath: &str) -> Result<String> {
    if filepath.is_empty() || filepath.starts_with('/') {
        return Ok(filepath.to_string());
    }
    if let Some(rest) = filepath.strip_prefix('~') {
        let home = home_dir().context("Failed to determine home dir")?;
        let rest = rest.trim_start_matches('/');
        return Ok(home.join(rest).to_string_lossy().into_owned());
    }
    let abs = current_dir()
        .context("Failed to determine current dir")?
        .join(filepath);
    Ok(abs.to_string_lossy().into_owned())
}

/// Rewrites a path under the local home directory to start with the literal
/// `$HOME`, so a remote shell re-expands it against its own home.
pub fn rewrite_home_prefix(path: &str) -> String {
    if let Some(home) = home_dir() {
        let home = home.to_string_lossy().into_owned();
        if path == home {
            return "$HOME".to_string();
        }
        if let Some(rest) = path.strip_prefix(&format!("{home}/")) {
            return format!("$HOME/{rest}");
        }
    }
    path.to_string()
}

/// Removes everything inside a folder, creating it if it does not exist.
pub fn clean_folder(folder: &Path) -> Result<()> {
    if !folder.exists() {
        fs::create_dir_all(folder).context(format!("Failed to create folder {folder:?}"))?;
        return Ok(());
    }
    if !folder.is_dir() {
        bail!("{folder:?} exists but is not a folder");
    }
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).context(format!("Failed to remove {path:?}"))?;
        } else {
            fs::remove_file(&path).context(format!("Failed to remove {path:?}"))?;
        }
    }
    Ok(())
}

pub fn human_time(seconds: f64) -> String {
    let mut v = seconds;
    if v < 60.0 {
        return format!("{v:.1} seconds");
    }
    v /= 60.0;
    if v < 60.0 {
        return format!("{v:.1} minutes");
    }
    v /= 60.0;
    if v < 24.0 {
        return format!("{v:.1} hours");
    }
    v /= 24.0;
    if v < 7.0 {
        return format!("{v:.1} days");
    }
    v /= 7.0;
    if v < 52.0 {
        return format!("{:.1} weeks ~ {:.1} months", v, v / 4.0);
    }
    v /= 52.0;
    format!("{v:.1} years")
}

pub fn estimate(tasks: usize, workers: usize, unit_seconds: f64) -> String {
    human_time(tasks as f64 / workers.max(1) as f64 * unit_seconds)
}

const RESET: &str = "\x1b[0m";
const GRAY: &str = "\x1b[90m";
const RED: &str = "\x1b[91m";
const GREEN: &str = "\x1b[92m";
const YELLOW: &str = "\x1b[93m";
const BLUE: &str = "\x1b[94m";
const PURPLE: &str = "\x1b[95m";
const WHITE: &str = "\x1b[97m";

/// Console helper for user-facing run output. Verbosity and color support
/// are per-instance configuration, threaded into whoever prints.
#[derive(Debug, Clone)]
pub struct Ui {
    quiet: bool,
    colors: bool,
}
impl Ui {
    pub fn new(quiet: bool, colors: bool) -> Self {
        Self { quiet, colors }
    }
    pub fn quiet(&self) -> bool {
        self.quiet
    }
    fn paint(&self, color: &str, s: &str) -> String {
        if self.colors {
            format!("{color}{s}{RESET}")
        } else {
            s.to_string()
        }
    }
    pub fn gray(&self, s: &str) -> String {
        self.paint(GRAY, s)
    }
    pub fn red(&self, s: &str) -> String {
        self.paint(RED, s)
    }
    pub fn green(&self, s: &str) -> String {
        self.paint(GREEN, s)
    }
    pub fn blue(&self, s: &str) -> String {
        self.paint(BLUE, s)
    }
    pub fn purple(&self, s: &str) -> String {
        self.paint(PURPLE, s)
    }
    pub fn white(&self, s: &str) -> String {
        self.paint(WHITE, s)
    }
    pub fn section(&self, title: &str) {
        println!("{}", self.white(&format!("\n --- {title} --- \n")));
    }
    pub fn info(&self, msg: &str) {
        println!("{}", self.paint(GREEN, &format!("|INFO| {msg}")));
    }
    pub fn warn(&self, msg: &str) {
        println!("{}", self.paint(YELLOW, &format!("|WARNING| {msg}")));
    }
    pub fn critical(&self, msg: &str) {
        println!("{}", self.paint(RED, &format!("|CRITICAL| {msg}")));
    }
    /// Asks a yes/no question on the controlling terminal. Returns false on
    /// an explicit `n` or on EOF.
    pub fn confirm(&self, prompt: &str) -> Result<bool> {
        loop {
            print!("{prompt} [Y/n] ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            let n = std::io::stdin()
                .read_line(&mut line)
                .context("Failed to read confirmation")?;
            if n == 0 {
                return Ok(false);
            }
            match line.trim() {
                "" | "y" | "Y" => return Ok(true),
                "n" | "N" => return Ok(false),
                _ => println!("Invalid option"),
            }
        }
    }
}
