// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

//! The unit of work transported through the queues: one combination plus a
//! repeat index, with the attempt history accumulated by the workers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Local;
use serde::Serialize;

/// One invocation of a task's command sequence on a worker. The stdout
/// bytes ride along in memory but are never serialized into `info.yml`;
/// they land in the per-attempt stdout files instead.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub env_variables: BTreeMap<String, String>,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration: f64,
    pub status: Option<String>,
    #[serde(skip_serializing)]
    pub stdout: Vec<u8>,
}
impl Attempt {
    pub fn ok(&self) -> bool {
        self.status.as_deref() == Some("0")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub experiment_id: usize,
    pub experiment_name: String,
    pub combination_id: u64,
    pub repeat_id: usize,
    pub task_id: u64,
    /// Variable name to value bindings of this combination.
    pub combination: BTreeMap<String, String>,
    /// Command templates with the combination substituted in.
    pub commands: Vec<String>,
    pub work_dir: String,
    pub output_dir: PathBuf,
    pub max_tries: usize,
    pub assigned_to: Option<usize>,
    pub tries: usize,
    pub success: bool,
    pub attempts: Vec<Attempt>,
}
impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        experiment_id: usize,
        experiment_name: &str,
        combination_id: u64,
        repeat_id: usize,
        task_id: u64,
        combination: BTreeMap<String, String>,
        commands: Vec<String>,
        work_dir: &str,
        output_dir: PathBuf,
        max_tries: usize,
    ) -> Self {
        Task {
            experiment_id,
            experiment_name: experiment_name.to_string(),
            combination_id,
            repeat_id,
            task_id,
            combination,
            commands,
            work_dir: work_dir.to_string(),
            output_dir,
            max_tries,
            assigned_to: None,
            tries: 0,
            success: false,
            attempts: Vec::new(),
        }
    }
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}
