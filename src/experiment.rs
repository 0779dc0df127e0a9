// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

//! Experiment strategies. The grid strategy expands the Cartesian product
//! of its variables into tasks, owns the experiment's on-disk layout under
//! the output folder, and detects configuration drift through a signature
//! stored in `info.yml`.

use std::collections::BTreeMap;
use std::env::current_dir;
use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::config::ExperimentConfig;
use crate::config::ExperimentKind;
use crate::config::Variable;
use crate::task::Task;
use crate::util::clean_folder;
use crate::util::expand_path;
use crate::util::rewrite_home_prefix;

pub const SUCCESS_MARKER: &str = ".success";
pub const FAILURE_MARKER: &str = ".failure";

lazy_static! {
    static ref RE_PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// Destination queues populated by `on_start`. Implemented by the
/// scheduler; kept as a trait so task generation is testable without one.
pub trait TaskSink {
    fn push_todo(&mut self, task: Task);
    fn push_done(&mut self, task: Task);
    fn push_filtered(&mut self, task: Task);
}

/// The strategy interface the scheduler is polymorphic over.
pub enum Experiment {
    Grid(GridExperiment),
    Cdeepso(CdeepsoExperiment),
}
impl Experiment {
    pub fn new(id: usize, config: ExperimentConfig, output_root: &Path) -> Result<Self> {
        config.validate()?;
        match config.kind {
            ExperimentKind::Grid => Ok(Experiment::Grid(GridExperiment::new(
                id,
                config,
                output_root,
            )?)),
            ExperimentKind::Cdeepso => Ok(Experiment::Cdeepso(CdeepsoExperiment::new(config)?)),
        }
    }
    pub fn name(&self) -> &str {
        match self {
            Experiment::Grid(e) => &e.config.name,
            Experiment::Cdeepso(e) => &e.config.name,
        }
    }
    pub fn number_of_tasks(&self) -> usize {
        match self {
            Experiment::Grid(e) => e.number_of_tasks(),
            Experiment::Cdeepso(_) => 0,
        }
    }
    pub fn show_summary(&self) {
        match self {
            Experiment::Grid(e) => e.show_summary(),
            Experiment::Cdeepso(e) => {
                println!(
                    "    '{}' is a cdeepso experiment (not implemented)",
                    e.config.name
                );
            }
        }
    }
    /// Returns true when the on-disk signature matches the configured one
    /// or no prior run exists in the output folder.
    pub fn check_signature(&self) -> bool {
        match self {
            Experiment::Grid(e) => e.check_signature(),
            Experiment::Cdeepso(_) => true,
        }
    }
    pub fn write_info(&self) -> Result<()> {
        match self {
            Experiment::Grid(e) => e.write_info(),
            Experiment::Cdeepso(_) => Ok(()),
        }
    }
    pub fn clean_output(&self) -> Result<()> {
        match self {
            Experiment::Grid(e) => clean_folder(&e.output_folder),
            Experiment::Cdeepso(_) => Ok(()),
        }
    }
    pub fn on_start(&self, sink: &mut dyn TaskSink) -> Result<()> {
        match self {
            Experiment::Grid(e) => e.on_start(sink),
            Experiment::Cdeepso(e) => bail!(
                "Experiment {}: the cdeepso strategy is not implemented yet",
                e.config.name
            ),
        }
    }
    pub fn on_task_completed(&self, task: &Task) -> Result<()> {
        match self {
            Experiment::Grid(e) => e.on_task_completed(task),
            Experiment::Cdeepso(_) => Ok(()),
        }
    }
    pub fn on_finish(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct SignaturePayload<'a> {
    commands: &'a [String],
    variables: Vec<(&'a str, &'a [String])>,
    workdir: &'a str,
    repeat: usize,
}

#[derive(Serialize)]
struct ExperimentInfo<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: String,
    commands: &'a [String],
    workdir: &'a str,
    repeat: usize,
    max_tries: usize,
    redo_tasks: bool,
    variables: BTreeMap<&'a str, &'a [String]>,
    signature: &'a str,
}

pub struct GridExperiment {
    id: usize,
    config: ExperimentConfig,
    variables: Vec<Variable>,
    work_dir: String,
    output_folder: PathBuf,
    signature: String,
}
impl GridExperiment {
    fn new(id: usize, config: ExperimentConfig, output_root: &Path) -> Result<Self> {
        let variables = config
            .vars
            .iter()
            .map(|spec| spec.materialize())
            .collect::<Result<Vec<Variable>>>()?;
        let work_dir = match &config.workdir {
            Some(dir) => expand_path(dir)?,
            None => {
                let cwd = current_dir().context("Failed to determine current dir")?;
                rewrite_home_prefix(&cwd.to_string_lossy())
            }
        };
        for cmd in &config.cmd {
            validate_placeholders(cmd, &variables).context(anyhow!(
                "Experiment {}: invalid command template: {cmd}",
                config.name
            ))?;
        }
        let output_folder = output_root.join(&config.name);
        let signature = compute_signature(&config.cmd, &variables, &work_dir, config.repeat)?;
        Ok(GridExperiment {
            id,
            config,
            variables,
            work_dir,
            output_folder,
            signature,
        })
    }

    pub fn number_of_combinations(&self) -> usize {
        self.variables.iter().map(|v| v.values.len()).product()
    }

    pub fn number_of_tasks(&self) -> usize {
        self.number_of_combinations() * self.config.repeat
    }

    fn show_summary(&self) {
        println!(
            "    '{}' has {} variable(s), {} combination(s), and {} task(s):",
            self.config.name,
            self.variables.len(),
            self.number_of_combinations(),
            self.number_of_tasks()
        );
        for var in &self.variables {
            println!(
                "        {} = {:?}, len = {}",
                var.name,
                var.values,
                var.values.len()
            );
        }
    }

    /// Decodes a combination id into its variable bindings. Ids are
    /// lexicographic over the variable order, rightmost variable fastest.
    fn combination(&self, combination_id: u64) -> BTreeMap<String, String> {
        let mut id = combination_id;
        let mut bindings = BTreeMap::new();
        for var in self.variables.iter().rev() {
            let len = var.values.len() as u64;
            let index = (id % len) as usize;
            id /= len;
            bindings.insert(var.name.clone(), var.values[index].clone());
        }
        bindings
    }

    fn included(&self, task_id: u64) -> bool {
        if self.config.task_filters.is_empty() {
            return true;
        }
        self.config
            .task_filters
            .iter()
            .any(|filter| filter.contains(task_id))
    }

    fn check_signature(&self) -> bool {
        let info_path = self.output_folder.join("info.yml");
        let Ok(text) = fs::read_to_string(&info_path) else {
            return true;
        };
        let Ok(info) = serde_yaml::from_str::<serde_yaml::Value>(&text) else {
            return true;
        };
        match info.get("signature").and_then(|s| s.as_str()) {
            Some(previous) => previous == self.signature,
            None => true,
        }
    }

    fn write_info(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder).context(anyhow!(
            "Failed to create experiment folder {:?}",
            self.output_folder
        ))?;
        let info = ExperimentInfo {
            name: &self.config.name,
            kind: self.config.kind.to_string(),
            commands: &self.config.cmd,
            workdir: &self.work_dir,
            repeat: self.config.repeat,
            max_tries: self.config.max_tries,
            redo_tasks: self.config.redo_tasks,
            variables: self
                .variables
                .iter()
                .map(|v| (v.name.as_str(), v.values.as_slice()))
                .collect(),
            signature: &self.signature,
        };
        let text = serde_yaml::to_string(&info)?;
        let info_path = self.output_folder.join("info.yml");
        fs::write(&info_path, text)
            .context(anyhow!("Failed to write {info_path:?}"))
    }

    fn on_start(&self, sink: &mut dyn TaskSink) -> Result<()> {
        let repeat = self.config.repeat;
        for combination_id in 0..self.number_of_combinations() as u64 {
            let bindings = self.combination(combination_id);
            let commands = self
                .config
                .cmd
                .iter()
                .map(|cmd| substitute(cmd, &bindings))
                .collect::<Result<Vec<String>>>()?;
            for repeat_id in 0..repeat {
                let task_id = combination_id * repeat as u64 + repeat_id as u64;
                let task_dir = self.output_folder.join(task_id.to_string());
                let task = Task::new(
                    self.id,
                    &self.config.name,
                    combination_id,
                    repeat_id,
                    task_id,
                    bindings.clone(),
                    commands.clone(),
                    &self.work_dir,
                    task_dir.clone(),
                    self.config.max_tries,
                );
                if !self.included(task_id) {
                    sink.push_filtered(task);
                    continue;
                }
                let succeeded = task_dir.join(SUCCESS_MARKER).exists();
                let failed = task_dir.join(FAILURE_MARKER).exists();
                if !self.config.redo_tasks && (succeeded || failed) {
                    let mut task = task;
                    task.success = succeeded;
                    sink.push_done(task);
                    continue;
                }
                sink.push_todo(task);
            }
        }
        Ok(())
    }

    /// Writes the durable projection of a terminal task: metadata, one
    /// stdout file per attempt, and the terminal marker last so readers
    /// can treat its absence as "incomplete".
    fn on_task_completed(&self, task: &Task) -> Result<()> {
        clean_folder(&task.output_dir)?;

        let info = serde_yaml::to_string(task)?;
        fs::write(task.output_dir.join("info.yml"), info).context(anyhow!(
            "Failed to write task info for task {}",
            task.task_id
        ))?;

        let mut failures = 0;
        for attempt in &task.attempts {
            let filename = if attempt.ok() {
                "success.stdout".to_string()
            } else {
                let name = format!("fail{failures}.stdout");
                failures += 1;
                name
            };
            fs::write(task.output_dir.join(filename), &attempt.stdout)?;
        }

        let marker = if task.success {
            SUCCESS_MARKER
        } else {
            FAILURE_MARKER
        };
        File::create(task.output_dir.join(marker))?;
        Ok(())
    }
}

/// Placeholder for the population-based search strategy. The option and
/// its fitness-extraction regex parse, but starting it always fails.
pub struct CdeepsoExperiment {
    config: ExperimentConfig,
}
impl CdeepsoExperiment {
    fn new(config: ExperimentConfig) -> Result<Self> {
        if let Some(pattern) = &config.score_pattern {
            Regex::new(pattern).context(anyhow!(
                "Experiment {}: invalid score pattern: {pattern}",
                config.name
            ))?;
        }
        Ok(CdeepsoExperiment { config })
    }
}

fn compute_signature(
    commands: &[String],
    variables: &[Variable],
    work_dir: &str,
    repeat: usize,
) -> Result<String> {
    let payload = SignaturePayload {
        commands,
        variables: variables
            .iter()
            .map(|v| (v.name.as_str(), v.values.as_slice()))
            .collect(),
        workdir: work_dir,
        repeat,
    };
    let canonical = serde_json::to_string(&payload)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(STANDARD.encode(digest))
}

fn validate_placeholders(template: &str, variables: &[Variable]) -> Result<()> {
    for captures in RE_PLACEHOLDER.captures_iter(template) {
        let name = &captures[1];
        if !variables.iter().any(|v| v.name == name) {
            bail!("Unknown variable in command template: {name}");
        }
    }
    Ok(())
}

/// Replaces `{name}` placeholders with the combination's bindings.
fn substitute(template: &str, bindings: &BTreeMap<String, String>) -> Result<String> {
    let mut result = String::new();
    let mut last = 0;
    for captures in RE_PLACEHOLDER.captures_iter(template) {
        let whole = captures.get(0).context("placeholder match vanished")?;
        let name = &captures[1];
        let value = bindings
            .get(name)
            .context(anyhow!("Unknown variable in command template: {name}"))?;
        result.push_str(&template[last..whole.start()]);
        result.push_str(value);
        last = whole.end();
    }
    result.push_str(&template[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scalar;
    use crate::config::TaskFilter;
    use crate::config::VariableSpec;
    use crate::task::Attempt;
    use chrono::Local;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct VecSink {
        todo: Vec<Task>,
        done: Vec<Task>,
        filtered: Vec<Task>,
    }
    impl TaskSink for VecSink {
        fn push_todo(&mut self, task: Task) {
            self.todo.push(task);
        }
        fn push_done(&mut self, task: Task) {
            self.done.push(task);
        }
        fn push_filtered(&mut self, task: Task) {
            self.filtered.push(task);
        }
    }

    fn list_var(name: &str, values: &[&str]) -> VariableSpec {
        VariableSpec::List {
            name: name.to_string(),
            values: values.iter().map(|v| Scalar::Str(v.to_string())).collect(),
        }
    }

    fn config(cmd: &str, vars: Vec<VariableSpec>) -> ExperimentConfig {
        ExperimentConfig {
            name: "exp".to_string(),
            kind: ExperimentKind::Grid,
            workdir: Some("/tmp".to_string()),
            cmd: vec![cmd.to_string()],
            repeat: 1,
            max_tries: 3,
            redo_tasks: false,
            vars,
            score_pattern: None,
            task_filters: Vec::new(),
        }
    }

    fn grid(config: ExperimentConfig, root: &Path) -> GridExperiment {
        match Experiment::new(0, config, root).unwrap() {
            Experiment::Grid(e) => e,
            _ => panic!("expected a grid experiment"),
        }
    }

    #[test]
    fn rightmost_variable_varies_fastest() {
        let root = tempfile::tempdir().unwrap();
        let e = grid(
            config(
                "echo {a} {b}",
                vec![list_var("a", &["1", "2"]), list_var("b", &["x", "y", "z"])],
            ),
            root.path(),
        );
        assert_eq!(e.number_of_combinations(), 6);
        let decode = |id: u64| {
            let c = e.combination(id);
            format!("{} {}", c["a"], c["b"])
        };
        assert_eq!(decode(0), "1 x");
        assert_eq!(decode(1), "1 y");
        assert_eq!(decode(2), "1 z");
        assert_eq!(decode(3), "2 x");
        assert_eq!(decode(5), "2 z");
    }

    #[test]
    fn zero_variables_make_one_combination() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config("echo hi", Vec::new());
        cfg.repeat = 4;
        let e = grid(cfg, root.path());
        assert_eq!(e.number_of_combinations(), 1);
        assert_eq!(e.number_of_tasks(), 4);
        let mut sink = VecSink::default();
        e.on_start(&mut sink).unwrap();
        assert_eq!(sink.todo.len(), 4);
        let ids: Vec<u64> = sink.todo.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn on_start_respects_task_filters() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(
            "echo {n}",
            vec![list_var("n", &["0", "1", "2", "3", "4"])],
        );
        cfg.task_filters = vec![TaskFilter::parse("1:4").unwrap()];
        let e = grid(cfg, root.path());
        let mut sink = VecSink::default();
        e.on_start(&mut sink).unwrap();
        let todo: Vec<u64> = sink.todo.iter().map(|t| t.task_id).collect();
        let filtered: Vec<u64> = sink.filtered.iter().map(|t| t.task_id).collect();
        assert_eq!(todo, vec![1, 2, 3]);
        assert_eq!(filtered, vec![0, 4]);
        assert_eq!(sink.todo.len() + sink.done.len() + sink.filtered.len(), 5);
    }

    #[test]
    fn terminal_markers_short_circuit_to_done() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config("echo {n}", vec![list_var("n", &["a", "b", "c"])]);
        let e = grid(cfg, root.path());
        let done_dir = root.path().join("exp").join("1");
        fs::create_dir_all(&done_dir).unwrap();
        File::create(done_dir.join(SUCCESS_MARKER)).unwrap();
        let failed_dir = root.path().join("exp").join("2");
        fs::create_dir_all(&failed_dir).unwrap();
        File::create(failed_dir.join(FAILURE_MARKER)).unwrap();

        let mut sink = VecSink::default();
        e.on_start(&mut sink).unwrap();
        let todo: Vec<u64> = sink.todo.iter().map(|t| t.task_id).collect();
        let done: Vec<u64> = sink.done.iter().map(|t| t.task_id).collect();
        assert_eq!(todo, vec![0]);
        assert_eq!(done, vec![1, 2]);
        assert!(sink.done[0].success);
        assert!(!sink.done[1].success);
    }

    #[test]
    fn redo_tasks_ignores_markers() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config("echo {n}", vec![list_var("n", &["a", "b"])]);
        cfg.redo_tasks = true;
        let e = grid(cfg, root.path());
        let done_dir = root.path().join("exp").join("0");
        fs::create_dir_all(&done_dir).unwrap();
        File::create(done_dir.join(SUCCESS_MARKER)).unwrap();

        let mut sink = VecSink::default();
        e.on_start(&mut sink).unwrap();
        assert_eq!(sink.todo.len(), 2);
        assert!(sink.done.is_empty());
    }

    #[test]
    fn substitution_resolves_commands() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(
            "./run --size {n} --mode {mode}",
            vec![list_var("n", &["8"]), list_var("mode", &["fast"])],
        );
        cfg.repeat = 2;
        let e = grid(cfg, root.path());
        let mut sink = VecSink::default();
        e.on_start(&mut sink).unwrap();
        assert_eq!(sink.todo[0].commands, vec!["./run --size 8 --mode fast"]);
        assert_eq!(sink.todo[0].combination["n"], "8");
        // Task ids interleave repeats within a combination.
        assert_eq!(sink.todo[0].task_id, 0);
        assert_eq!(sink.todo[0].repeat_id, 0);
        assert_eq!(sink.todo[1].task_id, 1);
        assert_eq!(sink.todo[1].repeat_id, 1);
    }

    #[test]
    fn unknown_placeholder_is_a_config_error() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config("echo {typo}", vec![list_var("n", &["1"])]);
        assert!(Experiment::new(0, cfg, root.path()).is_err());
    }

    #[test]
    fn signature_is_deterministic_and_sensitive() {
        let root = tempfile::tempdir().unwrap();
        let base = || config("echo {n}", vec![list_var("n", &["1", "2"])]);
        let a = grid(base(), root.path()).signature;
        let b = grid(base(), root.path()).signature;
        assert_eq!(a, b);

        let mut changed = base();
        changed.cmd = vec!["echo changed {n}".to_string()];
        assert_ne!(a, grid(changed, root.path()).signature);

        let changed = config("echo {n}", vec![list_var("n", &["1", "3"])]);
        assert_ne!(a, grid(changed, root.path()).signature);

        let mut changed = base();
        changed.repeat = 2;
        assert_ne!(a, grid(changed, root.path()).signature);

        let mut changed = base();
        changed.workdir = Some("/opt".to_string());
        assert_ne!(a, grid(changed, root.path()).signature);

        // max_tries is retry policy, not identity.
        let mut changed = base();
        changed.max_tries = 9;
        assert_eq!(a, grid(changed, root.path()).signature);
    }

    #[test]
    fn check_signature_matches_or_absent() {
        let root = tempfile::tempdir().unwrap();
        let e = grid(config("echo {n}", vec![list_var("n", &["1"])]), root.path());
        assert!(e.check_signature());
        e.write_info().unwrap();
        assert!(e.check_signature());

        let mut changed_cfg = config("echo changed {n}", vec![list_var("n", &["1"])]);
        changed_cfg.name = "exp".to_string();
        let changed = grid(changed_cfg, root.path());
        assert!(!changed.check_signature());
    }

    fn attempt(status: &str, stdout: &[u8]) -> Attempt {
        Attempt {
            env_variables: BTreeMap::new(),
            started_at: Local::now(),
            ended_at: Local::now(),
            duration: 0.1,
            status: Some(status.to_string()),
            stdout: stdout.to_vec(),
        }
    }

    #[test]
    fn completed_task_writes_the_result_tree() {
        let root = tempfile::tempdir().unwrap();
        let e = grid(config("echo {n}", vec![list_var("n", &["a"])]), root.path());
        let mut sink = VecSink::default();
        e.on_start(&mut sink).unwrap();
        let mut task = sink.todo.pop().unwrap();

        // Stale content from an older round must disappear.
        fs::create_dir_all(&task.output_dir).unwrap();
        fs::write(task.output_dir.join("stale.stdout"), b"old").unwrap();

        task.attempts.push(attempt("1", b"boom\n"));
        task.attempts.push(attempt("0", b"a\n"));
        task.tries = 2;
        task.success = true;
        e.on_task_completed(&task).unwrap();

        let dir = &task.output_dir;
        assert!(!dir.join("stale.stdout").exists());
        assert_eq!(fs::read(dir.join("fail0.stdout")).unwrap(), b"boom\n");
        assert_eq!(fs::read(dir.join("success.stdout")).unwrap(), b"a\n");
        assert!(dir.join(SUCCESS_MARKER).exists());
        assert!(!dir.join(FAILURE_MARKER).exists());

        let info: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(dir.join("info.yml")).unwrap()).unwrap();
        assert_eq!(info["success"].as_bool(), Some(true));
        assert_eq!(info["tries"].as_u64(), Some(2));
        assert_eq!(info["attempts"].as_sequence().unwrap().len(), 2);
        // Attempt stdout bodies stay out of the metadata.
        assert!(!fs::read_to_string(dir.join("info.yml")).unwrap().contains("boom"));
    }

    #[test]
    fn given_up_task_writes_failure_marker() {
        let root = tempfile::tempdir().unwrap();
        let e = grid(config("false", Vec::new()), root.path());
        let mut sink = VecSink::default();
        e.on_start(&mut sink).unwrap();
        let mut task = sink.todo.pop().unwrap();

        for i in 0..3 {
            task.attempts.push(attempt("1", format!("try {i}\n").as_bytes()));
        }
        task.tries = 3;
        task.success = false;
        e.on_task_completed(&task).unwrap();

        let dir = &task.output_dir;
        assert!(dir.join("fail0.stdout").exists());
        assert!(dir.join("fail1.stdout").exists());
        assert!(dir.join("fail2.stdout").exists());
        assert!(!dir.join("success.stdout").exists());
        assert!(dir.join(FAILURE_MARKER).exists());
        assert!(!dir.join(SUCCESS_MARKER).exists());
        let info: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(dir.join("info.yml")).unwrap()).unwrap();
        assert_eq!(info["success"].as_bool(), Some(false));
    }

    #[test]
    fn cdeepso_on_start_aborts() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config("echo hi", Vec::new());
        cfg.kind = ExperimentKind::Cdeepso;
        cfg.score_pattern = Some(r"score=(\d+)".to_string());
        let e = Experiment::new(0, cfg, root.path()).unwrap();
        let mut sink = VecSink::default();
        let err = e.on_start(&mut sink).unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }
}
