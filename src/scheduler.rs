// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

//! Drives a run: prints the pre-run summary, guards the output folder
//! against configuration drift, builds the worker fleet, dispatches tasks
//! until todo and doing drain, retries failures, and releases the workers.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use chrono::Local;
use tracing::debug;

use crate::config::node_matches;
use crate::config::Cluster;
use crate::config::NodeFilter;
use crate::experiment::Experiment;
use crate::experiment::TaskSink;
use crate::task::Task;
use crate::util::estimate;
use crate::util::human_time;
use crate::util::Ui;
use crate::worker::SchedulerEvent;
use crate::worker::Worker;
use crate::worker::WorkerCommand;

const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue containers of one run. Only the scheduler loop touches them.
/// `todo` is a LIFO: the most recently pushed task is dispatched next.
#[derive(Default)]
struct RunState {
    todo: Vec<Task>,
    doing: Vec<Task>,
    done: Vec<Task>,
    given_up: Vec<Task>,
    filtered: Vec<Task>,
    idle: Vec<usize>,
    ended: Vec<usize>,
}
impl TaskSink for RunState {
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

pub struct Scheduler {
    output_folder: PathBuf,
    node_filters: Vec<NodeFilter>,
    confirmed: bool,
    experiments: Vec<Experiment>,
    clusters: Vec<Cluster>,
    ui: Ui,
}
impl Scheduler {
    pub fn new(
        output_folder: PathBuf,
        node_filters: Vec<NodeFilter>,
        confirmed: bool,
        experiments: Vec<Experiment>,
        clusters: Vec<Cluster>,
        ui: Ui,
    ) -> Self {
        Scheduler {
            output_folder,
            node_filters,
            confirmed,
            experiments,
            clusters,
            ui,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.output_folder).context("Failed to create the output folder")?;

        let interrupted = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, interrupted.clone())
            .context("Failed to register the SIGINT handler")?;

        self.show_summary()?;

        let mut workers = self.create_workers()?;
        if workers.is_empty() {
            bail!("No workers to work.");
        }

        let (events_tx, events_rx) = mpsc::channel();
        println!();
        self.ui
            .info(&format!("Starting {} worker(s)", workers.len()));
        for worker in &mut workers {
            worker.start(events_tx.clone())?;
        }
        // Workers hold the only senders now, so a disconnected queue means
        // the whole fleet is gone.
        drop(events_tx);
        self.ui.info("Worker(s) started");

        let mut state = RunState::default();
        println!();
        self.ui
            .info(&format!("Starting {} experiment(s)", self.experiments.len()));
        let mut start_error = None;
        for experiment in &self.experiments {
            if let Err(e) = experiment.on_start(&mut state) {
                start_error = Some(e);
                break;
            }
        }
        if let Some(e) = start_error {
            self.release_workers(&mut workers, &events_rx, &mut state, &interrupted);
            return Err(e);
        }
        self.ui.info("Experiment(s) started");

        let main_loop_started_at = Local::now();
        println!();
        self.ui.info("Starting main loop...");
        if !self.main_loop(&mut state, &workers, &events_rx, &interrupted)? {
            println!("Operation interrupted");
            return Ok(());
        }
        self.ui.info("Main loop completed");
        let main_loop_duration =
            (Local::now() - main_loop_started_at).num_milliseconds() as f64 / 1000.0;

        for experiment in &self.experiments {
            experiment.on_finish()?;
        }

        let terminate_started_at = Local::now();
        println!();
        if !self.release_workers(&mut workers, &events_rx, &mut state, &interrupted) {
            println!("Operation interrupted");
            return Ok(());
        }
        let terminate_duration =
            (Local::now() - terminate_started_at).num_milliseconds() as f64 / 1000.0;

        self.ui.section("Execution Summary");
        println!(
            "    Time to execute experiments: {}",
            human_time(main_loop_duration)
        );
        println!(
            "    Time to terminate workers:   {}",
            human_time(terminate_duration)
        );
        println!(
            "    Tasks requested: {}",
            state.done.len() + state.given_up.len()
        );
        println!("    Tasks completed: {}", state.done.len());
        println!("    Tasks given up:  {}", state.given_up.len());
        println!();
        Ok(())
    }

    /// Prints the experiment/cluster/overview sections, handles signature
    /// divergence (prompting unless pre-confirmed) and writes the fresh
    /// experiment descriptors.
    fn show_summary(&self) -> Result<()> {
        self.ui.section("Experiments");
        let mut total_tasks = 0;
        for experiment in &self.experiments {
            experiment.show_summary();
            total_tasks += experiment.number_of_tasks();
        }

        self.ui.section("Clusters");
        let mut total_nodes = 0;
        let mut total_workers = 0;
        for cluster in &self.clusters {
            println!(
                "    '{}' has {} node(s):",
                cluster.name,
                cluster.number_of_nodes()
            );
            for node in &cluster.nodes {
                println!("        '{}' has {} worker(s)", node.name, node.workers);
            }
            total_nodes += cluster.number_of_nodes();
            total_workers += cluster.number_of_workers();
        }

        self.ui.section("Overview");
        println!("Node filters:  {:?}", self.node_filters);
        println!("Output folder: {}", self.output_folder.display());
        println!();
        println!("Number of experiments: {}", self.experiments.len());
        println!("Number of clusters:    {}", self.clusters.len());
        println!("Number of nodes:       {total_nodes}");
        println!("Number of workers:     {total_workers}");
        println!("Number of tasks:       {total_tasks}");
        println!();
        println!("Estimated time to complete if each task takes:");
        println!(
            "    One second: {}",
            estimate(total_tasks, total_workers, 1.0)
        );
        println!(
            "    One minute: {}",
            estimate(total_tasks, total_workers, 60.0)
        );
        println!(
            "    One hour:   {}",
            estimate(total_tasks, total_workers, 3600.0)
        );
        println!(
            "    One day:    {}",
            estimate(total_tasks, total_workers, 86400.0)
        );
        println!();

        let issues: Vec<&Experiment> = self
            .experiments
            .iter()
            .filter(|e| !e.check_signature())
            .collect();
        if !issues.is_empty() {
            let names: Vec<&str> = issues.iter().map(|e| e.name()).collect();
            self.ui.warn(&format!(
                "The following experiments have changed their configuration, \
                 proceeding will restart all their tasks: {}",
                names.join(", ")
            ));
            if !self.confirmed && !self.ui.confirm("Do you want to continue?")? {
                bail!("Aborted by the user.");
            }
            self.ui.warn("Cleaning diverging experiments...");
            for experiment in &issues {
                experiment.clean_output()?;
            }
        }

        for experiment in &self.experiments {
            experiment.write_info()?;
        }
        Ok(())
    }

    /// Walks clusters × nodes × node.workers, applying the node filters.
    /// Worker ids are indexes into the returned vector; the environment
    /// carries cluster/node/worker coordinates for the task's shell.
    fn create_workers(&self) -> Result<Vec<Worker>> {
        println!("Creating workers...");
        let mut workers: Vec<Worker> = Vec::new();
        let mut node_in_lab = 0;
        for (cluster_in_lab, cluster) in self.clusters.iter().enumerate() {
            let mut worker_in_cluster = 0;
            for (node_in_cluster, node) in cluster.nodes.iter().enumerate() {
                let this_node_in_lab = node_in_lab;
                node_in_lab += 1;
                if !node_matches(&self.node_filters, &node.tags) {
                    debug!("Node {} skipped by the node filters", node.name);
                    continue;
                }
                for worker_in_node in 0..node.workers {
                    let worker_in_lab = workers.len();
                    let mut env = BTreeMap::new();
                    env.insert("PATAS_CLUSTER_NAME".to_string(), cluster.name.clone());
                    env.insert("PATAS_NODE_NAME".to_string(), node.name.clone());
                    env.insert(
                        "PATAS_CLUSTER_IN_LAB".to_string(),
                        cluster_in_lab.to_string(),
                    );
                    env.insert("PATAS_NODE_IN_LAB".to_string(), this_node_in_lab.to_string());
                    env.insert(
                        "PATAS_NODE_IN_CLUSTER".to_string(),
                        node_in_cluster.to_string(),
                    );
                    env.insert("PATAS_WORKER_IN_LAB".to_string(), worker_in_lab.to_string());
                    env.insert(
                        "PATAS_WORKER_IN_CLUSTER".to_string(),
                        worker_in_cluster.to_string(),
                    );
                    env.insert("PATAS_WORKER_IN_NODE".to_string(), worker_in_node.to_string());
                    worker_in_cluster += 1;
                    workers.push(Worker::new(worker_in_lab, node.clone(), env));
                }
            }
        }
        Ok(workers)
    }

    /// Returns Ok(false) when the user interrupted the run.
    fn main_loop(
        &self,
        state: &mut RunState,
        workers: &[Worker],
        events: &Receiver<SchedulerEvent>,
        interrupted: &AtomicBool,
    ) -> Result<bool> {
        while !(state.todo.is_empty() && state.doing.is_empty()) {
            if interrupted.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let event = match events.recv_timeout(QUEUE_POLL_INTERVAL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => bail!(
                    "All workers have ended but {} task(s) were left behind",
                    state.todo.len() + state.doing.len()
                ),
            };
            if !self.ui.quiet() {
                self.print_progress(state);
            }
            match event {
                SchedulerEvent::Ready { worker } => self.on_worker_ready(state, workers, worker),
                SchedulerEvent::Finished { worker, task } => {
                    self.on_task_finished(state, workers, worker, task)?
                }
                SchedulerEvent::Ended { worker } => state.ended.push(worker),
            }
        }
        Ok(true)
    }

    fn print_progress(&self, state: &RunState) {
        let now = self.ui.gray(&format!("|{}|", Local::now().format("%Y-%m-%d %H:%M:%S")));
        let todo = self
            .ui
            .white(&format!("|TODO:{:>8}|", state.todo.len()));
        let doing = self
            .ui
            .green(&format!("|DOING:{:>8}|", state.doing.len()));
        let done = self.ui.blue(&format!("|DONE:{:>8}|", state.done.len()));
        let given_up = self
            .ui
            .red(&format!("|GIVEN_UP:{:>8}|", state.given_up.len()));
        let filtered = self
            .ui
            .purple(&format!("|FILTERED:{:>8}|", state.filtered.len()));
        println!("{now} {todo} {doing} {done} {given_up} {filtered}");
    }

    fn dispatch(&self, state: &mut RunState, workers: &[Worker], worker_id: usize, mut task: Task) {
        task.assigned_to = Some(worker_id);
        match workers[worker_id].send(WorkerCommand::Execute(Box::new(task.clone()))) {
            Ok(()) => state.doing.push(task),
            Err(e) => {
                self.ui.critical(&format!(
                    "Failed to dispatch task {} to worker {worker_id}: {e}",
                    task.task_id
                ));
                state.todo.push(task);
            }
        }
    }

    fn on_worker_ready(&self, state: &mut RunState, workers: &[Worker], worker_id: usize) {
        match state.todo.pop() {
            Some(task) => self.dispatch(state, workers, worker_id, task),
            None => state.idle.push(worker_id),
        }
    }

    fn on_task_finished(
        &self,
        state: &mut RunState,
        workers: &[Worker],
        worker_id: usize,
        task: Box<Task>,
    ) -> Result<()> {
        let mut task = *task;
        let Some(position) = state
            .doing
            .iter()
            .position(|t| t.assigned_to == Some(worker_id))
        else {
            self.ui.critical(&format!(
                "Received finished event for task {}, which was not found inside the doing list",
                task.task_id
            ));
            return Ok(());
        };
        let sent = &state.doing[position];
        if sent.task_id != task.task_id || sent.experiment_id != task.experiment_id {
            self.ui.critical(
                "Received finished event for a task that was not the task we found in the doing \
                 list",
            );
            return Ok(());
        }
        state.doing.remove(position);
        task.tries += 1;

        if !task.success {
            if let Some(attempt) = task.last_attempt() {
                let status = attempt.status.clone().unwrap_or_else(|| "none".to_string());
                self.ui.warn(&format!(
                    "--- TASK {} FAILED WITH EXIT CODE {status} {}/{} ---",
                    task.task_id, task.tries, task.max_tries
                ));
                let _ = std::io::stdout().write_all(&attempt.stdout);
                self.ui.warn("--- END OF FAILED OUTPUT ---");
            }
        }

        let experiment = &self.experiments[task.experiment_id];
        if task.success {
            experiment.on_task_completed(&task)?;
            state.done.push(task);
        } else if task.tries >= task.max_tries {
            experiment.on_task_completed(&task)?;
            self.ui.critical(&format!(
                "Giving up on task {}, max_tries reached.",
                task.task_id
            ));
            state.given_up.push(task);
        } else if let Some(idle) = state.idle.pop() {
            // Prefer an idle worker for the retry over waiting for the
            // original one to come back.
            self.dispatch(state, workers, idle, task);
        } else {
            state.todo.push(task);
        }
        Ok(())
    }

    /// Sends terminate to the fleet and drains ended events. Returns false
    /// when interrupted while draining.
    fn release_workers(
        &self,
        workers: &mut [Worker],
        events: &Receiver<SchedulerEvent>,
        state: &mut RunState,
        interrupted: &AtomicBool,
    ) -> bool {
        self.ui.info("Releasing workers...");
        for worker in workers.iter() {
            let _ = worker.send(WorkerCommand::Terminate);
        }
        while state.ended.len() < workers.len() {
            if interrupted.load(Ordering::Relaxed) {
                return false;
            }
            match events.recv_timeout(QUEUE_POLL_INTERVAL) {
                Ok(SchedulerEvent::Ended { worker }) => state.ended.push(worker),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for worker in workers.iter_mut() {
            worker.join();
        }
        self.ui.info("All workers are resting.");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::config::ExperimentKind;
    use crate::config::Node;
    use crate::config::Scalar;
    use crate::config::TaskFilter;
    use crate::config::VariableSpec;
    use std::path::Path;

    fn quiet_ui() -> Ui {
        Ui::new(true, false)
    }

    fn local_cluster(workers: usize) -> Cluster {
        Cluster {
            name: "cluster".to_string(),
            nodes: vec![Node {
                name: "localhost".to_string(),
                hostname: "localhost".to_string(),
                user: None,
                port: 22,
                private_key: None,
                workers,
                tags: Vec::new(),
            }],
        }
    }

    fn experiment_config(name: &str, cmd: &str, values: &[&str], workdir: &Path) -> ExperimentConfig {
        ExperimentConfig {
            name: name.to_string(),
            kind: ExperimentKind::Grid,
            workdir: Some(workdir.to_string_lossy().into_owned()),
            cmd: vec![cmd.to_string()],
            repeat: 1,
            max_tries: 1,
            redo_tasks: false,
            vars: if values.is_empty() {
                Vec::new()
            } else {
                vec![VariableSpec::List {
                    name: "n".to_string(),
                    values: values.iter().map(|v| Scalar::Str(v.to_string())).collect(),
                }]
            },
            score_pattern: None,
            task_filters: Vec::new(),
        }
    }

    fn run(config: ExperimentConfig, output: &Path, workers: usize) -> Result<()> {
        let experiments = vec![Experiment::new(0, config, output)?];
        let mut scheduler = Scheduler::new(
            output.to_path_buf(),
            Vec::new(),
            true,
            experiments,
            vec![local_cluster(workers)],
            quiet_ui(),
        );
        scheduler.start()
    }

    #[test]
    fn grid_run_writes_success_tree() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let config = experiment_config("grid", "echo {n}", &["a", "b", "c"], work.path());
        run(config, output.path(), 1).unwrap();

        for (task_id, value) in ["a", "b", "c"].iter().enumerate() {
            let dir = output.path().join("grid").join(task_id.to_string());
            assert_eq!(
                fs::read(dir.join("success.stdout")).unwrap(),
                format!("{value}\n").as_bytes()
            );
            assert!(dir.join(".success").exists());
            assert!(!dir.join(".failure").exists());
            assert!(!dir.join("fail0.stdout").exists());
            let info: serde_yaml::Value =
                serde_yaml::from_str(&fs::read_to_string(dir.join("info.yml")).unwrap()).unwrap();
            assert_eq!(info["success"].as_bool(), Some(true));
            assert_eq!(info["tries"].as_u64(), Some(1));
        }
        let info: serde_yaml::Value = serde_yaml::from_str(
            &fs::read_to_string(output.path().join("grid").join("info.yml")).unwrap(),
        )
        .unwrap();
        assert!(info["signature"].as_str().is_some());
    }

    #[test]
    fn second_run_short_circuits_finished_tasks() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cmd = "echo ran >> counter_{n} ; echo {n}";
        let config = experiment_config("grid", cmd, &["x"], work.path());
        run(config.clone(), output.path(), 1).unwrap();
        run(config, output.path(), 1).unwrap();

        let counter = fs::read_to_string(work.path().join("counter_x")).unwrap();
        assert_eq!(counter, "ran\n");
        let dir = output.path().join("grid").join("0");
        assert_eq!(fs::read(dir.join("success.stdout")).unwrap(), b"x\n");
    }

    #[test]
    fn failing_tasks_are_retried_until_given_up() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let mut config = experiment_config("grid", "false", &["a", "b"], work.path());
        config.cmd = vec!["false".to_string()];
        config.max_tries = 3;
        run(config, output.path(), 1).unwrap();

        for task_id in 0..2 {
            let dir = output.path().join("grid").join(task_id.to_string());
            assert!(dir.join("fail0.stdout").exists());
            assert!(dir.join("fail1.stdout").exists());
            assert!(dir.join("fail2.stdout").exists());
            assert!(dir.join(".failure").exists());
            assert!(!dir.join(".success").exists());
            let info: serde_yaml::Value =
                serde_yaml::from_str(&fs::read_to_string(dir.join("info.yml")).unwrap()).unwrap();
            assert_eq!(info["success"].as_bool(), Some(false));
            assert_eq!(info["tries"].as_u64(), Some(3));
        }
    }

    #[test]
    fn retry_succeeds_on_second_attempt() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cmd = "test -f flag_{n} && echo ok || (touch flag_{n} ; exit 1)";
        let mut config = experiment_config("grid", cmd, &["x"], work.path());
        config.max_tries = 2;
        run(config, output.path(), 1).unwrap();

        let dir = output.path().join("grid").join("0");
        assert!(dir.join("fail0.stdout").exists());
        assert_eq!(fs::read(dir.join("success.stdout")).unwrap(), b"ok\n");
        assert!(dir.join(".success").exists());
        let info: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(dir.join("info.yml")).unwrap()).unwrap();
        assert_eq!(info["tries"].as_u64(), Some(2));
    }

    #[test]
    fn filter_everything_exits_cleanly() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let mut config = experiment_config("grid", "echo {n}", &["a", "b"], work.path());
        config.task_filters = vec![TaskFilter {
            experiment: None,
            from: 0,
            to: 0,
        }];
        run(config, output.path(), 1).unwrap();

        for task_id in 0..2 {
            assert!(!output.path().join("grid").join(task_id.to_string()).exists());
        }
    }

    #[test]
    fn diverging_signature_wipes_the_subtree_when_confirmed() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let config = experiment_config("grid", "echo {n}", &["a"], work.path());
        run(config, output.path(), 1).unwrap();
        let junk = output.path().join("grid").join("junk.txt");
        fs::write(&junk, b"left over").unwrap();

        let changed = experiment_config("grid", "echo changed {n}", &["a"], work.path());
        run(changed, output.path(), 1).unwrap();

        assert!(!junk.exists());
        let dir = output.path().join("grid").join("0");
        assert_eq!(fs::read(dir.join("success.stdout")).unwrap(), b"changed a\n");
    }

    #[test]
    fn node_filters_select_workers() {
        let cluster = Cluster {
            name: "lab".to_string(),
            nodes: vec![
                Node {
                    name: "nA".to_string(),
                    hostname: "localhost".to_string(),
                    user: None,
                    port: 22,
                    private_key: None,
                    workers: 2,
                    tags: vec!["gpu".to_string(), "fast".to_string()],
                },
                Node {
                    name: "nB".to_string(),
                    hostname: "localhost".to_string(),
                    user: None,
                    port: 22,
                    private_key: None,
                    workers: 3,
                    tags: vec!["gpu".to_string()],
                },
            ],
        };
        let scheduler = Scheduler::new(
            PathBuf::from("/tmp/unused"),
            vec![vec!["gpu".to_string(), "fast".to_string()]],
            true,
            Vec::new(),
            vec![cluster],
            quiet_ui(),
        );
        let workers = scheduler.create_workers().unwrap();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.node_name() == "nA"));
    }

    #[test]
    fn no_matching_workers_is_a_startup_error() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let config = experiment_config("grid", "echo {n}", &["a"], work.path());
        let experiments = vec![Experiment::new(0, config, output.path()).unwrap()];
        let mut scheduler = Scheduler::new(
            output.path().to_path_buf(),
            vec![vec!["missing-tag".to_string()]],
            true,
            experiments,
            vec![local_cluster(1)],
            quiet_ui(),
        );
        let err = scheduler.start().unwrap_err();
        assert!(err.to_string().contains("No workers"));
    }

    #[test]
    fn cdeepso_run_fails_with_a_clear_message() {
        let output = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let mut config = experiment_config("search", "echo {n}", &[], work.path());
        config.kind = ExperimentKind::Cdeepso;
        let err = run(config, output.path(), 1).unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }
}
