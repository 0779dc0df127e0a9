// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

//! A worker owns one executor and processes one task at a time. It talks
//! to the scheduler exclusively through two channels: commands in, events
//! out. Tasks cross the channels by value, so a worker only ever mutates
//! its own copy.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Context;
use anyhow::Result;
use chrono::Local;
use tracing::debug;
use tracing::error;

use crate::config::Node;
use crate::executor::Executor;
use crate::task::Attempt;
use crate::task::Task;

pub enum WorkerCommand {
    Execute(Box<Task>),
    Terminate,
}

pub enum SchedulerEvent {
    Ready { worker: usize },
    Finished { worker: usize, task: Box<Task> },
    Ended { worker: usize },
}

/// Handle held by the scheduler: worker identity, its node, the fixed part
/// of the per-task environment, and the channel into the worker thread.
pub struct Worker {
    id_in_lab: usize,
    node: Node,
    env_variables: BTreeMap<String, String>,
    commands: Option<Sender<WorkerCommand>>,
    handle: Option<JoinHandle<()>>,
}
impl Worker {
    pub fn new(id_in_lab: usize, node: Node, env_variables: BTreeMap<String, String>) -> Self {
        Worker {
            id_in_lab,
            node,
            env_variables,
            commands: None,
            handle: None,
        }
    }
    pub fn id(&self) -> usize {
        self.id_in_lab
    }
    pub fn node_name(&self) -> &str {
        &self.node.name
    }
    pub fn start(&mut self, events: Sender<SchedulerEvent>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let id = self.id_in_lab;
        let node = self.node.clone();
        let env = self.env_variables.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_loop(id, node, env, rx, events))
            .context("Failed to spawn worker thread")?;
        self.commands = Some(tx);
        self.handle = Some(handle);
        Ok(())
    }
    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        self.commands
            .as_ref()
            .context("Worker was not started")?
            .send(command)
            .map_err(|_| anyhow::anyhow!("Worker {} is gone", self.id_in_lab))
    }
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    id: usize,
    node: Node,
    env: BTreeMap<String, String>,
    commands: Receiver<WorkerCommand>,
    events: Sender<SchedulerEvent>,
) {
    let mut executor = match Executor::start(&node) {
        Ok(executor) => executor,
        Err(e) => {
            error!("Worker {id} could not bring up its executor: {e:?}");
            let _ = events.send(SchedulerEvent::Ended { worker: id });
            return;
        }
    };
    if events.send(SchedulerEvent::Ready { worker: id }).is_err() {
        return;
    }
    loop {
        // A closed channel means the scheduler unwound; leave silently.
        let Ok(command) = commands.recv() else {
            return;
        };
        match command {
            WorkerCommand::Execute(mut task) => {
                debug!("Worker {id} executes task {} of {}", task.task_id, task.experiment_name);
                execute_task(&mut executor, &env, &mut task);
                if events
                    .send(SchedulerEvent::Finished { worker: id, task })
                    .is_err()
                {
                    return;
                }
                if !executor.is_alive() {
                    executor = match Executor::start(&node) {
                        Ok(executor) => executor,
                        Err(e) => {
                            error!("Worker {id} could not rebuild its executor: {e:?}");
                            let _ = events.send(SchedulerEvent::Ended { worker: id });
                            return;
                        }
                    };
                }
                if events.send(SchedulerEvent::Ready { worker: id }).is_err() {
                    return;
                }
            }
            WorkerCommand::Terminate => break,
        }
    }
    let _ = events.send(SchedulerEvent::Ended { worker: id });
}

/// Runs the task once and appends the attempt record. The environment
/// snapshot recorded on the attempt is exactly the set exported into the
/// shell.
fn execute_task(executor: &mut Executor, base_env: &BTreeMap<String, String>, task: &mut Task) {
    let mut env = base_env.clone();
    env.insert("PATAS_WORK_DIR".to_string(), task.work_dir.clone());
    env.insert("PATAS_ATTEMPT".to_string(), (task.tries + 1).to_string());
    for (name, value) in &task.combination {
        env.insert(format!("PATAS_VAR_{name}"), value.clone());
    }

    let mut initrc = vec!["set -e".to_string()];
    if !task.work_dir.is_empty() {
        initrc.push(format!("cd \"{}\"", task.work_dir));
    }
    for (key, value) in &env {
        initrc.push(format!("export {key}=\"{value}\""));
    }

    let started_at = Local::now();
    let outcome = executor.execute(&initrc, &task.commands);
    let ended_at = Local::now();
    let duration = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;

    task.success = outcome.ok;
    task.attempts.push(Attempt {
        env_variables: env,
        started_at,
        ended_at,
        duration,
        status: outcome.status,
        stdout: outcome.stdout.unwrap_or_default(),
    });
}
