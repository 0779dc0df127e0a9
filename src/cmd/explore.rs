// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

//! Execute a program permutating its input parameters.

use std::io::IsTerminal;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Result;
use argh::FromArgs;
use patas::config::load_cluster;
use patas::config::load_experiment;
use patas::config::parse_address;
use patas::config::parse_number;
use patas::config::Cluster;
use patas::config::ExperimentConfig;
use patas::config::ExperimentKind;
use patas::config::Node;
use patas::config::NodeFilter;
use patas::config::Scalar;
use patas::config::TaskFilter;
use patas::config::VariableSpec;
use patas::experiment::Experiment;
use patas::scheduler::Scheduler;
use patas::util::expand_path;
use patas::util::Ui;

const DEFAULT_OUTPUT_FOLDER: &str = "./patasout";

#[derive(FromArgs, PartialEq, Debug)]
/// Execute a program permutating its input parameters over a pool of
/// workers.
#[argh(subcommand, name = "explore")]
pub struct Args {
    /// path to a cluster file (repeatable)
    #[argh(option)]
    cluster: Vec<String>,

    /// path to an experiment file (repeatable)
    #[argh(option)]
    experiment: Vec<String>,

    /// adds a node to the quick cluster, formatted as
    /// 'NAME [USER@]HOST[:PORT] [WORKERS] [TAG ...]' (repeatable)
    #[argh(option)]
    node: Vec<String>,

    /// defines a list variable, formatted as 'NAME V1 [V2 ...]'
    /// (repeatable)
    #[argh(option)]
    vl: Vec<String>,

    /// defines an arithmetic progression variable, formatted as
    /// 'NAME MIN MAX STEP' (repeatable)
    #[argh(option)]
    va: Vec<String>,

    /// defines a geometric progression variable, formatted as
    /// 'NAME MIN MAX FACTOR' (repeatable)
    #[argh(option)]
    vg: Vec<String>,

    /// number of times each combination must be executed
    #[argh(option)]
    repeat: Option<usize>,

    /// maximum number of tries for a failing task
    #[argh(option)]
    max_tries: Option<usize>,

    /// working directory for the tasks
    #[argh(option)]
    workdir: Option<String>,

    /// command to be executed; use {VAR_NAME} to substitute a variable
    /// (repeatable)
    #[argh(option)]
    cmd: Vec<String>,

    /// restricts the task ids that will run, formatted as
    /// '[EXPERIMENT:]A:B' with either bound optional (repeatable)
    #[argh(option)]
    filter_tasks: Vec<String>,

    /// runs only on nodes carrying every listed tag, formatted as
    /// 'TAG [TAG ...]'; occurrences are alternatives (repeatable)
    #[argh(option)]
    filter_nodes: Vec<String>,

    /// name of the quick experiment
    #[argh(option, default = "String::from(\"grid\")")]
    name: String,

    /// strategy of the quick experiment: grid or cdeepso
    #[argh(option, long = "type", default = "String::from(\"grid\")")]
    experiment_type: String,

    /// fitness-extraction regex of the cdeepso strategy
    #[argh(option)]
    score_pattern: Option<String>,

    /// forces tasks with a terminal marker to run again
    #[argh(switch)]
    redo: bool,

    /// skips the confirmation prompt
    #[argh(switch, short = 'y')]
    yes: bool,

    /// suppresses the per-event progress lines
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// folder to store the program outputs
    #[argh(option, short = 'o', default = "String::from(DEFAULT_OUTPUT_FOLDER)")]
    output_folder: String,
}

pub fn run(args: &Args) -> Result<()> {
    let ui = Ui::new(args.quiet, std::io::stdout().is_terminal());
    let output_folder = PathBuf::from(expand_path(&args.output_folder)?);

    let mut configs = create_experiments(args)?;
    if configs.is_empty() {
        bail!("Nothing to explore. Provide --cmd, a variable, or --experiment.");
    }
    let task_filters = create_task_filters(args)?;
    assign_task_filters(&mut configs, task_filters)?;

    let experiments = configs
        .into_iter()
        .enumerate()
        .map(|(id, config)| Experiment::new(id, config, &output_folder))
        .collect::<Result<Vec<Experiment>>>()?;

    let clusters = create_clusters(args)?;
    let node_filters: Vec<NodeFilter> = args
        .filter_nodes
        .iter()
        .map(|spec| spec.split_whitespace().map(str::to_string).collect())
        .collect();

    Scheduler::new(
        output_folder,
        node_filters,
        args.yes,
        experiments,
        clusters,
        ui,
    )
    .start()
}

/// Builds the quick experiment from the flags (when any is given) and
/// appends the file-loaded ones.
fn create_experiments(args: &Args) -> Result<Vec<ExperimentConfig>> {
    let mut configs = Vec::new();

    let vars = create_variables(args)?;
    if !args.cmd.is_empty() || !vars.is_empty() {
        let config = ExperimentConfig {
            name: args.name.clone(),
            kind: args.experiment_type.parse::<ExperimentKind>()?,
            workdir: args.workdir.clone(),
            cmd: args.cmd.clone(),
            repeat: args.repeat.unwrap_or(1),
            max_tries: args.max_tries.unwrap_or(3),
            redo_tasks: args.redo,
            vars,
            score_pattern: args.score_pattern.clone(),
            task_filters: Vec::new(),
        };
        config.validate()?;
        configs.push(config);
    }

    for filepath in &args.experiment {
        let mut config = load_experiment(Path::new(filepath))?;
        if args.redo {
            config.redo_tasks = true;
        }
        configs.push(config);
    }

    for (i, a) in configs.iter().enumerate() {
        for b in configs.iter().skip(i + 1) {
            if a.name == b.name {
                bail!("Two experiments share the name {}", a.name);
            }
        }
    }
    Ok(configs)
}

fn create_variables(args: &Args) -> Result<Vec<VariableSpec>> {
    let mut vars = Vec::new();
    for spec in &args.vl {
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        if tokens.len() < 2 {
            bail!("--vl expects 'NAME V1 [V2 ...]', got: {spec}");
        }
        vars.push(VariableSpec::List {
            name: tokens[0].to_string(),
            values: tokens[1..]
                .iter()
                .map(|t| Scalar::Str(t.to_string()))
                .collect(),
        });
    }
    for spec in &args.va {
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        let &[name, min, max, step] = tokens.as_slice() else {
            bail!("--va expects 'NAME MIN MAX STEP', got: {spec}");
        };
        vars.push(VariableSpec::Arithmetic {
            name: name.to_string(),
            min: parse_number(min)?,
            max: parse_number(max)?,
            step: parse_number(step)?,
        });
    }
    for spec in &args.vg {
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        let &[name, min, max, factor] = tokens.as_slice() else {
            bail!("--vg expects 'NAME MIN MAX FACTOR', got: {spec}");
        };
        vars.push(VariableSpec::Geometric {
            name: name.to_string(),
            min: parse_number(min)?,
            max: parse_number(max)?,
            factor: parse_number(factor)?,
        });
    }
    Ok(vars)
}

fn create_task_filters(args: &Args) -> Result<Vec<TaskFilter>> {
    let mut filters = Vec::new();
    for spec in &args.filter_tasks {
        for token in spec.split_whitespace() {
            filters.push(TaskFilter::parse(token)?);
        }
    }
    Ok(filters)
}

/// A bare `A:B` applies to every experiment; `NAME:A:B` only to the one
/// with that name.
fn assign_task_filters(
    configs: &mut [ExperimentConfig],
    filters: Vec<TaskFilter>,
) -> Result<()> {
    for filter in &filters {
        if let Some(name) = &filter.experiment {
            if !configs.iter().any(|c| &c.name == name) {
                bail!("--filter-tasks references an unknown experiment: {name}");
            }
        }
    }
    for config in configs.iter_mut() {
        config.task_filters = filters
            .iter()
            .filter(|f| match &f.experiment {
                Some(name) => name == &config.name,
                None => true,
            })
            .cloned()
            .collect();
    }
    Ok(())
}

fn create_clusters(args: &Args) -> Result<Vec<Cluster>> {
    let mut clusters = Vec::new();
    for filepath in &args.cluster {
        clusters.push(load_cluster(Path::new(filepath))?);
    }

    if !args.node.is_empty() {
        let mut nodes = Vec::new();
        for spec in &args.node {
            nodes.push(parse_node(spec)?);
        }
        clusters.push(Cluster {
            name: "cluster".to_string(),
            nodes,
        });
    }

    // With no cluster at all, run on the local machine with one worker
    // per logical CPU.
    if clusters.is_empty() {
        clusters.push(Cluster {
            name: "cluster".to_string(),
            nodes: vec![Node {
                name: "localhost".to_string(),
                hostname: "localhost".to_string(),
                user: None,
                port: 22,
                private_key: None,
                workers: num_cpus::get(),
                tags: Vec::new(),
            }],
        });
    }
    Ok(clusters)
}

fn parse_node(spec: &str) -> Result<Node> {
    let tokens: Vec<&str> = spec.split_whitespace().collect();
    if tokens.len() < 2 {
        bail!("--node expects 'NAME [USER@]HOST[:PORT] [WORKERS] [TAG ...]', got: {spec}");
    }
    let (user, hostname, port) = parse_address(tokens[1])?;
    let (workers, tags_from) = match tokens.get(2).map(|t| t.parse::<usize>()) {
        Some(Ok(workers)) => (workers, 3),
        _ => (1, 2),
    };
    if workers == 0 {
        bail!("--node {spec}: workers must be at least 1");
    }
    let tags = tokens
        .get(tags_from..)
        .unwrap_or(&[])
        .iter()
        .map(|t| t.to_string())
        .collect();
    Ok(Node {
        name: tokens[0].to_string(),
        hostname,
        user,
        port: port.unwrap_or(22),
        private_key: None,
        workers,
        tags,
    })
}
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(overrides: impl FnOnce(&mut Args)) -> Args {
        let mut args = Args {
            cluster: Vec::new(),
            experiment: Vec::new(),
            node: Vec::new(),
            vl: Vec::new(),
            va: Vec::new(),
            vg: Vec::new(),
            repeat: None,
            max_tries: None,
            workdir: None,
            cmd: Vec::new(),
            filter_tasks: Vec::new(),
            filter_nodes: Vec::new(),
            name: "grid".to_string(),
            experiment_type: "grid".to_string(),
            score_pattern: None,
            redo: false,
            yes: false,
            quiet: true,
            output_folder: DEFAULT_OUTPUT_FOLDER.to_string(),
        };
        overrides(&mut args);
        args
    }

    #[test]
    fn quick_experiment_from_flags() {
        let args = args(|a| {
            a.cmd = vec!["echo {n}".to_string()];
            a.vl = vec!["n 1 2 3".to_string()];
            a.repeat = Some(2);
            a.max_tries = Some(5);
        });
        let configs = create_experiments(&args).unwrap();
        assert_eq!(configs.len(), 1);
        let config = &configs[0];
        assert_eq!(config.name, "grid");
        assert_eq!(config.repeat, 2);
        assert_eq!(config.max_tries, 5);
        assert_eq!(config.vars.len(), 1);
        assert_eq!(config.vars[0].materialize().unwrap().values, vec!["1", "2", "3"]);
    }

    #[test]
    fn no_flags_mean_no_experiments() {
        let args = args(|_| {});
        assert!(create_experiments(&args).unwrap().is_empty());
    }

    #[test]
    fn progression_variables_parse() {
        let args = args(|a| {
            a.cmd = vec!["echo {a} {g}".to_string()];
            a.va = vec!["a 0 10 2".to_string()];
            a.vg = vec!["g 1 32 2".to_string()];
        });
        let configs = create_experiments(&args).unwrap();
        let vars = &configs[0].vars;
        assert_eq!(vars[0].materialize().unwrap().values, vec!["0", "2", "4", "6", "8"]);
        assert_eq!(
            vars[1].materialize().unwrap().values,
            vec!["1", "2", "4", "8", "16"]
        );
    }

    #[test]
    fn malformed_variable_flags_fail() {
        let args = args(|a| {
            a.cmd = vec!["echo".to_string()];
            a.va = vec!["a 0 10".to_string()];
        });
        assert!(create_experiments(&args).is_err());
    }

    #[test]
    fn named_task_filter_applies_to_one_experiment() {
        let alpha = create_experiments(&args(|a| {
            a.cmd = vec!["echo a".to_string()];
            a.name = "alpha".to_string();
        }))
        .unwrap();
        let beta = create_experiments(&args(|a| {
            a.cmd = vec!["echo b".to_string()];
            a.name = "beta".to_string();
        }))
        .unwrap();
        let mut configs: Vec<ExperimentConfig> =
            alpha.into_iter().chain(beta).collect();
        let filters = vec![
            TaskFilter::parse("0:5").unwrap(),
            TaskFilter::parse("beta:7:9").unwrap(),
        ];
        assign_task_filters(&mut configs, filters).unwrap();
        assert_eq!(configs[0].task_filters.len(), 1);
        assert_eq!(configs[1].task_filters.len(), 2);
    }

    #[test]
    fn unknown_filter_experiment_fails() {
        let mut configs = create_experiments(&args(|a| {
            a.cmd = vec!["echo a".to_string()];
        }))
        .unwrap();
        let filters = vec![TaskFilter::parse("nope:0:5").unwrap()];
        assert!(assign_task_filters(&mut configs, filters).is_err());
    }

    #[test]
    fn node_spec_parses() {
        let node = parse_node("big exp@big.example.com:2222 8 gpu fast").unwrap();
        assert_eq!(node.name, "big");
        assert_eq!(node.hostname, "big.example.com");
        assert_eq!(node.user.as_deref(), Some("exp"));
        assert_eq!(node.port, 2222);
        assert_eq!(node.workers, 8);
        assert_eq!(node.tags, vec!["gpu", "fast"]);

        let node = parse_node("small 10.0.0.7").unwrap();
        assert_eq!(node.port, 22);
        assert_eq!(node.workers, 1);
        assert!(node.tags.is_empty());

        // A non-numeric third token is a tag, not a worker count.
        let node = parse_node("tagged host gpu").unwrap();
        assert_eq!(node.workers, 1);
        assert_eq!(node.tags, vec!["gpu"]);

        assert!(parse_node("lonely").is_err());
    }

    #[test]
    fn default_cluster_uses_the_local_machine() {
        let clusters = create_clusters(&args(|_| {})).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].nodes.len(), 1);
        assert!(clusters[0].nodes[0].is_local());
        assert!(clusters[0].nodes[0].workers >= 1);
    }
}
