// Copyright 2024 The ChromiumOS Authors
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file or at
// https://developers.google.com/open-source/licenses/bsd

//! Immutable descriptions of clusters, nodes, experiments and their input
//! variables, as loaded from YAML files or assembled from command line
//! flags.

use std::collections::HashSet;
use std::fmt;
use std::fs::read_to_string;
use std::path::Path;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use url::Url;

pub const LOCAL_HOSTNAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// A scalar variable value. YAML experiment files may mix numbers and
/// strings in the same list; everything eventually becomes a string for
/// command-template substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}
impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Str(v) => write!(f, "{v}"),
        }
    }
}

/// A numeric bound for progression variables. Integer progressions stay
/// integers so `{n}` substitutes as `4`, not `4.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}
impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(v) => *v as f64,
            Number::Float(v) => *v,
        }
    }
    fn is_int(&self) -> bool {
        matches!(self, Number::Int(_))
    }
}
impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{v}"),
            Number::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Parses a CLI number the way the experiment files do: a token without a
/// dot is an integer.
pub fn parse_number(s: &str) -> Result<Number> {
    if s.contains('.') {
        Ok(Number::Float(s.parse().context(anyhow!("Invalid number: {s}"))?))
    } else {
        Ok(Number::Int(s.parse().context(anyhow!("Invalid number: {s}"))?))
    }
}

/// An input variable declaration. The `type` key in experiment files picks
/// the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableSpec {
    List {
        name: String,
        values: Vec<Scalar>,
    },
    Arithmetic {
        name: String,
        min: Number,
        max: Number,
        step: Number,
    },
    Geometric {
        name: String,
        min: Number,
        max: Number,
        factor: Number,
    },
}
impl VariableSpec {
    pub fn name(&self) -> &str {
        match self {
            VariableSpec::List { name, .. } => name,
            VariableSpec::Arithmetic { name, .. } => name,
            VariableSpec::Geometric { name, .. } => name,
        }
    }
    /// Expands the declaration into its ordered value list. Progressions
    /// stop strictly before `max`.
    pub fn materialize(&self) -> Result<Variable> {
        let values = match self {
            VariableSpec::List { values, .. } => {
                values.iter().map(|v| v.to_string()).collect()
            }
            VariableSpec::Arithmetic {
                name,
                min,
                max,
                step,
            } => {
                if step.as_f64() <= 0.0 {
                    bail!("Variable {name}: step must be positive");
                }
                if min.is_int() && max.is_int() && step.is_int() {
                    let (Number::Int(min), Number::Int(max), Number::Int(step)) =
                        (min, max, step)
                    else {
                        unreachable!()
                    };
                    let mut values = Vec::new();
                    let mut current = *min;
                    while current < *max {
                        values.push(current.to_string());
                        current += step;
                    }
                    values
                } else {
                    let (min, max, step) = (min.as_f64(), max.as_f64(), step.as_f64());
                    let mut values = Vec::new();
                    let mut i = 0;
                    loop {
                        let current = min + step * i as f64;
                        if current >= max {
                            break;
                        }
                        values.push(current.to_string());
                        i += 1;
                    }
                    values
                }
            }
            VariableSpec::Geometric {
                name,
                min,
                max,
                factor,
            } => {
                if factor.as_f64() <= 1.0 {
                    bail!("Variable {name}: factor must be greater than one");
                }
                if min.as_f64() <= 0.0 {
                    bail!("Variable {name}: min must be positive");
                }
                if min.is_int() && max.is_int() && factor.is_int() {
                    let (Number::Int(min), Number::Int(max), Number::Int(factor)) =
                        (min, max, factor)
                    else {
                        unreachable!()
                    };
                    let mut values = Vec::new();
                    let mut current = *min;
                    while current < *max {
                        values.push(current.to_string());
                        current *= factor;
                    }
                    values
                } else {
                    let (min, max, factor) = (min.as_f64(), max.as_f64(), factor.as_f64());
                    let mut values = Vec::new();
                    let mut current = min;
                    while current < max {
                        values.push(current.to_string());
                        current *= factor;
                    }
                    values
                }
            }
        };
        Ok(Variable {
            name: self.name().to_string(),
            values,
        })
    }
}

/// A materialized variable: its name and the ordered, stringified value
/// list the combinations are built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    pub name: String,
    pub values: Vec<String>,
}

fn default_node_name() -> String {
    "noname".to_string()
}
fn default_port() -> u16 {
    22
}
fn default_workers() -> usize {
    1
}

/// An addressable execution target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(default = "default_node_name")]
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}
impl Node {
    pub fn credential(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.hostname),
            None => self.hostname.clone(),
        }
    }
    /// Local hostnames get the in-process bash executor, everything else
    /// goes through ssh.
    pub fn is_local(&self) -> bool {
        LOCAL_HOSTNAMES.contains(&self.hostname.as_str())
    }
    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            bail!("Node {}: hostname must not be empty", self.name);
        }
        if self.workers == 0 {
            bail!("Node {}: workers must be at least 1", self.name);
        }
        Ok(())
    }
}

fn default_cluster_name() -> String {
    "default".to_string()
}

/// A named collection of nodes. No behavior beyond aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    pub nodes: Vec<Node>,
}
impl Cluster {
    pub fn number_of_nodes(&self) -> usize {
        self.nodes.len()
    }
    pub fn number_of_workers(&self) -> usize {
        self.nodes.iter().map(|n| n.workers).sum()
    }
}

pub fn load_cluster(filepath: &Path) -> Result<Cluster> {
    let text = read_to_string(filepath)
        .context(anyhow!("Failed to read cluster file {filepath:?}"))?;
    let cluster: Cluster = serde_yaml::from_str(&text)
        .context(anyhow!("Failed to parse cluster file {filepath:?}"))?;
    for node in &cluster.nodes {
        node.validate()?;
    }
    Ok(cluster)
}

/// Parses a node address of the form `[user@]host[:port]` by routing it
/// through the url crate as an ssh:// URL.
pub fn parse_address(address: &str) -> Result<(Option<String>, String, Option<u16>)> {
    let url = format!("ssh://{address}");
    let url = Url::parse(&url).context(anyhow!("Invalid node address: {address}"))?;
    let host = url
        .host_str()
        .context(anyhow!("Invalid node address: {address}"))?
        .to_string();
    let user = if url.username().is_empty() {
        None
    } else {
        Some(url.username().to_string())
    };
    Ok((user, host, url.port()))
}

/// An inclusive-exclusive task id range, optionally restricted to one
/// experiment by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFilter {
    pub experiment: Option<String>,
    pub from: u64,
    pub to: u64,
}
impl TaskFilter {
    pub fn contains(&self, task_id: u64) -> bool {
        self.from <= task_id && task_id < self.to
    }
    /// Accepted forms: `A:B`, `A:`, `:B`, `:`, `A` and any of those
    /// prefixed with an experiment name as `NAME:A:B`.
    pub fn parse(token: &str) -> Result<Self> {
        let invalid = || anyhow!("Invalid attribute for --filter-tasks: {token}");
        let cells: Vec<&str> = token.split(':').collect();
        let (experiment, cells) = match cells.len() {
            1 | 2 => (None, cells),
            3 => (Some(cells[0].to_string()), cells[1..].to_vec()),
            _ => return Err(invalid()),
        };
        if let Some(name) = &experiment {
            if name.is_empty() {
                return Err(invalid());
            }
        }
        let from = if cells[0].is_empty() {
            0
        } else {
            cells[0].parse().map_err(|_| invalid())?
        };
        let to = if cells.len() == 1 {
            from + 1
        } else if cells[1].is_empty() {
            u64::MAX
        } else {
            cells[1].parse().map_err(|_| invalid())?
        };
        Ok(TaskFilter {
            experiment,
            from,
            to,
        })
    }
}

/// One `--filter-nodes` occurrence: a node matches when it carries every
/// tag in the set. Multiple filters are OR-ed by the scheduler.
pub type NodeFilter = Vec<String>;

pub fn node_matches(filters: &[NodeFilter], tags: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters
        .iter()
        .any(|filter| filter.iter().all(|tag| tags.iter().any(|t| t == tag)))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentKind {
    Grid,
    Cdeepso,
}
impl Default for ExperimentKind {
    fn default() -> Self {
        ExperimentKind::Grid
    }
}
impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExperimentKind::Grid => write!(f, "grid"),
            ExperimentKind::Cdeepso => write!(f, "cdeepso"),
        }
    }
}
impl std::str::FromStr for ExperimentKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grid" => Ok(ExperimentKind::Grid),
            "cdeepso" => Ok(ExperimentKind::Cdeepso),
            _ => bail!("Unknown experiment type: {s} (expected grid or cdeepso)"),
        }
    }
}

fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn default_repeat() -> usize {
    1
}
fn default_max_tries() -> usize {
    3
}

/// An experiment declaration: the command templates, the variables whose
/// Cartesian product drives the fan-out, and the retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ExperimentKind,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(deserialize_with = "string_or_seq")]
    pub cmd: Vec<String>,
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    #[serde(default = "default_max_tries")]
    pub max_tries: usize,
    #[serde(default)]
    pub redo_tasks: bool,
    #[serde(default)]
    pub vars: Vec<VariableSpec>,
    /// Fitness-extraction regex of the cdeepso strategy.
    #[serde(default, rename = "score")]
    pub score_pattern: Option<String>,
    /// Task filters are command line state, never part of the file.
    #[serde(skip)]
    pub task_filters: Vec<TaskFilter>,
}
impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("Experiment name must not be empty");
        }
        if self.cmd.is_empty() {
            bail!("Experiment {}: cmd must not be empty", self.name);
        }
        if self.repeat == 0 {
            bail!("Experiment {}: repeat must be at least 1", self.name);
        }
        if self.max_tries == 0 {
            bail!("Experiment {}: max_tries must be at least 1", self.name);
        }
        let mut seen = HashSet::new();
        for var in &self.vars {
            if !seen.insert(var.name()) {
                bail!(
                    "Experiment {}: duplicated variable name: {}",
                    self.name,
                    var.name()
                );
            }
        }
        Ok(())
    }
}

pub fn load_experiment(filepath: &Path) -> Result<ExperimentConfig> {
    let text = read_to_string(filepath)
        .context(anyhow!("Failed to read experiment file {filepath:?}"))?;
    let config: ExperimentConfig = serde_yaml::from_str(&text)
        .context(anyhow!("Failed to parse experiment file {filepath:?}"))?;
    config.validate()?;
    Ok(config)
}
