//! Agent roster file loading and validation.
//!
//! A roster is a YAML document listing the agents that compete on a task:
//!
//! ```yaml
//! agents:
//!   - name: sonnet
//!     command: /usr/local/bin/agent
//!     args: ["--prompt", "{task}"]
//!     env:
//!       AGENT_MODEL: sonnet
//!     fatal_patterns:
//!       - label: provider-quota
//!         pattern: "quota exhausted"
//! ```

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use anyhow::bail;
use serde::Deserialize;

/// One agent entry as written in the roster file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    /// Display name; must be unique within the roster.
    pub name: String,
    /// Program to launch. Bare names are resolved through `PATH` at spawn
    /// time; paths containing a separator are checked during preparation.
    pub command: String,
    /// Arguments, with `{task}` substituted. When no argument carries the
    /// placeholder the task is appended as the final argument instead.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Output markers that make this agent unrecoverable when repeated.
    #[serde(default)]
    pub fatal_patterns: Vec<FatalPatternSpec>,
    /// Disabled entries stay in the file but sit the competition out.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A fatal-output marker: a label for reporting plus the regex to watch for.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FatalPatternSpec {
    pub label: String,
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RosterFile {
    agents: Vec<AgentSpec>,
}

/// Reads and validates the roster at `path`, returning the enabled agents.
pub fn load_roster(path: &Path) -> anyhow::Result<Vec<AgentSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read roster at {}", path.display()))?;
    let roster: RosterFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse roster at {}", path.display()))?;
    validate(&roster.agents)?;
    let agents: Vec<AgentSpec> = roster
        .agents
        .into_iter()
        .filter(|agent| agent.enabled)
        .collect();
    if agents.is_empty() {
        bail!("roster has no enabled agents");
    }
    Ok(agents)
}

fn validate(agents: &[AgentSpec]) -> anyhow::Result<()> {
    if agents.is_empty() {
        bail!("roster lists no agents");
    }
    let mut seen = HashSet::new();
    for agent in agents {
        if agent.name.trim().is_empty() {
            bail!("roster contains an agent with an empty name");
        }
        if !seen.insert(agent.name.as_str()) {
            bail!("duplicate agent name `{}` in roster", agent.name);
        }
        if agent.command.trim().is_empty() {
            bail!("agent `{}` has no command", agent.name);
        }
    }
    Ok(())
}

/// Substitutes the `{task}` placeholder; appends the task when absent so
/// every agent receives it one way or the other.
pub fn render_args(args: &[String], task: &str) -> Vec<String> {
    if args.iter().any(|arg| arg.contains("{task}")) {
        args.iter().map(|arg| arg.replace("{task}", task)).collect()
    } else {
        let mut rendered = args.to_vec();
        rendered.push(task.to_string());
        rendered
    }
}
