//! chatclaw configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main chatclaw configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatClawConfig {
    /// Agent process configuration
    pub agent: AgentConfig,

    /// Bot / dispatcher configuration
    pub bot: BotConfig,

    /// Durable store configuration
    pub store: StoreConfig,
}

/// Agent process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable to spawn
    pub program: String,

    /// Tool allow-list passed via `--allowedTools`
    pub tools: Vec<String>,

    /// Enable per-process debug directories with stream taps
    pub debug: bool,

    /// Root for per-process debug directories
    pub debug_dir: PathBuf,

    /// Ceiling for the agent's init envelope after spawn, in seconds
    pub init_timeout_secs: u64,

    /// Ceiling for enqueueing a message to the agent, in seconds
    pub send_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            tools: vec![
                "Read".to_string(),
                "Write".to_string(),
                "Bash".to_string(),
            ],
            debug: false,
            debug_dir: PathBuf::from("/tmp/chatclaw-agent"),
            init_timeout_secs: 10,
            send_timeout_secs: 5,
        }
    }
}

/// Bot / dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Slash command the bot answers to
    pub command: String,

    /// Root for per-session working directories
    pub data_dir: PathBuf,

    /// Cap on live thread bindings (soft)
    pub max_sessions: usize,

    /// Idle duration after which a binding is reaped, in seconds
    pub idle_timeout_secs: u64,

    /// Reaper wake interval, in seconds
    pub reap_interval_secs: u64,

    /// Per-interaction streaming ceiling, in seconds
    pub stream_timeout_secs: u64,

    /// Channel whitelist regex patterns (empty = allow all)
    pub channel_whitelist: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            command: "/claw".to_string(),
            data_dir: PathBuf::from("./data"),
            max_sessions: 10,
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 5 * 60,
            stream_timeout_secs: 5 * 60,
            channel_whitelist: Vec::new(),
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for the JSON-file store
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/sessions"),
        }
    }
}

/// Apply environment variable overrides to the configuration.
///
/// Recognized variables: `AGENT_PROGRAM`, `AGENT_DEBUG`, `AGENT_DEBUG_DIR`,
/// `AGENT_TOOLS` (comma-separated), `SESSION_MAX_CONCURRENT`,
/// `SESSION_IDLE_TIMEOUT` (seconds).
pub fn apply_env_overrides(config: &mut ChatClawConfig) {
    if let Ok(program) = std::env::var("AGENT_PROGRAM") {
        if !program.is_empty() {
            config.agent.program = program;
        }
    }
    if let Ok(debug) = std::env::var("AGENT_DEBUG") {
        config.agent.debug = debug == "true" || debug == "1";
    }
    if let Ok(debug_dir) = std::env::var("AGENT_DEBUG_DIR") {
        if !debug_dir.is_empty() {
            config.agent.debug_dir = PathBuf::from(debug_dir);
        }
    }
    if let Ok(tools) = std::env::var("AGENT_TOOLS") {
        let parsed = parse_comma_separated(&tools);
        if !parsed.is_empty() {
            config.agent.tools = parsed;
        }
    }
    if let Ok(max) = std::env::var("SESSION_MAX_CONCURRENT") {
        if let Ok(max) = max.parse::<usize>() {
            config.bot.max_sessions = max;
        }
    }
    if let Ok(idle) = std::env::var("SESSION_IDLE_TIMEOUT") {
        if let Ok(secs) = idle.parse::<u64>() {
            config.bot.idle_timeout_secs = secs;
        }
    }
}

/// Split a comma-separated string, trimming whitespace and dropping empties.
pub fn parse_comma_separated(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
