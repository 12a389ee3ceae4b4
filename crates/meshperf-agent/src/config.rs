use clap::Parser;

/// Agent configuration.
///
/// Flags override environment variables, which override `.env` (loaded by
/// main before parsing).
#[derive(Parser, Clone)]
#[command(name = "meshperf-agent")]
#[command(about = "meshperf worker agent - executes iperf3 tests coordinated by the Manager")]
pub struct AgentConfig {
    /// Manager API base URL.
    #[arg(long, env = "MANAGER_URL", default_value = "http://localhost:8000")]
    pub manager_url: String,

    /// This agent's name; must match an admin-created agent row.
    #[arg(long, env = "AGENT_NAME", default_value = "agent1")]
    pub agent_name: String,

    /// Registration key for the agent row.
    #[arg(long, env = "AGENT_KEY", default_value = "change-me")]
    pub agent_key: String,

    /// API version sent with every request.
    #[arg(long, env = "API_VERSION", default_value_t = 1)]
    pub api_version: i32,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("manager_url", &self.manager_url)
            .field("agent_name", &self.agent_name)
            .field("agent_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl AgentConfig {
    /// Parse config from environment only (no CLI parsing).
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["meshperf-agent"]))
    }
}
