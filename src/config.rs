//! Runtime configuration
//!
//! All operational knobs are read once at startup and handed to the actors by
//! value. Every knob has a default and an `MSFAILAB_*` environment override.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Operational configuration for the orchestration core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Container liveness probe period.
    pub health_check_interval: Duration,
    /// Container consecutive failure cap before the controller gives up.
    pub max_restart_count: u32,
    /// Container restart exponential backoff base.
    pub base_backoff: Duration,
    /// Container restart exponential backoff clip.
    pub max_backoff: Duration,
    /// Continuous `running` time required to reset the restart counter.
    pub success_reset: Duration,
    /// Delay before the first RPC login attempt after container start.
    pub msgrpc_initial_delay: Duration,
    /// RPC login attempt cap before the container is treated as crashed.
    pub msgrpc_max_connect_attempts: u32,
    /// Linear backoff base between RPC login attempts.
    pub msgrpc_connect_base_backoff: Duration,
    /// Console restart exponential backoff base.
    pub console_restart_base_backoff: Duration,
    /// Console restart exponential backoff clip.
    pub console_restart_max_backoff: Duration,
    /// Console restart attempt cap.
    pub console_max_restart_attempts: u32,
    /// Console output poll period while starting or busy.
    pub console_poll_interval: Duration,
    /// Suffixes that mark the trailing output line as the console prompt.
    pub prompt_terminators: Vec<String>,
    /// Host-side port range the allocator draws RPC ports from.
    pub rpc_port_range: RangeInclusive<u16>,
    /// Wall-clock cap for an executing `msf_command` tool.
    pub msf_tool_timeout: Duration,
    /// Wall-clock cap for an executing `bash_command` tool.
    pub bash_tool_timeout: Duration,
    /// Glob selecting the default model among listed models.
    pub default_model: String,
    /// Credentials and provider filters.
    pub credentials: Credentials,
    /// Path of the sqlite database file.
    pub db_path: String,
}

/// Secrets and provider filters, loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Password the in-container RPC service was started with.
    pub rpc_password: String,
    /// RPC username.
    pub rpc_user: String,
    pub anthropic_api_key: Option<String>,
    /// Globs restricting which provider models register; empty = all.
    pub model_filters: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_millis(30_000),
            max_restart_count: 5,
            base_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(60_000),
            success_reset: Duration::from_millis(300_000),
            msgrpc_initial_delay: Duration::from_millis(5_000),
            msgrpc_max_connect_attempts: 10,
            msgrpc_connect_base_backoff: Duration::from_millis(2_000),
            console_restart_base_backoff: Duration::from_millis(1_000),
            console_restart_max_backoff: Duration::from_millis(30_000),
            console_max_restart_attempts: 10,
            console_poll_interval: Duration::from_millis(500),
            prompt_terminators: vec!["> ".to_string()],
            rpc_port_range: 55553..=55653,
            msf_tool_timeout: Duration::from_millis(300_000),
            bash_tool_timeout: Duration::from_millis(120_000),
            default_model: "claude-*".to_string(),
            credentials: Credentials {
                rpc_user: "msf".to_string(),
                ..Credentials::default()
            },
            db_path: default_db_path(),
        }
    }
}

impl Config {
    /// Build a config from defaults with `MSFAILAB_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        override_ms(&mut cfg.health_check_interval, "MSFAILAB_HEALTH_CHECK_INTERVAL_MS");
        override_u32(&mut cfg.max_restart_count, "MSFAILAB_MAX_RESTART_COUNT");
        override_ms(&mut cfg.base_backoff, "MSFAILAB_BASE_BACKOFF_MS");
        override_ms(&mut cfg.max_backoff, "MSFAILAB_MAX_BACKOFF_MS");
        override_ms(&mut cfg.success_reset, "MSFAILAB_SUCCESS_RESET_MS");
        override_ms(&mut cfg.msgrpc_initial_delay, "MSFAILAB_MSGRPC_INITIAL_DELAY_MS");
        override_u32(
            &mut cfg.msgrpc_max_connect_attempts,
            "MSFAILAB_MSGRPC_MAX_CONNECT_ATTEMPTS",
        );
        override_ms(
            &mut cfg.msgrpc_connect_base_backoff,
            "MSFAILAB_MSGRPC_CONNECT_BASE_BACKOFF_MS",
        );
        override_ms(
            &mut cfg.console_restart_base_backoff,
            "MSFAILAB_CONSOLE_RESTART_BASE_BACKOFF_MS",
        );
        override_ms(
            &mut cfg.console_restart_max_backoff,
            "MSFAILAB_CONSOLE_RESTART_MAX_BACKOFF_MS",
        );
        override_u32(
            &mut cfg.console_max_restart_attempts,
            "MSFAILAB_CONSOLE_MAX_RESTART_ATTEMPTS",
        );
        override_ms(&mut cfg.console_poll_interval, "MSFAILAB_CONSOLE_POLL_INTERVAL_MS");
        override_ms(&mut cfg.msf_tool_timeout, "MSFAILAB_MSF_TOOL_TIMEOUT_MS");
        override_ms(&mut cfg.bash_tool_timeout, "MSFAILAB_BASH_TOOL_TIMEOUT_MS");

        if let Ok(v) = std::env::var("MSFAILAB_PROMPT_TERMINATORS") {
            let terms: Vec<String> = v.split('\x1f').map(str::to_string).collect();
            if !terms.is_empty() {
                cfg.prompt_terminators = terms;
            }
        }
        if let (Ok(lo), Ok(hi)) = (
            std::env::var("MSFAILAB_RPC_PORT_MIN"),
            std::env::var("MSFAILAB_RPC_PORT_MAX"),
        ) {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) {
                if lo <= hi {
                    cfg.rpc_port_range = lo..=hi;
                }
            }
        }
        if let Ok(v) = std::env::var("MSFAILAB_DEFAULT_MODEL") {
            cfg.default_model = v;
        }
        if let Ok(v) = std::env::var("MSFAILAB_DB_PATH") {
            cfg.db_path = v;
        }

        cfg.credentials = Credentials {
            rpc_password: std::env::var("MSFAILAB_RPC_PASSWORD").unwrap_or_default(),
            rpc_user: std::env::var("MSFAILAB_RPC_USER").unwrap_or_else(|_| "msf".to_string()),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            model_filters: std::env::var("MSFAILAB_MODEL_FILTERS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        };

        cfg
    }

    /// Timeout for an executing tool, by tool name.
    pub fn tool_timeout_for(&self, tool_name: &str) -> Duration {
        match tool_name {
            "bash_command" => self.bash_tool_timeout,
            _ => self.msf_tool_timeout,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{home}/.msfailab/msfailab.db")
}

fn override_ms(slot: &mut Duration, var: &str) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(ms) = v.parse::<u64>() {
            *slot = Duration::from_millis(ms);
        }
    }
}

fn override_u32(slot: &mut u32, var: &str) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(n) = v.parse::<u32>() {
            *slot = n;
        }
    }
}
