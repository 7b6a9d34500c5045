use crate::llm::GatewayConfig;
use crate::retry::RetryPolicy;
use crate::AppConfig;
use clap::Parser;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::PathBuf;
use std::time::Duration;

/// Common command-line arguments shared by the server and the batch tool
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the judgeflow database
    #[arg(long, env = "JUDGEFLOW_DB", default_value = "data/judgeflow.db")]
    pub db: PathBuf,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL
    #[arg(
        long,
        env = "OPENAI_API_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    pub openai_api_base: String,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: Option<String>,

    /// Anthropic API base URL
    #[arg(
        long,
        env = "ANTHROPIC_API_BASE",
        default_value = "https://api.anthropic.com/v1"
    )]
    pub anthropic_api_base: String,

    /// Retries after a rate-limited or failed provider call
    #[arg(long, default_value_t = crate::retry::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Backoff unit; the n-th retry waits n times this long
    #[arg(long, default_value_t = 1000)]
    pub retry_base_delay_ms: u64,

    /// Timeout for a single provider request
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
}

impl CommonArgs {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            openai_api_key: self.openai_api_key.clone(),
            openai_api_base: self.openai_api_base.clone(),
            anthropic_api_key: self.anthropic_api_key.clone(),
            anthropic_api_base: self.anthropic_api_base.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn app_config(&self, pool: Pool<SqliteConnectionManager>) -> AppConfig {
        AppConfig {
            judgeflow_pool: pool,
            gateway: self.gateway_config(),
            retry_policy: self.retry_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Parser, Debug)]
    struct Wrapper {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn flags_override_defaults() {
        let args = Wrapper::parse_from([
            "judgeflow",
            "--db",
            "/tmp/j.db",
            "--max-retries",
            "5",
            "--retry-base-delay-ms",
            "250",
            "--openai-api-base",
            "http://localhost:8080/v1",
        ])
        .common;

        assert_eq!(args.db, PathBuf::from("/tmp/j.db"));
        assert_eq!(
            args.retry_policy(),
            RetryPolicy::new(5, Duration::from_millis(250))
        );
        let gateway = args.gateway_config();
        assert_eq!(gateway.openai_api_base, "http://localhost:8080/v1");
        assert_eq!(gateway.request_timeout, Duration::from_secs(120));
    }
}
