// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Whether to run in local mode (local login, tournament authoring, no energy).
    pub local_mode: bool,
    /// Directory containing the pre-built mini-app bundle to serve.
    pub static_dir: Option<PathBuf>,
    /// Gameplay tuning.
    pub rules: GameRules,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:trivia.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `TRIVIA_LOCAL_MODE` - Set to `true` to enable local mode
    /// - `STATIC_DIR` - Path to the mini-app dist directory for static file serving
    ///
    /// CLI flags:
    /// - `--local` - Enable local mode (same as `TRIVIA_LOCAL_MODE=true`)
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:trivia.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let local_mode = args.contains(&"--local".to_string()) || env_flag("TRIVIA_LOCAL_MODE");

        let static_dir = std::env::var("STATIC_DIR").ok().map(PathBuf::from);

        let mut rules = GameRules::from_env();
        if local_mode {
            rules.energy_bypass = true;
        }

        Config {
            database_url,
            port,
            local_mode,
            static_dir,
            rules,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

/// Tuning constants for energy, sessions and leaderboard scoring.
#[derive(Debug, Clone)]
pub struct GameRules {
    /// Free attempts available inside one cooldown window.
    pub max_attempts: u32,
    /// Each attempt regenerates this long after the session that spent it started.
    pub attempt_cooldown: Duration,
    /// Minimum gap between finishing a quiz and starting it again.
    pub min_attempt_interval: Duration,
    /// Live sessions whose current question started longer ago than this are abandoned.
    pub abandon_after: Duration,
    /// Activity bonus credited per finished game.
    pub per_game_bonus: i64,
    /// Cap on the activity bonus.
    pub max_activity_bonus: i64,
    /// Whether finishes also feed the weekly competition.
    pub weekly_enabled: bool,
    /// Skip the energy gate and energy notifications entirely.
    pub energy_bypass: bool,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_cooldown: Duration::from_secs(4 * 60 * 60),
            min_attempt_interval: Duration::from_secs(30),
            abandon_after: Duration::from_secs(30 * 60),
            per_game_bonus: 50,
            max_activity_bonus: 500,
            weekly_enabled: true,
            energy_bypass: false,
        }
    }
}

impl GameRules {
    /// Read overrides from the environment, falling back to [`GameRules::default`].
    ///
    /// - `MAX_ATTEMPTS`, `ATTEMPT_COOLDOWN_SECS`, `MIN_ATTEMPT_INTERVAL_SECS`,
    ///   `SESSION_ABANDON_SECS`, `PER_GAME_BONUS`, `MAX_ACTIVITY_BONUS`
    /// - `WEEKLY_ENABLED`, `ENERGY_BYPASS` (`true`/`1`)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse("MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            attempt_cooldown: env_parse("ATTEMPT_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_cooldown),
            min_attempt_interval: env_parse("MIN_ATTEMPT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_attempt_interval),
            abandon_after: env_parse("SESSION_ABANDON_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.abandon_after),
            per_game_bonus: env_parse("PER_GAME_BONUS").unwrap_or(defaults.per_game_bonus),
            max_activity_bonus: env_parse("MAX_ACTIVITY_BONUS")
                .unwrap_or(defaults.max_activity_bonus),
            weekly_enabled: std::env::var("WEEKLY_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(defaults.weekly_enabled),
            energy_bypass: env_flag("ENERGY_BYPASS"),
        }
    }

    pub fn attempt_cooldown_ms(&self) -> i64 {
        self.attempt_cooldown.as_millis() as i64
    }

    pub fn min_attempt_interval_ms(&self) -> i64 {
        self.min_attempt_interval.as_millis() as i64
    }

    pub fn abandon_after_ms(&self) -> i64 {
        self.abandon_after.as_millis() as i64
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_value() {
        let args: Vec<String> = ["trivia-backend", "--port", "8080", "--local"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(Config::parse_cli_value(&args, "--port"), Some("8080".into()));
        assert_eq!(Config::parse_cli_value(&args, "--missing"), None);
    }

    #[test]
    fn test_default_rules() {
        let rules = GameRules::default();
        assert_eq!(rules.max_attempts, 5);
        assert_eq!(rules.attempt_cooldown_ms(), 4 * 60 * 60 * 1000);
        assert_eq!(rules.abandon_after_ms(), 30 * 60 * 1000);
        // Ten games reach the bonus cap
        assert_eq!(rules.max_activity_bonus / rules.per_game_bonus, 10);
        assert!(!rules.energy_bypass);
    }
}
