use anyhow::Result;

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEALTH_PORT: u16 = 8081;

// Outbound delivery limits. A slow client gets the full send timeout before
// it is force-disconnected; the buffer absorbs bursts up to its capacity and
// then evicts oldest non-critical frames.
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 20;
const DEFAULT_OUTBOUND_BUFFER_CAPACITY: usize = 256;

// Long-poll fallback: how long a poll request parks before returning empty.
const DEFAULT_POLL_WAIT_SECS: u64 = 25;

// Login rate limiter defaults (fixed window).
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 10;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: i64 = 60;

// Relay defaults.
const DEFAULT_KAFKA_BROKERS: &str = "localhost:9092";
const DEFAULT_KAFKA_GROUP_PREFIX: &str = "streamhub";
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5000;

// Destinations anonymous connections may use when no allow-list is
// configured. Everything else requires a bound principal.
const DEFAULT_PUBLIC_DESTINATIONS: &[&str] = &[
    "/topic/exchange-rates",
    "/app/exchange-rates/subscribe",
    "/app/exchange-rates/request",
];

// ============================================================================
// Configuration Structures
// ============================================================================

/// JWT validation configuration. This service only validates tokens;
/// issuance lives elsewhere.
#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
}

/// Kafka relay configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Whether the relay is enabled (false = single-replica mode, used in tests)
    pub enabled: bool,
    /// Comma-separated list of Kafka brokers (e.g., "kafka1:9092,kafka2:9092")
    pub brokers: String,
    /// Consumer group prefix; each process instance appends a unique suffix
    /// so every replica observes the full stream
    pub group_prefix: String,
    /// How long a publish may wait for the full-ack commit before it fails
    pub publish_timeout_ms: u64,
}

/// Login rate limiter configuration.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: i64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub health_port: u16,
    pub jwt: JwtConfig,
    pub relay: RelayConfig,
    pub rate_limit: RateLimitConfig,
    /// Destinations anonymous connections may subscribe or send to
    pub public_destinations: Vec<String>,
    /// Per-connection outbound buffer capacity (frames)
    pub outbound_buffer_capacity: usize,
    /// Maximum time a single outbound send may take before the connection
    /// is force-closed
    pub send_timeout_secs: u64,
    /// Maximum time a long-poll request parks waiting for frames
    pub poll_wait_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let secret = std::env::var("JWT_SECRET")?;
        if secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 characters long");
        }

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            health_port: std::env::var("HEALTH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_HEALTH_PORT),
            jwt: JwtConfig {
                secret,
                issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "streamhub".to_string()),
            },
            relay: RelayConfig {
                enabled: std::env::var("KAFKA_ENABLED")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(true),
                brokers: std::env::var("KAFKA_BROKERS")
                    .unwrap_or_else(|_| DEFAULT_KAFKA_BROKERS.to_string()),
                group_prefix: std::env::var("KAFKA_GROUP_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_KAFKA_GROUP_PREFIX.to_string()),
                publish_timeout_ms: std::env::var("KAFKA_PUBLISH_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS),
            },
            rate_limit: RateLimitConfig {
                max_requests: std::env::var("LOGIN_RATE_LIMIT_MAX_REQUESTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS),
                window_seconds: std::env::var("LOGIN_RATE_LIMIT_WINDOW_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            },
            public_destinations: std::env::var("PUBLIC_DESTINATIONS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| {
                    DEFAULT_PUBLIC_DESTINATIONS
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
            outbound_buffer_capacity: std::env::var("OUTBOUND_BUFFER_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_OUTBOUND_BUFFER_CAPACITY),
            send_timeout_secs: std::env::var("SEND_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SEND_TIMEOUT_SECS),
            poll_wait_secs: std::env::var("POLL_WAIT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_POLL_WAIT_SECS),
        })
    }

    /// Configuration for tests: no Kafka, permissive defaults, fixed secret.
    #[doc(hidden)]
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            health_port: 0,
            jwt: JwtConfig {
                secret: "test-secret-test-secret-test-secret!".to_string(),
                issuer: "streamhub".to_string(),
            },
            relay: RelayConfig {
                enabled: false,
                brokers: DEFAULT_KAFKA_BROKERS.to_string(),
                group_prefix: DEFAULT_KAFKA_GROUP_PREFIX.to_string(),
                publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
            },
            rate_limit: RateLimitConfig {
                max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
                window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            },
            public_destinations: DEFAULT_PUBLIC_DESTINATIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            outbound_buffer_capacity: DEFAULT_OUTBOUND_BUFFER_CAPACITY,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            poll_wait_secs: 1,
        }
    }
}
