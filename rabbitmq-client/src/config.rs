use std::env;

use crate::url::mask_credentials;

/// Connection target. Immutable once built.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    url: String,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Builds a connection target from `AMQP_HOST`/`AMQP_PORT`/`AMQP_USER`/`AMQP_PASSWORD`,
    /// or, if set, from a single `AMQP_URL` override.
    pub fn from_env() -> Self {
        if let Ok(url) = env::var("AMQP_URL") {
            return Self::new(url);
        }
        let host = env::var("AMQP_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = env::var("AMQP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5672);
        let user = env::var("AMQP_USER").unwrap_or_else(|_| "guest".to_string());
        let password = env::var("AMQP_PASSWORD").unwrap_or_else(|_| "guest".to_string());
        Self::new(format!("amqp://{}:{}@{}:{}", user, password, host, port))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn masked_url(&self) -> String {
        mask_credentials(&self.url)
    }
}

/// The four AMQP 0-9-1 exchange kinds this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
    Topic,
    Direct,
    Headers,
}

impl ExchangeKind {
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "direct" => Ok(Self::Direct),
            "headers" => Ok(Self::Headers),
            other => Err(other.to_string()),
        }
    }

    pub fn as_lapin(self) -> lapin::ExchangeKind {
        match self {
            Self::Fanout => lapin::ExchangeKind::Fanout,
            Self::Topic => lapin::ExchangeKind::Topic,
            Self::Direct => lapin::ExchangeKind::Direct,
            Self::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Headers => "headers",
        };
        write!(f, "{}", s)
    }
}

/// Identity of the main exchange plus the three derived exchanges the retry/DLE
/// topology needs. Names follow a bit-exact convention so operators can recognise
/// the topology a given service owns at a glance.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    service: String,
    requeue_ttl_ms: i32,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind, service: impl Into<String>, requeue_ttl_ms: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            service: service.into(),
            requeue_ttl_ms,
        }
    }

    pub fn retry_now(&self) -> String {
        format!("{}-for-{}-retry-now", self.name, self.service)
    }

    pub fn retry_later(&self) -> String {
        format!(
            "{}-for-{}-retry-{}ms-later",
            self.name, self.service, self.requeue_ttl_ms
        )
    }

    pub fn dead_letter(&self) -> String {
        format!("{}-for-{}-dle", self.name, self.service)
    }
}

/// Main queue plus its derived DLQ and retry-later queue names.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub patterns: Vec<String>,
    pub requeue_ttl_ms: i32,
    pub retry_limit: u32,
    pub max_priority: u8,
    pub prefetch_count: u16,
}

impl QueueSpec {
    pub fn new(exchange_name: &str, service: &str, requeue_ttl_ms: i32) -> Self {
        Self {
            name: format!("{}-for-{}", exchange_name, service),
            patterns: vec!["#".to_string()],
            requeue_ttl_ms,
            retry_limit: 10,
            max_priority: 0,
            prefetch_count: 20,
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        if patterns.is_empty() {
            log::info!(
                "rabbitmq-client: no routing patterns supplied for queue {}, defaulting to \"#\"",
                self.name
            );
            self.patterns = vec!["#".to_string()];
        } else {
            self.patterns = patterns;
        }
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = max_priority;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn dlq(&self) -> String {
        format!("{}-dlq", self.name)
    }

    pub fn retry_later_queue(&self) -> String {
        format!("{}-retry-{}ms-later", self.name, self.requeue_ttl_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub connection: ConnectionConfig,
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub service: String,
}

impl ConsumerConfig {
    pub fn new(connection: ConnectionConfig, exchange: ExchangeSpec, queue: QueueSpec, service: impl Into<String>) -> Self {
        Self {
            connection,
            exchange,
            queue,
            service: service.into(),
        }
    }

    /// Builds a `ConsumerConfig` from the `RABBITMQ_*` environment variables, following
    /// the naming the teacher's own subscriber uses for its tunables.
    pub fn from_env() -> Self {
        let connection = ConnectionConfig::from_env();
        let service =
            env::var("RABBITMQ_SERVICE_NAME").unwrap_or_else(|_| "service".to_string());
        let exchange_name =
            env::var("RABBITMQ_EXCHANGE").unwrap_or_else(|_| "events".to_string());
        let kind = env::var("RABBITMQ_EXCHANGE_TYPE")
            .ok()
            .and_then(|v| ExchangeKind::from_str_loose(&v).ok())
            .unwrap_or(ExchangeKind::Fanout);
        let requeue_ttl_ms: i32 = env::var("RABBITMQ_REQUEUE_TTL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);
        let retry_limit: u32 = env::var("RABBITMQ_RETRY_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let max_priority: u8 = env::var("RABBITMQ_MAX_PRIORITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let prefetch_count: u16 = env::var("RABBITMQ_PREFETCH_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let exchange = ExchangeSpec::new(exchange_name.clone(), kind, service.clone(), requeue_ttl_ms);
        let patterns: Vec<String> = env::var("RABBITMQ_QUEUE_PATTERNS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let queue = QueueSpec::new(&exchange_name, &service, requeue_ttl_ms)
            .with_patterns(patterns)
            .with_retry_limit(retry_limit)
            .with_max_priority(max_priority)
            .with_prefetch_count(prefetch_count);

        Self::new(connection, exchange, queue, service)
    }

    pub fn publisher_config(&self, confirmable: bool) -> PublisherConfig {
        PublisherConfig {
            connection: self.connection.clone(),
            exchange: self.exchange.clone(),
            confirmable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub connection: ConnectionConfig,
    pub exchange: ExchangeSpec,
    pub confirmable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_bit_exact_names() {
        let exchange = ExchangeSpec::new("orders", ExchangeKind::Topic, "billing", 5_000);
        assert_eq!(exchange.retry_now(), "orders-for-billing-retry-now");
        assert_eq!(exchange.retry_later(), "orders-for-billing-retry-5000ms-later");
        assert_eq!(exchange.dead_letter(), "orders-for-billing-dle");

        let queue = QueueSpec::new("orders", "billing", 5_000);
        assert_eq!(queue.name, "orders-for-billing");
        assert_eq!(queue.dlq(), "orders-for-billing-dlq");
        assert_eq!(queue.retry_later_queue(), "orders-for-billing-retry-5000ms-later");
    }

    #[test]
    fn empty_patterns_default_to_match_all() {
        let queue = QueueSpec::new("orders", "billing", 1_000).with_patterns(vec![]);
        assert_eq!(queue.patterns, vec!["#".to_string()]);
    }

    #[test]
    fn exchange_kind_parses_case_insensitively() {
        assert_eq!(ExchangeKind::from_str_loose("TOPIC").unwrap(), ExchangeKind::Topic);
        assert_eq!(ExchangeKind::from_str_loose("Direct").unwrap(), ExchangeKind::Direct);
        assert!(ExchangeKind::from_str_loose("bogus").is_err());
    }
}
