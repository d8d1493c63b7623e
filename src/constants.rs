/// Pattern segment matching exactly one path segment.
pub const WILD_ONE: &str = "*";

/// Pattern segment matching one or more path segments.
pub const WILD_DEEP: &str = "**";

/// Bounded retry for transient connection failures.
pub const DEFAULT_CONN_RETRIES: usize = 5;

/// Prefix for environment-variable configuration overrides.
pub const ENV_PREFIX: &str = "KV_MIRROR";
