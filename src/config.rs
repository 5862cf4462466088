use std::time::Duration;

/// How unknown or changed host keys are treated during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents (trust on first use).
    /// Convenient for lab fleets; hardened deployments should pin keys.
    #[default]
    AcceptAny,
    /// Require the server key's SHA-256 hash to match this lowercase hex string.
    Fingerprint(String),
}

/// Settings applied when opening SSH sessions.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Bound on the TCP connect and on socket I/O during the handshake.
    pub connect_timeout: Duration,
    /// Keepalive interval sent once the session is authenticated.
    /// `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(30)),
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }
}

/// Settings for the command executor and its watchdog.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deadline used when a call does not supply its own.
    pub default_timeout: Duration,
    /// How often the watchdog checks the deadline.
    pub watchdog_interval: Duration,
    /// Deadline for the small probe commands (OS detection, home lookup, mkdir).
    pub probe_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(360),
            watchdog_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs executing at once. Extra submissions wait FIFO.
    pub pool_capacity: usize,
    /// Timeout handed to jobs whose request does not carry one.
    pub default_timeout: Duration,
    /// Capacity of the status event broadcast channel. Slow subscribers
    /// lag and lose the oldest events rather than stalling the scheduler.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 10,
            default_timeout: Duration::from_secs(360),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub connect: ConnectConfig,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
}

impl RunnerConfig {
    /// Override the default command timeout for both direct and scheduled runs.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.executor.default_timeout = timeout;
        self.scheduler.default_timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.scheduler.pool_capacity = capacity.max(1);
        self
    }
}
