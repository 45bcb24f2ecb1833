use std::time::Duration;

// ======= Submission =======

/// How often a submission is re-attempted before the value is given up on.
pub const RETRY_TIMES: u32 = 3;

/// Average block interval of the bridged chains. Used as the sleep between
/// submission retries and as the receipt-poll interval of the confirmation
/// tracker.
pub const BLOCK_INTERVAL: Duration = Duration::from_secs(10);

/// Number of confirmations a submit-header transaction needs on the target
/// chain before receipt proofs for the covered height are released.
pub const CONFIRMATIONS: u64 = 10;

/// Upper bound on how long a receipt-proof submission waits for its covering
/// header to be confirmed before proceeding anyway.
pub const RECEIVE_TOKEN_DELAY: Duration = Duration::from_secs(200);

// ======= Subscriptions =======

/// Attempts to re-establish a dropped subscription before the owning relayer
/// gives up and shuts down.
pub const RESUBSCRIBE_ATTEMPTS: u32 = 3;

// ======= Channels =======

pub const MONITOR_TASK_INBOX_CAPACITY: usize = 16;

pub const DATA_CHANNEL_CAPACITY: usize = 16;

// ======= Shutdown =======

/// Poll interval while waiting for tasks to report `Stopped`.
pub const STOPPED_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tasks must drain within this window once the manager starts stopping them.
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ======= Settings environment variables =======

/// Prefix for environment overrides of the settings file, e.g.
/// `RELAYER__WEB3Q__WS_ENDPOINT`.
pub const SETTINGS_ENV_PREFIX: &str = "RELAYER";

/// Base path for the settings file.
pub const CONFIG_ROOT: &str = "RELAYER_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "./config";

pub const SETTINGS_FILE_NAME: &str = "engine.toml";
