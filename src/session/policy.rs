//! Upper bounds for every wait in a build run.

use std::time::Duration;

/// Named, independent timeouts for the waits of one build run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeoutPolicy {
    /// Limit on a single shell connection attempt.
    pub connect_timeout: Duration,
    /// Connection attempts made before giving up.
    pub connect_attempts: u32,
    /// Pause between connection attempts.
    pub connect_backoff: Duration,
    /// Limit on one remote command inside the execution engine.
    pub command_timeout: Duration,
    /// Limit on opening an execution channel.
    pub channel_open_timeout: Duration,
    /// Pause between idle output polls.
    pub output_poll_interval: Duration,
    /// Limit on the host reaching `running`.
    pub start_timeout: Duration,
    /// Limit on termination being confirmed.
    pub terminate_timeout: Duration,
    /// Pause between instance status polls.
    pub status_poll_interval: Duration,
    /// Limit on the provisioning script as a whole.
    pub script_timeout: Duration,
    /// Limit on the readiness signal once the script has returned.
    pub readiness_timeout: Duration,
}

impl TimeoutPolicy {
    /// Pause between idle output polls of the execution engine.
    pub const OUTPUT_POLL_INTERVAL: Duration = crate::exec::IDLE_BACKOFF;
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 150,
            connect_backoff: Duration::from_secs(2),
            command_timeout: crate::exec::COMMAND_TIMEOUT,
            channel_open_timeout: crate::exec::CHANNEL_OPEN_TIMEOUT,
            output_poll_interval: Self::OUTPUT_POLL_INTERVAL,
            start_timeout: Duration::from_secs(600),
            terminate_timeout: Duration::from_secs(600),
            status_poll_interval: Duration::from_secs(5),
            script_timeout: Duration::from_secs(1800),
            readiness_timeout: Duration::from_secs(300),
        }
    }
}
