use std::time::Duration;

/// Trigger line polling and per-phase timeouts.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    /// When false, synchronization is skipped even if lines are attached.
    pub enabled: bool,
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub continue_timeout: Duration,
    pub done_timeout: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(500),
            start_timeout: Duration::from_secs(600),
            continue_timeout: Duration::from_secs(600),
            done_timeout: Duration::from_secs(600),
        }
    }
}

impl TriggerConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_continue_timeout(mut self, timeout: Duration) -> Self {
        self.continue_timeout = timeout;
        self
    }

    pub fn with_done_timeout(mut self, timeout: Duration) -> Self {
        self.done_timeout = timeout;
        self
    }
}

/// Paths the instrument sees and trigger settings for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Directory holding the `.cam` method files, as seen by the instrument PC.
    pub method_dir: String,
    /// Directory for aux logs, as seen by the instrument PC.
    pub log_dir: String,
    pub triggers: TriggerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            method_dir: "C:/Users/Public/Documents/PAL/methods".to_string(),
            log_dir: "C:/Users/Public/Documents/PAL/logs".to_string(),
            triggers: TriggerConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_method_dir(mut self, dir: impl Into<String>) -> Self {
        self.method_dir = dir.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<String>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_triggers(mut self, triggers: TriggerConfig) -> Self {
        self.triggers = triggers;
        self
    }
}

/// Join a file name onto an instrument-side directory, keeping whichever
/// separator the directory already uses.
pub fn join_instrument_path(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        return file.to_string();
    }
    let separator = if dir.contains('\\') && !dir.contains('/') {
        '\\'
    } else {
        '/'
    };
    let trimmed = dir.trim_end_matches(['/', '\\']);
    format!("{}{}{}", trimmed, separator, file)
}
