//! Key naming for the shared registers

/// Builds every key the core reads or writes, under a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterKeys {
    prefix: String,
}

impl CounterKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Backlog depth
    pub fn queue_size(&self) -> String {
        format!("{}:queue_size", self.prefix)
    }

    /// Sequencer register
    pub fn sequence(&self) -> String {
        format!("{}:sequence", self.prefix)
    }

    /// Last reserved dispatch slot of the output pacer
    pub fn last_dispatch(&self) -> String {
        format!("{}:last_dispatch", self.prefix)
    }

    /// Unix second of the last housekeeping sweep
    pub fn last_cleanup(&self) -> String {
        format!("{}:last_cleanup", self.prefix)
    }

    /// Prefix shared by all admission window keys
    pub fn input_window_prefix(&self) -> String {
        format!("{}:input_limit:", self.prefix)
    }

    /// Admission window key for one window start (unix seconds)
    pub fn input_window(&self, window_start: u64) -> String {
        format!("{}{}", self.input_window_prefix(), window_start)
    }

    /// Window start encoded in an admission window key
    pub fn parse_input_window(&self, key: &str) -> Option<u64> {
        key.strip_prefix(&self.input_window_prefix())?.parse().ok()
    }
}
