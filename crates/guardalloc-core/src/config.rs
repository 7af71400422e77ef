//! Heap policy configuration.
//!
//! Policy is decided once, when a heap is constructed. The process-wide heap
//! reads it from the environment:
//! - `GUARDALLOC_POLICY`: `report` (default) keeps running after corruption
//!   is reported; `panic` escalates heap corruption to a panic.
//! - `GUARDALLOC_POISON`: `1`/`true`/`on`/`yes` fills new and freed payloads
//!   with [`POISON_BYTE`](crate::layout::POISON_BYTE).
//! - `GUARDALLOC_FAIL_ON_LEAK`: same truthy values; marks a non-empty leak
//!   summary as fatal.

/// What happens after heap corruption has been reported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPolicy {
    /// Report through the sink and keep going.
    #[default]
    Report,
    /// Report, then panic once the registry lock is released.
    Panic,
}

impl ErrorPolicy {
    /// Parse from string (case-insensitive). Unknown values yield `Report`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "panic" | "abort" | "strict" | "fatal" => Self::Panic,
            _ => Self::Report,
        }
    }

    #[must_use]
    pub const fn escalates(self) -> bool {
        matches!(self, Self::Panic)
    }
}

/// Construction-time settings for a [`GuardedHeap`](crate::GuardedHeap).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapConfig {
    pub error_policy: ErrorPolicy,
    /// Initial state of poison fill; can be toggled at runtime.
    pub poison_fill: bool,
    /// Flag a non-empty leak summary as fatal.
    pub fail_on_leak: bool,
}

impl HeapConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            error_policy: ErrorPolicy::Report,
            poison_fill: false,
            fail_on_leak: false,
        }
    }

    #[must_use]
    pub const fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_poison_fill(mut self, enabled: bool) -> Self {
        self.poison_fill = enabled;
        self
    }

    #[must_use]
    pub const fn with_fail_on_leak(mut self, enabled: bool) -> Self {
        self.fail_on_leak = enabled;
        self
    }

    /// Build a config from the `GUARDALLOC_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let error_policy = lookup("GUARDALLOC_POLICY")
            .map(|v| ErrorPolicy::from_str_loose(&v))
            .unwrap_or_default();
        let poison_fill = lookup("GUARDALLOC_POISON").is_some_and(|v| parse_flag(&v));
        let fail_on_leak = lookup("GUARDALLOC_FAIL_ON_LEAK").is_some_and(|v| parse_flag(&v));
        Self {
            error_policy,
            poison_fill,
            fail_on_leak,
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_policies() {
        assert_eq!(ErrorPolicy::from_str_loose("panic"), ErrorPolicy::Panic);
        assert_eq!(ErrorPolicy::from_str_loose("ABORT"), ErrorPolicy::Panic);
        assert_eq!(ErrorPolicy::from_str_loose(" strict "), ErrorPolicy::Panic);
        assert_eq!(ErrorPolicy::from_str_loose("report"), ErrorPolicy::Report);
        assert_eq!(ErrorPolicy::from_str_loose("bogus"), ErrorPolicy::Report);
        assert_eq!(ErrorPolicy::from_str_loose(""), ErrorPolicy::Report);
    }

    #[test]
    fn default_is_report_without_poison() {
        let config = HeapConfig::default();
        assert_eq!(config, HeapConfig::new());
        assert_eq!(config.error_policy, ErrorPolicy::Report);
        assert!(!config.poison_fill);
        assert!(!config.fail_on_leak);
        assert!(!config.error_policy.escalates());
    }

    #[test]
    fn lookup_reads_all_keys() {
        let config = HeapConfig::from_lookup(|key| match key {
            "GUARDALLOC_POLICY" => Some("Panic".to_string()),
            "GUARDALLOC_POISON" => Some("on".to_string()),
            "GUARDALLOC_FAIL_ON_LEAK" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.error_policy, ErrorPolicy::Panic);
        assert!(config.poison_fill);
        assert!(!config.fail_on_leak);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        assert_eq!(HeapConfig::from_lookup(|_| None), HeapConfig::default());
    }

    #[test]
    fn builder_setters_compose() {
        let config = HeapConfig::new()
            .with_error_policy(ErrorPolicy::Panic)
            .with_poison_fill(true)
            .with_fail_on_leak(true);
        assert!(config.error_policy.escalates());
        assert!(config.poison_fill);
        assert!(config.fail_on_leak);
    }
}
