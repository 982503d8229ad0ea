/// How often the messaging channel may retry a broker connection after a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry on every loop iteration with no delay.
    Immediate,
    /// Capped exponential backoff. The first attempt after a drop is immediate.
    Backoff { base_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Backoff {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Wait imposed before the next attempt once `failures` consecutive attempts have failed.
    pub fn delay_ms(self, failures: u32) -> u64 {
        match self {
            Self::Immediate => 0,
            Self::Backoff { base_ms, max_ms } => {
                if failures == 0 {
                    return 0;
                }
                let shift = (failures - 1).min(31);
                base_ms
                    .checked_mul(1_u64 << shift)
                    .unwrap_or(u64::MAX)
                    .min(max_ms)
            }
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "immediate" | "legacy" => Some(Self::Immediate),
            "backoff" => Some(Self::default()),
            _ => None,
        }
    }
}

/// Failure bookkeeping for one broker link.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    failures: u32,
    last_attempt_ms: Option<u64>,
}

impl ReconnectState {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn attempt_due(&self, policy: ReconnectPolicy, now_ms: u64) -> bool {
        match self.last_attempt_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= policy.delay_ms(self.failures),
        }
    }

    pub fn record_attempt(&mut self, now_ms: u64, connected: bool) {
        if connected {
            self.failures = 0;
            self.last_attempt_ms = None;
        } else {
            self.failures = self.failures.saturating_add(1);
            self.last_attempt_ms = Some(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = ReconnectPolicy::Backoff {
            base_ms: 500,
            max_ms: 30_000,
        };
        let delays: Vec<u64> = (0..9).map(|failures| policy.delay_ms(failures)).collect();

        assert_eq!(
            delays,
            vec![0, 500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
        assert_eq!(policy.delay_ms(u32::MAX), 30_000);
    }

    #[test]
    fn immediate_never_waits() {
        assert_eq!(ReconnectPolicy::Immediate.delay_ms(0), 0);
        assert_eq!(ReconnectPolicy::Immediate.delay_ms(1_000), 0);
    }

    #[test]
    fn success_resets_failures() {
        let policy = ReconnectPolicy::default();
        let mut state = ReconnectState::default();

        state.record_attempt(0, false);
        state.record_attempt(500, false);
        assert_eq!(state.failures(), 2);
        assert!(!state.attempt_due(policy, 1_000));
        assert!(state.attempt_due(policy, 1_500));

        state.record_attempt(1_500, true);
        assert_eq!(state.failures(), 0);
        assert!(state.attempt_due(policy, 1_500));
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!(
            ReconnectPolicy::parse("Immediate"),
            Some(ReconnectPolicy::Immediate)
        );
        assert_eq!(
            ReconnectPolicy::parse("backoff"),
            Some(ReconnectPolicy::default())
        );
        assert_eq!(ReconnectPolicy::parse("sometimes"), None);
    }
}
