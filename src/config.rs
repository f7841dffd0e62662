//! Engine configuration.

/// Default size of internal buffers and prefetch windows.
pub const DEFAULT_BUFFER_SIZE: usize = 128;

/// Environment variable overriding [`FlowConfig::buffer_size`].
pub const BUFFER_SIZE_ENV: &str = "FLUXWELD_BUFFER_SIZE";

/// Configuration shared by every stage subscribed under one [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowConfig {
    /// Capacity of bounded handoff queues and the default prefetch amount
    pub buffer_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl FlowConfig {
    /// Read the configuration from the environment, falling back to defaults.
    ///
    /// Unparsable values are ignored; the buffer size never drops below one.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(BUFFER_SIZE_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(size) => config = config.buffer_size(size),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {}", BUFFER_SIZE_ENV),
            }
        }
        config
    }

    /// Set the buffer size (clamped to at least 1)
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_is_clamped() {
        assert_eq!(FlowConfig::default().buffer_size(0).buffer_size, 1);
        assert_eq!(FlowConfig::default().buffer_size, DEFAULT_BUFFER_SIZE);
    }
}
