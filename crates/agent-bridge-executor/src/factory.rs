//! Driver construction from configuration.

use std::sync::Arc;

use agent_bridge_core::{AgentType, Driver, DriverError, DriverFactory, EventSink};

use crate::{ClaudeDriver, CodexDriver, GeminiDriver, config::DriverConfig};

/// Builds the stock drivers.
#[derive(Debug, Clone, Default)]
pub struct DefaultDriverFactory {
    config: DriverConfig,
}

impl DefaultDriverFactory {
    #[must_use]
    pub const fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, agent_type: AgentType, sink: EventSink) -> Result<Arc<dyn Driver>, DriverError> {
        let config = self.config.backend(agent_type).clone();
        let driver: Arc<dyn Driver> = match agent_type {
            AgentType::Claude => Arc::new(ClaudeDriver::new(config, sink)),
            AgentType::Codex => Arc::new(CodexDriver::new(config, sink)),
            AgentType::Gemini => Arc::new(GeminiDriver::new(config, sink)),
        };
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use agent_bridge_core::CostPolicy;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn drivers_carry_their_backend_config() {
        let mut config = DriverConfig::default();
        config.codex = BackendConfig::codex().with_cost_policy(CostPolicy::Additive);
        let factory = DefaultDriverFactory::new(config);

        for agent_type in AgentType::ALL {
            let (tx, _rx) = mpsc::unbounded_channel();
            let driver = factory.create(agent_type, tx).unwrap();
            assert_eq!(driver.agent_type(), agent_type);
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let codex = factory.create(AgentType::Codex, tx).unwrap();
        assert_eq!(codex.cost_policy(), CostPolicy::Additive);
        assert_eq!(codex.context_window(), 272_000);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(factory.create(AgentType::Gemini, tx).unwrap().context_window(), 1_048_576);
    }
}
