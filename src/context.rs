//! Run context shared by every component.
//!
//! Built once at process start and passed by reference; there is no global
//! session state.

use std::sync::Arc;

use crate::config::SetupConfig;
use crate::error::DaqResult;
use crate::experiment::InterruptFlag;

/// Validated configuration plus the run's interrupt flag.
#[derive(Debug, Clone)]
pub struct Context {
    config: Arc<SetupConfig>,
    interrupt: InterruptFlag,
}

impl Context {
    /// Validate `config` and wrap it with a fresh interrupt flag.
    pub fn new(config: SetupConfig) -> DaqResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            interrupt: InterruptFlag::new(),
        })
    }

    /// The setup configuration.
    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    /// Shared handle to the setup configuration.
    pub fn config_arc(&self) -> Arc<SetupConfig> {
        Arc::clone(&self.config)
    }

    /// Interrupt flag checked between sweep steps.
    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }
}
