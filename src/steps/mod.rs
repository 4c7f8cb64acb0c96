// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fixed provisioning pipeline

mod monitoring;
mod shell;
mod ssh;
mod system;
mod tuning;

pub use monitoring::MonitoringAgent;
pub use shell::ShellFramework;
pub use ssh::{is_public_key, SshHardening, SshKeys};
pub use system::{BaseTools, OsIdentity, PackageUpdate, Timezone};
pub use tuning::{LogRotation, NetworkTuning, ZramSwap, SMALL_DISK_GB};

use crate::step::Step;

/// Every step in execution order
pub fn default_steps() -> Vec<Box<dyn Step>> {
    vec![
        Box::new(OsIdentity),
        Box::new(Timezone),
        Box::new(PackageUpdate),
        Box::new(BaseTools),
        Box::new(SshKeys),
        Box::new(SshHardening),
        Box::new(NetworkTuning),
        Box::new(ZramSwap),
        Box::new(LogRotation),
        Box::new(MonitoringAgent),
        Box::new(ShellFramework),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::Config;
    use crate::environment::{Environment, VirtualizationKind};
    use crate::fetch::{FetchPolicy, Fetcher};
    use crate::step::StepContext;
    use crate::testing::{RecordingRunner, ScriptedPrompter, ScriptedTransport};

    pub fn debian_env() -> Environment {
        Environment {
            distro_id: "debian".to_string(),
            distro_version: "12".to_string(),
            distro_like: vec![],
            virtualization: VirtualizationKind::Kvm,
            root_disk_size_bytes: 20 * 1024 * 1024 * 1024,
            has_privilege_elevation: true,
            architecture: "x86_64".to_string(),
        }
    }

    /// Owns one step's worth of boundaries and hands out contexts over them
    pub struct Harness {
        pub env: Environment,
        pub config: Config,
        pub runner: Arc<RecordingRunner>,
        pub transport: Arc<ScriptedTransport>,
        pub fetcher: Fetcher,
        pub prompt: ScriptedPrompter,
    }

    impl Harness {
        pub fn new(env: Environment) -> Self {
            Self::with_runner(env, RecordingRunner::new())
        }

        pub fn with_runner(env: Environment, runner: RecordingRunner) -> Self {
            let config = Config::default();
            let runner = Arc::new(runner);
            let transport = Arc::new(ScriptedTransport::new());
            let fetcher = fetcher_for(&config, transport.clone(), runner.clone());
            Self {
                env,
                config,
                runner,
                transport,
                fetcher,
                prompt: ScriptedPrompter::new(),
            }
        }

        pub fn with_prompt(mut self, prompt: ScriptedPrompter) -> Self {
            self.prompt = prompt;
            self
        }

        pub fn with_transport(mut self, transport: ScriptedTransport) -> Self {
            self.transport = Arc::new(transport);
            self.fetcher = fetcher_for(&self.config, self.transport.clone(), self.runner.clone());
            self
        }

        pub fn ctx(&self) -> StepContext<'_> {
            StepContext {
                env: &self.env,
                config: &self.config,
                commands: self.runner.as_ref(),
                fetcher: &self.fetcher,
                prompt: &self.prompt,
            }
        }
    }

    fn fetcher_for(
        config: &Config,
        transport: Arc<ScriptedTransport>,
        runner: Arc<RecordingRunner>,
    ) -> Fetcher {
        let mut policy = FetchPolicy::from(&config.fetch);
        policy.backoff = Duration::ZERO;
        Fetcher::new(transport, runner, policy)
    }
}
