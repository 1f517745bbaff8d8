use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use orchestrator::{DispatcherConfig, TriggerConfig};
use pal_core::{CustomCapabilities, TrayKind};
use registry::{Topology, TraySpec};
use serde::{Deserialize, Serialize};
use transport::{LocalTransportConfig, RemoteTransportConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PalConfig {
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub triggers: TriggerSection,
    #[serde(default)]
    pub topology: TopologySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySection {
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerSection {
    pub database_url: String,
    pub machine_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    pub kind: TransportKind,
    pub pal_executable: String,
    pub method_dir: String,
    pub log_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerSection {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub start_timeout_secs: u64,
    pub continue_timeout_secs: u64,
    pub done_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologySection {
    #[serde(default)]
    pub customs: Vec<CustomEntry>,
    #[serde(default)]
    pub trays: Vec<TraySpec>,
}

/// A custom position with its capability flags inlined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomEntry {
    pub name: String,
    #[serde(default)]
    pub assembly_allowed: bool,
    #[serde(default = "default_true")]
    pub destination_allowed: bool,
    #[serde(default)]
    pub always_destroys: bool,
}

fn default_true() -> bool {
    true
}

impl CustomEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            assembly_allowed: false,
            destination_allowed: true,
            always_destroys: false,
        }
    }

    fn capabilities(&self) -> CustomCapabilities {
        CustomCapabilities::default()
            .with_assembly(self.assembly_allowed)
            .with_destination(self.destination_allowed)
            .with_always_destroys(self.always_destroys)
    }
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from(".pal/registry.json"),
        }
    }
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            database_url: "sqlite:.pal/ledger.db".to_string(),
            machine_name: "pal1".to_string(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            kind: TransportKind::Local,
            pal_executable: "C:\\Program Files\\CTC Analytics\\PAL\\PAL.exe".to_string(),
            method_dir: dispatcher.method_dir,
            log_dir: dispatcher.log_dir,
            host: None,
            user: None,
            key_path: None,
            launcher: None,
        }
    }
}

impl Default for TriggerSection {
    fn default() -> Self {
        let triggers = TriggerConfig::default();
        Self {
            enabled: triggers.enabled,
            poll_interval_ms: triggers.poll_interval.as_millis() as u64,
            start_timeout_secs: triggers.start_timeout.as_secs(),
            continue_timeout_secs: triggers.continue_timeout.as_secs(),
            done_timeout_secs: triggers.done_timeout.as_secs(),
        }
    }
}

impl Default for PalConfig {
    fn default() -> Self {
        let mut cell = CustomEntry::new("cell1_we");
        cell.assembly_allowed = true;
        let mut injector = CustomEntry::new("lcInjector1");
        injector.always_destroys = true;
        let mut reservoir = CustomEntry::new("elec_res1");
        reservoir.destination_allowed = false;

        Self {
            registry: RegistrySection::default(),
            ledger: LedgerSection::default(),
            transport: TransportSection::default(),
            triggers: TriggerSection::default(),
            topology: TopologySection {
                customs: vec![reservoir, cell, injector],
                trays: vec![
                    TraySpec::new(1, 1, TrayKind::Vt15),
                    TraySpec::new(2, 1, TrayKind::Vt54),
                ],
            },
        }
    }
}

impl PalConfig {
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.transport.kind == TransportKind::Remote {
            for (field, value) in [
                ("host", self.transport.host.is_some()),
                ("user", self.transport.user.is_some()),
                ("key_path", self.transport.key_path.is_some()),
            ] {
                if !value {
                    bail!("[transport] kind = \"remote\" requires '{}'", field);
                }
            }
        }
        let mut names: Vec<&str> = self.topology.customs.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            bail!("custom position '{}' is declared twice", pair[0]);
        }
        Ok(())
    }

    pub fn topology(&self) -> Topology {
        let mut topology = Topology::new();
        for custom in &self.topology.customs {
            topology = topology.with_custom(custom.name.clone(), custom.capabilities());
        }
        for spec in &self.topology.trays {
            topology = topology.with_tray(spec.tray, spec.slot, spec.kind);
        }
        topology
    }

    pub fn trigger_config(&self) -> TriggerConfig {
        TriggerConfig::default()
            .with_enabled(self.triggers.enabled)
            .with_poll_interval(Duration::from_millis(self.triggers.poll_interval_ms))
            .with_start_timeout(Duration::from_secs(self.triggers.start_timeout_secs))
            .with_continue_timeout(Duration::from_secs(self.triggers.continue_timeout_secs))
            .with_done_timeout(Duration::from_secs(self.triggers.done_timeout_secs))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_method_dir(self.transport.method_dir.clone())
            .with_log_dir(self.transport.log_dir.clone())
            .with_triggers(self.trigger_config())
    }

    pub fn local_transport(&self) -> LocalTransportConfig {
        LocalTransportConfig::new(&self.transport.pal_executable)
    }

    pub fn remote_transport(&self) -> Result<RemoteTransportConfig> {
        let section = &self.transport;
        let (Some(host), Some(user), Some(key_path)) = (&section.host, &section.user, &section.key_path)
        else {
            bail!("remote transport needs host, user and key_path");
        };
        let mut config = RemoteTransportConfig::new(host.clone(), user.clone(), key_path.clone())
            .with_executable(section.pal_executable.clone());
        if let Some(launcher) = &section.launcher {
            config = config.with_launcher(launcher.clone());
        }
        Ok(config)
    }
}
