/// Engine configuration, read from the environment at startup.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Capability groups gating which tools the daemon registers. The set is
/// built once at startup and never changes for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Core,
    TaskPool,
    Messaging,
    Profiles,
    Services,
    Scheduling,
    Epics,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Core,
        Capability::TaskPool,
        Capability::Messaging,
        Capability::Profiles,
        Capability::Services,
        Capability::Scheduling,
        Capability::Epics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Core => "core",
            Capability::TaskPool => "task-pool",
            Capability::Messaging => "messaging",
            Capability::Profiles => "profiles",
            Capability::Services => "services",
            Capability::Scheduling => "scheduling",
            Capability::Epics => "epics",
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(Capability::Core),
            "task-pool" => Ok(Capability::TaskPool),
            "messaging" => Ok(Capability::Messaging),
            "profiles" => Ok(Capability::Profiles),
            "services" => Ok(Capability::Services),
            "scheduling" => Ok(Capability::Scheduling),
            "epics" => Ok(Capability::Epics),
            _ => Err(format!("Unknown capability: {}", s)),
        }
    }
}

/// Immutable capability set for the process lifetime.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    enabled: HashSet<Capability>,
}

impl CapabilitySet {
    pub fn all() -> Self {
        Self {
            enabled: Capability::ALL.into_iter().collect(),
        }
    }

    /// Parse a comma-separated config value. Empty input enables
    /// everything; unknown names are skipped with a warning.
    pub fn parse(value: &str) -> Self {
        if value.trim().is_empty() {
            return Self::all();
        }
        let mut enabled = HashSet::new();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.parse::<Capability>() {
                Ok(capability) => {
                    enabled.insert(capability);
                }
                Err(_) => tracing::warn!(capability = part, "ignoring unknown capability"),
            }
        }
        if enabled.is_empty() {
            return Self::all();
        }
        // Core tools are always available; nothing works without identity.
        enabled.insert(Capability::Core);
        Self { enabled }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.enabled.iter().copied()
    }
}

/// Process configuration. `DATABASE_PATH` locates the store,
/// `CAPABILITIES` selects the enabled tool groups.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub capabilities: CapabilitySet,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let database_path = std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("swarm.db"));
        let capabilities = std::env::var("CAPABILITIES")
            .map(|v| CapabilitySet::parse(&v))
            .unwrap_or_else(|_| CapabilitySet::all());
        Self {
            database_path,
            capabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_value_enables_everything() {
        let set = CapabilitySet::parse("");
        for capability in Capability::ALL {
            assert!(set.contains(capability));
        }
    }

    #[test]
    fn explicit_list_narrows_the_set() {
        let set = CapabilitySet::parse("messaging, scheduling");
        assert!(set.contains(Capability::Messaging));
        assert!(set.contains(Capability::Scheduling));
        assert!(!set.contains(Capability::Services));
        assert!(!set.contains(Capability::Epics));
        // Core is implied.
        assert!(set.contains(Capability::Core));
    }

    #[test]
    fn unknown_names_are_skipped() {
        let set = CapabilitySet::parse("messaging,warp-drive");
        assert!(set.contains(Capability::Messaging));
        assert!(!set.contains(Capability::TaskPool));
    }

    #[test]
    fn capability_names_round_trip() {
        for capability in Capability::ALL {
            let parsed: Capability = capability.as_str().parse().unwrap();
            assert_eq!(parsed, capability);
        }
    }
}
