use pal_core::{CustomCapabilities, CustomPosition, TrayKind};
use serde::{Deserialize, Serialize};

use crate::snapshot::{CustomState, RegistrySnapshot, TrayState};

/// A tray model mounted in one slot of a tray holder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraySpec {
    pub tray: u32,
    pub slot: u32,
    pub kind: TrayKind,
}

impl TraySpec {
    pub fn new(tray: u32, slot: u32, kind: TrayKind) -> Self {
        Self { tray, slot, kind }
    }
}

/// The physical layout declared at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Topology {
    #[serde(default)]
    pub customs: Vec<CustomPosition>,
    #[serde(default)]
    pub trays: Vec<TraySpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_custom(mut self, name: impl Into<String>, capabilities: CustomCapabilities) -> Self {
        self.customs.push(CustomPosition::new(name, capabilities));
        self
    }

    pub fn with_tray(mut self, tray: u32, slot: u32, kind: TrayKind) -> Self {
        self.trays.push(TraySpec::new(tray, slot, kind));
        self
    }

    /// Registry state with every declared position empty.
    pub fn empty_snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();
        for custom in &self.customs {
            snapshot
                .customs
                .insert(custom.name.clone(), CustomState::empty(custom.capabilities));
        }
        for spec in &self.trays {
            snapshot
                .trays
                .entry(spec.tray)
                .or_default()
                .insert(spec.slot, TrayState::empty(spec.kind));
        }
        snapshot
    }

    /// Describe the first difference between this layout and a persisted
    /// snapshot, or `None` when they agree.
    pub fn mismatch(&self, snapshot: &RegistrySnapshot) -> Option<String> {
        let declared = self.empty_snapshot();

        let declared_names: Vec<&String> = declared.customs.keys().collect();
        let persisted_names: Vec<&String> = snapshot.customs.keys().collect();
        if declared_names != persisted_names {
            return Some(format!(
                "custom positions differ: declared {:?}, persisted {:?}",
                declared_names, persisted_names
            ));
        }
        for (name, state) in &declared.customs {
            if let Some(persisted) = snapshot.customs.get(name) {
                if persisted.capabilities != state.capabilities {
                    return Some(format!("capabilities of custom '{}' differ", name));
                }
            }
        }

        let declared_trays: Vec<&u32> = declared.trays.keys().collect();
        let persisted_trays: Vec<&u32> = snapshot.trays.keys().collect();
        if declared_trays != persisted_trays {
            return Some(format!(
                "trays differ: declared {:?}, persisted {:?}",
                declared_trays, persisted_trays
            ));
        }
        for (tray, slots) in &declared.trays {
            let Some(persisted_slots) = snapshot.trays.get(tray) else {
                continue;
            };
            let declared_slots: Vec<&u32> = slots.keys().collect();
            let persisted_ids: Vec<&u32> = persisted_slots.keys().collect();
            if declared_slots != persisted_ids {
                return Some(format!(
                    "slots of tray {} differ: declared {:?}, persisted {:?}",
                    tray, declared_slots, persisted_ids
                ));
            }
            for (slot, state) in slots {
                let Some(persisted) = persisted_slots.get(slot) else {
                    continue;
                };
                if persisted.kind != state.kind {
                    return Some(format!(
                        "tray {} slot {} is {} but {} was declared",
                        tray,
                        slot,
                        persisted.kind.as_str(),
                        state.kind.as_str()
                    ));
                }
                if !persisted.is_well_formed() {
                    return Some(format!(
                        "tray {} slot {} has a malformed vial table",
                        tray, slot
                    ));
                }
            }
        }

        None
    }
}
