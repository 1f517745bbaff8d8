use std::collections::BTreeMap;

use pal_core::{CustomCapabilities, CustomPosition, Position, PositionKey, Sample, TrayCoord, TrayKind};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomState {
    pub capabilities: CustomCapabilities,
    pub sample: Option<Sample>,
}

impl CustomState {
    pub fn empty(capabilities: CustomCapabilities) -> Self {
        Self {
            capabilities,
            sample: None,
        }
    }
}

/// Occupancy of one tray; index 0 holds vial 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrayState {
    pub kind: TrayKind,
    pub vials: Vec<Option<Sample>>,
    /// Vials reserved by the planner but not yet filled.
    pub blocked: Vec<bool>,
}

impl TrayState {
    pub fn empty(kind: TrayKind) -> Self {
        let count = kind.vial_count() as usize;
        Self {
            kind,
            vials: vec![None; count],
            blocked: vec![false; count],
        }
    }

    pub fn is_well_formed(&self) -> bool {
        let count = self.kind.vial_count() as usize;
        self.vials.len() == count && self.blocked.len() == count
    }

    fn index(&self, vial: u32) -> Option<usize> {
        if vial == 0 || vial > self.kind.vial_count() {
            return None;
        }
        Some((vial - 1) as usize)
    }
}

/// The whole occupancy map, as persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistrySnapshot {
    pub customs: BTreeMap<String, CustomState>,
    pub trays: BTreeMap<u32, BTreeMap<u32, TrayState>>,
}

impl RegistrySnapshot {
    fn tray_state(&self, coord: TrayCoord) -> Result<(&TrayState, usize)> {
        let state = self
            .trays
            .get(&coord.tray)
            .and_then(|slots| slots.get(&coord.slot))
            .ok_or(RegistryError::InvalidCoordinate(coord))?;
        let index = state
            .index(coord.vial)
            .ok_or(RegistryError::InvalidCoordinate(coord))?;
        Ok((state, index))
    }

    fn tray_state_mut(&mut self, coord: TrayCoord) -> Result<(&mut TrayState, usize)> {
        let state = self
            .trays
            .get_mut(&coord.tray)
            .and_then(|slots| slots.get_mut(&coord.slot))
            .ok_or(RegistryError::InvalidCoordinate(coord))?;
        let index = state
            .index(coord.vial)
            .ok_or(RegistryError::InvalidCoordinate(coord))?;
        Ok((state, index))
    }

    pub fn custom(&self, name: &str) -> Result<&CustomState> {
        self.customs
            .get(name)
            .ok_or_else(|| RegistryError::UnknownCustom(name.to_string()))
    }

    pub fn custom_occupant(&self, name: &str) -> Result<Option<&Sample>> {
        Ok(self.custom(name)?.sample.as_ref())
    }

    pub fn tray_occupant(&self, coord: TrayCoord) -> Result<Option<&Sample>> {
        let (state, index) = self.tray_state(coord)?;
        Ok(state.vials[index].as_ref())
    }

    pub fn is_blocked(&self, coord: TrayCoord) -> Result<bool> {
        let (state, index) = self.tray_state(coord)?;
        Ok(state.blocked[index])
    }

    pub fn occupant(&self, key: &PositionKey) -> Result<Option<&Sample>> {
        match key {
            PositionKey::Custom(name) => self.custom_occupant(name),
            PositionKey::Tray(coord) => self.tray_occupant(*coord),
        }
    }

    /// The concrete position behind a key, with its capabilities or tray model.
    pub fn position(&self, key: &PositionKey) -> Result<Position> {
        match key {
            PositionKey::Custom(name) => {
                let state = self.custom(name)?;
                Ok(Position::Custom(CustomPosition::new(
                    name.clone(),
                    state.capabilities,
                )))
            }
            PositionKey::Tray(coord) => {
                let (state, _) = self.tray_state(*coord)?;
                Ok(Position::Tray {
                    coord: *coord,
                    tray_kind: state.kind,
                })
            }
        }
    }

    /// Write an occupant into a position and return the previous one.
    /// Filling a vial clears its reservation.
    pub fn set(&mut self, key: &PositionKey, sample: Option<Sample>) -> Result<Option<Sample>> {
        match key {
            PositionKey::Custom(name) => {
                let state = self
                    .customs
                    .get_mut(name)
                    .ok_or_else(|| RegistryError::UnknownCustom(name.clone()))?;
                Ok(std::mem::replace(&mut state.sample, sample))
            }
            PositionKey::Tray(coord) => {
                let (state, index) = self.tray_state_mut(*coord)?;
                if sample.is_some() {
                    state.blocked[index] = false;
                }
                Ok(std::mem::replace(&mut state.vials[index], sample))
            }
        }
    }

    pub fn set_blocked(&mut self, coord: TrayCoord, blocked: bool) -> Result<()> {
        let (state, index) = self.tray_state_mut(coord)?;
        state.blocked[index] = blocked;
        Ok(())
    }

    /// All vial coordinates in scan order: tray, then slot, then vial.
    pub fn vials(&self) -> impl Iterator<Item = (TrayCoord, &TrayState, usize)> + '_ {
        self.trays.iter().flat_map(|(tray, slots)| {
            slots.iter().flat_map(move |(slot, state)| {
                (0..state.vials.len())
                    .map(move |index| (TrayCoord::new(*tray, *slot, index as u32 + 1), state, index))
            })
        })
    }

    /// Smallest-capacity empty, unreserved vial that holds `min_volume_ml`,
    /// skipping any coordinate in `exclude`.
    pub fn find_free_vial(&self, min_volume_ml: f64, exclude: &[TrayCoord]) -> Result<(TrayCoord, TrayKind)> {
        if !min_volume_ml.is_finite() || min_volume_ml < 0.0 {
            return Err(RegistryError::InvalidVolume(min_volume_ml));
        }

        let mut best: Option<(TrayCoord, TrayKind)> = None;
        for (coord, state, index) in self.vials() {
            if state.vials[index].is_some() || state.blocked[index] || exclude.contains(&coord) {
                continue;
            }
            let capacity = state.kind.max_volume_ml();
            if capacity < min_volume_ml {
                continue;
            }
            let better = match best {
                Some((_, kind)) => capacity < kind.max_volume_ml(),
                None => true,
            };
            if better {
                best = Some((coord, state.kind));
            }
        }

        best.ok_or(RegistryError::NoFreeVial { min_volume_ml })
    }

    /// First occupied vial strictly after `after` in scan order. `after` must
    /// name a mounted tray slot; vial 0 starts the scan at the slot's first vial.
    pub fn find_next_full_vial_after(&self, after: TrayCoord) -> Result<(TrayCoord, TrayKind)> {
        let state = self
            .trays
            .get(&after.tray)
            .and_then(|slots| slots.get(&after.slot))
            .ok_or(RegistryError::InvalidCoordinate(after))?;
        if after.vial > state.kind.vial_count() {
            return Err(RegistryError::InvalidCoordinate(after));
        }

        self.vials()
            .find(|(coord, state, index)| *coord > after && state.vials[*index].is_some())
            .map(|(coord, state, _)| (coord, state.kind))
            .ok_or(RegistryError::NoFullVial(after))
    }

    pub fn clear_customs(&mut self) -> Vec<(String, Sample)> {
        self.customs
            .iter_mut()
            .filter_map(|(name, state)| state.sample.take().map(|s| (name.clone(), s)))
            .collect()
    }

    /// Empty one tray slot, dropping its reservations.
    pub fn clear_tray(&mut self, tray: u32, slot: u32) -> Result<Vec<(TrayCoord, Sample)>> {
        let state = self
            .trays
            .get_mut(&tray)
            .and_then(|slots| slots.get_mut(&slot))
            .ok_or(RegistryError::InvalidCoordinate(TrayCoord::new(tray, slot, 0)))?;
        Ok(clear_tray_state(tray, slot, state))
    }

    pub fn clear_trays(&mut self) -> Vec<(TrayCoord, Sample)> {
        let mut removed = Vec::new();
        for (tray, slots) in self.trays.iter_mut() {
            for (slot, state) in slots.iter_mut() {
                removed.extend(clear_tray_state(*tray, *slot, state));
            }
        }
        removed
    }
}

fn clear_tray_state(tray: u32, slot: u32, state: &mut TrayState) -> Vec<(TrayCoord, Sample)> {
    state.blocked.iter_mut().for_each(|b| *b = false);
    state
        .vials
        .iter_mut()
        .enumerate()
        .filter_map(|(index, vial)| {
            vial.take()
                .map(|s| (TrayCoord::new(tray, slot, index as u32 + 1), s))
        })
        .collect()
}
