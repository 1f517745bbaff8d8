use std::path::Path;
use std::sync::Arc;

use events::EventBus;
use pal_core::{Position, PositionKey, Sample, TrayCoord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::snapshot::RegistrySnapshot;
use crate::store::SnapshotStore;
use crate::topology::Topology;

/// Shared handle to the position registry.
///
/// Every mutation is applied to a copy of the state, persisted, and only then
/// swapped in, so a failed save leaves memory untouched.
#[derive(Clone)]
pub struct PositionRegistry {
    state: Arc<Mutex<RegistrySnapshot>>,
    store: SnapshotStore,
    topology: Arc<Topology>,
    event_bus: Option<EventBus>,
}

impl PositionRegistry {
    /// Load the snapshot at `path`, falling back to an empty registry built
    /// from `topology` when the file is missing, unreadable or describes a
    /// different layout.
    pub async fn load(path: impl AsRef<Path>, topology: Topology) -> Result<Self> {
        let store = SnapshotStore::new(path);

        let state = match store.load().await? {
            Some(snapshot) => match topology.mismatch(&snapshot) {
                None => {
                    info!(path = %store.path().display(), "Loaded registry snapshot");
                    snapshot
                }
                Some(reason) => {
                    warn!(
                        path = %store.path().display(),
                        reason = %reason,
                        "Registry snapshot does not match declared topology, resetting"
                    );
                    let fresh = topology.empty_snapshot();
                    store.save(&fresh).await?;
                    fresh
                }
            },
            None => {
                info!(path = %store.path().display(), "Initialising empty registry");
                let fresh = topology.empty_snapshot();
                store.save(&fresh).await?;
                fresh
            }
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            store,
            topology: Arc::new(topology),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn snapshot_path(&self) -> &Path {
        self.store.path()
    }

    /// Persist the current state.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.store.save(&state).await
    }

    /// Clone of the whole occupancy map.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.state.lock().await.clone()
    }

    pub async fn query_custom(&self, name: &str) -> Result<Option<Sample>> {
        let state = self.state.lock().await;
        Ok(state.custom_occupant(name)?.cloned())
    }

    pub async fn query_tray(&self, tray: u32, slot: u32, vial: u32) -> Result<Option<Sample>> {
        let state = self.state.lock().await;
        Ok(state.tray_occupant(TrayCoord::new(tray, slot, vial))?.cloned())
    }

    pub async fn position(&self, key: &PositionKey) -> Result<Position> {
        self.state.lock().await.position(key)
    }

    /// Write `sample` (or clear with `None`) into a custom position and
    /// return the previous occupant.
    pub async fn update_custom(&self, name: &str, sample: Option<Sample>) -> Result<Option<Sample>> {
        self.update(&PositionKey::Custom(name.to_string()), sample).await
    }

    pub async fn update_tray(&self, coord: TrayCoord, sample: Option<Sample>) -> Result<Option<Sample>> {
        self.update(&PositionKey::Tray(coord), sample).await
    }

    pub async fn update(&self, key: &PositionKey, sample: Option<Sample>) -> Result<Option<Sample>> {
        let label = sample.as_ref().map(|s| s.describe());
        let previous = self
            .mutate(|state| state.set(key, sample))
            .await?;

        debug!(position = %key, sample = ?label, "Position updated");
        if let Some(bus) = &self.event_bus {
            bus.position_updated(key.to_string(), label);
        }
        Ok(previous)
    }

    pub async fn unload_custom(&self, name: &str) -> Result<Option<Sample>> {
        self.update_custom(name, None).await
    }

    pub async fn unload_all_customs(&self) -> Result<Vec<(String, Sample)>> {
        let removed = self.mutate(|state| Ok(state.clear_customs())).await?;
        info!(count = removed.len(), "Unloaded all custom positions");
        Ok(removed)
    }

    pub async fn unload_tray(&self, tray: u32, slot: u32) -> Result<Vec<(TrayCoord, Sample)>> {
        let removed = self.mutate(|state| state.clear_tray(tray, slot)).await?;
        info!(tray, slot, count = removed.len(), "Unloaded tray");
        Ok(removed)
    }

    pub async fn unload_all_trays(&self) -> Result<Vec<(TrayCoord, Sample)>> {
        let removed = self.mutate(|state| Ok(state.clear_trays())).await?;
        info!(count = removed.len(), "Unloaded all trays");
        Ok(removed)
    }

    /// Discard all occupancy and return to the declared topology.
    pub async fn reset(&self) -> Result<()> {
        let fresh = self.topology.empty_snapshot();
        self.mutate(|state| {
            *state = fresh;
            Ok(())
        })
        .await?;
        warn!("Registry reset to declared topology");
        Ok(())
    }

    /// Reserve the smallest empty vial holding at least `min_volume_ml`.
    pub async fn find_free_vial(&self, min_volume_ml: f64) -> Result<Position> {
        self.find_free_vial_excluding(min_volume_ml, &[]).await
    }

    /// Like [`find_free_vial`](Self::find_free_vial) but never returns one of
    /// `exclude`, for callers planning against occupancy not yet committed.
    pub async fn find_free_vial_excluding(
        &self,
        min_volume_ml: f64,
        exclude: &[TrayCoord],
    ) -> Result<Position> {
        let (coord, tray_kind) = self
            .mutate(|state| {
                let found = state.find_free_vial(min_volume_ml, exclude)?;
                state.set_blocked(found.0, true)?;
                Ok(found)
            })
            .await?;

        debug!(vial = %coord, kind = tray_kind.as_str(), min_volume_ml, "Reserved vial");
        Ok(Position::Tray { coord, tray_kind })
    }

    pub async fn release_vial(&self, coord: TrayCoord) -> Result<()> {
        self.mutate(|state| state.set_blocked(coord, false)).await?;
        debug!(vial = %coord, "Released vial");
        Ok(())
    }

    pub async fn find_next_full_vial_after(&self, coord: TrayCoord) -> Result<Position> {
        let state = self.state.lock().await;
        let (coord, tray_kind) = state.find_next_full_vial_after(coord)?;
        Ok(Position::Tray { coord, tray_kind })
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistrySnapshot) -> Result<T>,
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let value = f(&mut next)?;
        self.store.save(&next).await?;
        *guard = next;
        Ok(value)
    }
}

impl std::fmt::Debug for PositionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionRegistry")
            .field("snapshot_path", &self.store.path())
            .finish()
    }
}
