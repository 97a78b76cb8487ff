//! Identity Resolver: topic tokens to canonical sensor identities.
//!
//! An in-process table in front of the `hubs`/`sensors` tables. Hits are
//! served from memory and return the same `Arc` every time; misses insert the
//! identity durably first and only then cache it. Creation is serialized by
//! the table lock, so two workers racing on a brand-new sensor still end up
//! with one identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::models::{HubIdentity, SensorIdentity};
use crate::store::Store;

// ---

#[derive(Debug, Default)]
struct IdentityTable {
    // ---
    /// hub_id -> sensor_id -> identity
    by_token: HashMap<String, HashMap<String, Arc<SensorIdentity>>>,
    /// Sensors in creation order.
    sensors: Vec<Arc<SensorIdentity>>,
    /// Hubs in creation order.
    hubs: Vec<HubIdentity>,
    hub_ids: HashSet<String>,
}

impl IdentityTable {
    // ---
    fn get(&self, hub: &str, sensor: &str) -> Option<Arc<SensorIdentity>> {
        self.by_token.get(hub)?.get(sensor).cloned()
    }

    fn insert(&mut self, identity: SensorIdentity) -> Arc<SensorIdentity> {
        // ---
        if self.hub_ids.insert(identity.hub_id.clone()) {
            self.hubs.push(HubIdentity {
                hub_id: identity.hub_id.clone(),
            });
        }
        let identity = Arc::new(identity);
        self.by_token
            .entry(identity.hub_id.clone())
            .or_default()
            .insert(identity.sensor_id.clone(), identity.clone());
        self.sensors.push(identity.clone());
        identity
    }
}

#[derive(Debug)]
pub struct IdentityResolver {
    // ---
    store: Store,
    table: Mutex<IdentityTable>,
}

impl IdentityResolver {
    // ---
    /// Build the resolver and rehydrate it from persisted identities.
    pub async fn load(store: Store) -> Result<Self, StorageError> {
        // ---
        let mut table = IdentityTable::default();

        // Hubs first so hubs without sensors keep their creation order too.
        for hub in store.list_hubs().await? {
            if table.hub_ids.insert(hub.hub_id.clone()) {
                table.hubs.push(hub);
            }
        }
        for sensor in store.list_sensors().await? {
            table.insert(sensor);
        }

        tracing::info!(
            hubs = table.hubs.len(),
            sensors = table.sensors.len(),
            "Identity table rehydrated"
        );

        Ok(Self {
            store,
            table: Mutex::new(table),
        })
    }

    /// Resolve `(hub_token, sensor_token)`, creating the identity on first sight.
    pub async fn resolve(
        &self,
        hub_token: &str,
        sensor_token: &str,
    ) -> Result<Arc<SensorIdentity>, StorageError> {
        // ---
        let mut table = self.table.lock().await;
        if let Some(identity) = table.get(hub_token, sensor_token) {
            return Ok(identity);
        }

        let stored = self.store.ensure_identity(hub_token, sensor_token).await?;
        tracing::info!(
            hub_id = %stored.hub_id,
            sensor_id = %stored.sensor_id,
            key = stored.key,
            "New sensor identity"
        );
        Ok(table.insert(stored))
    }

    pub async fn hubs(&self) -> Vec<HubIdentity> {
        self.table.lock().await.hubs.clone()
    }

    pub async fn sensors(&self) -> Vec<Arc<SensorIdentity>> {
        self.table.lock().await.sensors.clone()
    }

    /// Drop and recreate storage, then forget every cached identity.
    ///
    /// Holds the table lock throughout so no identity is created against the
    /// old tables while the reset is in progress.
    pub async fn reset_storage(&self) -> Result<(), StorageError> {
        // ---
        let mut table = self.table.lock().await;
        self.store.reset().await?;
        *table = IdentityTable::default();
        Ok(())
    }
}
