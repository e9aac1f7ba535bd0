//! Shared relation storage
//!
//! A relation joins two applications. Every unit has its own databag and
//! every application has one more, each a flat string map. A participant can
//! write its own unit bag, and its application bag only while it is leader.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::models::{application_of, DatabagOwner, Relation, RelationId};
use crate::utils::error::{TlsError, TlsResult};

/// Access to the host's relation databags from one participant's viewpoint
pub trait RelationStore {
    /// Name of the unit running this code, e.g. `tls-provider/0`
    fn local_unit(&self) -> &str;

    /// Name of the application running this code
    fn local_app(&self) -> &str;

    /// Whether this unit is the application leader
    fn is_leader(&self) -> bool;

    /// Look up a relation by endpoint name, optionally pinned to an id
    fn get_relation(&self, name: &str, relation_id: Option<RelationId>) -> Option<Relation>;

    /// Every relation established on an endpoint
    fn relations(&self, name: &str) -> Vec<Relation>;

    /// Read a databag
    fn read(
        &self,
        relation_id: RelationId,
        owner: &DatabagOwner,
    ) -> TlsResult<BTreeMap<String, String>>;

    /// Write one key of a databag
    fn write(
        &self,
        relation_id: RelationId,
        owner: &DatabagOwner,
        key: &str,
        value: String,
    ) -> TlsResult<()>;
}

#[derive(Debug, Default)]
struct RelationRecord {
    name: String,
    apps: [String; 2],
    units: BTreeMap<String, BTreeSet<String>>,
    databags: BTreeMap<DatabagOwner, BTreeMap<String, String>>,
}

impl RelationRecord {
    fn involves(&self, app: &str) -> bool {
        self.apps.iter().any(|a| a == app)
    }

    fn remote_app(&self, local_app: &str) -> &str {
        if self.apps[0] == local_app {
            &self.apps[1]
        } else {
            &self.apps[0]
        }
    }
}

#[derive(Debug, Default)]
struct World {
    next_id: RelationId,
    relations: BTreeMap<RelationId, RelationRecord>,
    error_mode: Option<String>,
    unreadable: BTreeSet<DatabagOwner>,
}

/// In-process relation store shared by every participant handle
///
/// Clones and [`InMemoryRelationStore::participant`] handles all see the same
/// relations and databags, so a test can drive a provider and a requirer
/// against one world.
#[derive(Debug, Clone)]
pub struct InMemoryRelationStore {
    world: Arc<RwLock<World>>,
    app: String,
    unit: String,
    leader: bool,
}

impl InMemoryRelationStore {
    /// Create an empty world viewed from `unit`
    pub fn new(unit: impl Into<String>, leader: bool) -> Self {
        let unit = unit.into();
        Self {
            world: Arc::new(RwLock::new(World {
                next_id: 1,
                ..World::default()
            })),
            app: application_of(&unit).to_string(),
            unit,
            leader,
        }
    }

    /// Another participant in the same world
    pub fn participant(&self, unit: impl Into<String>, leader: bool) -> Self {
        let unit = unit.into();
        Self {
            world: Arc::clone(&self.world),
            app: application_of(&unit).to_string(),
            unit,
            leader,
        }
    }

    /// Establish a relation between two applications, returning its id
    pub fn add_relation(&self, name: &str, app_a: &str, app_b: &str) -> RelationId {
        let mut world = self.world_mut();
        let id = world.next_id;
        world.next_id += 1;
        world.relations.insert(
            id,
            RelationRecord {
                name: name.to_string(),
                apps: [app_a.to_string(), app_b.to_string()],
                ..RelationRecord::default()
            },
        );
        debug!(relation_id = id, name, app_a, app_b, "Relation created");
        id
    }

    /// Join a unit to a relation; its application must be part of it
    pub fn add_unit(&self, relation_id: RelationId, unit: &str) -> TlsResult<()> {
        let mut world = self.world_mut();
        let record = world
            .relations
            .get_mut(&relation_id)
            .ok_or_else(|| TlsError::RelationNotFound(format!("id {}", relation_id)))?;
        let app = application_of(unit);
        if !record.involves(app) {
            return Err(TlsError::Store(format!(
                "Application {} is not part of relation {}",
                app, relation_id
            )));
        }
        record
            .units
            .entry(app.to_string())
            .or_default()
            .insert(unit.to_string());
        Ok(())
    }

    /// Remove a unit and its databag from a relation
    pub fn remove_unit(&self, relation_id: RelationId, unit: &str) {
        let mut world = self.world_mut();
        if let Some(record) = world.relations.get_mut(&relation_id) {
            if let Some(units) = record.units.get_mut(application_of(unit)) {
                units.remove(unit);
            }
            record.databags.remove(&DatabagOwner::Unit(unit.to_string()));
        }
    }

    /// Tear a relation down entirely
    pub fn remove_relation(&self, relation_id: RelationId) {
        self.world_mut().relations.remove(&relation_id);
    }

    /// Set a databag key without enforcing write permissions
    pub fn set_databag_value(
        &self,
        relation_id: RelationId,
        owner: &DatabagOwner,
        key: &str,
        value: impl Into<String>,
    ) -> TlsResult<()> {
        let mut world = self.world_mut();
        let record = world
            .relations
            .get_mut(&relation_id)
            .ok_or_else(|| TlsError::RelationNotFound(format!("id {}", relation_id)))?;
        record
            .databags
            .entry(owner.clone())
            .or_default()
            .insert(key.to_string(), value.into());
        Ok(())
    }

    /// Snapshot of a databag without enforcing read permissions
    pub fn databag(&self, relation_id: RelationId, owner: &DatabagOwner) -> BTreeMap<String, String> {
        self.world()
            .relations
            .get(&relation_id)
            .and_then(|record| record.databags.get(owner))
            .cloned()
            .unwrap_or_default()
    }

    /// Make every read and write fail with a store error until cleared
    pub fn set_error_mode(&self, message: Option<String>) {
        self.world_mut().error_mode = message;
    }

    /// Make reads of one databag fail while every other bag stays readable
    pub fn set_unreadable(&self, owner: &DatabagOwner, unreadable: bool) {
        let mut world = self.world_mut();
        if unreadable {
            world.unreadable.insert(owner.clone());
        } else {
            world.unreadable.remove(owner);
        }
    }

    fn world(&self) -> std::sync::RwLockReadGuard<'_, World> {
        self.world.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn world_mut(&self) -> std::sync::RwLockWriteGuard<'_, World> {
        self.world.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn view(&self, id: RelationId, record: &RelationRecord) -> Relation {
        let remote = record.remote_app(&self.app);
        Relation {
            id,
            name: record.name.clone(),
            app: Some(remote.to_string()),
            units: record
                .units
                .get(remote)
                .map(|units| units.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn check_error(world: &World) -> TlsResult<()> {
        match &world.error_mode {
            Some(message) => Err(TlsError::Store(message.clone())),
            None => Ok(()),
        }
    }
}

impl RelationStore for InMemoryRelationStore {
    fn local_unit(&self) -> &str {
        &self.unit
    }

    fn local_app(&self) -> &str {
        &self.app
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    fn get_relation(&self, name: &str, relation_id: Option<RelationId>) -> Option<Relation> {
        let world = self.world();
        world
            .relations
            .iter()
            .filter(|(id, record)| {
                record.name == name
                    && record.involves(&self.app)
                    && relation_id.map_or(true, |wanted| wanted == **id)
            })
            .map(|(id, record)| self.view(*id, record))
            .next()
    }

    fn relations(&self, name: &str) -> Vec<Relation> {
        let world = self.world();
        world
            .relations
            .iter()
            .filter(|(_, record)| record.name == name && record.involves(&self.app))
            .map(|(id, record)| self.view(*id, record))
            .collect()
    }

    fn read(
        &self,
        relation_id: RelationId,
        owner: &DatabagOwner,
    ) -> TlsResult<BTreeMap<String, String>> {
        let world = self.world();
        Self::check_error(&world)?;
        if world.unreadable.contains(owner) {
            return Err(TlsError::Store(format!("{} could not be read", owner)));
        }
        let record = world
            .relations
            .get(&relation_id)
            .ok_or_else(|| TlsError::RelationNotFound(format!("id {}", relation_id)))?;

        if let DatabagOwner::App(app) = owner {
            if *app == self.app && !self.leader {
                return Err(TlsError::PermissionDenied(format!(
                    "{} is not leader and cannot read {}",
                    self.unit, owner
                )));
            }
        }

        Ok(record.databags.get(owner).cloned().unwrap_or_default())
    }

    fn write(
        &self,
        relation_id: RelationId,
        owner: &DatabagOwner,
        key: &str,
        value: String,
    ) -> TlsResult<()> {
        let allowed = match owner {
            DatabagOwner::Unit(unit) => *unit == self.unit,
            DatabagOwner::App(app) => *app == self.app && self.leader,
        };
        if !allowed {
            return Err(TlsError::PermissionDenied(format!(
                "{} cannot write {}",
                self.unit, owner
            )));
        }

        let mut world = self.world_mut();
        Self::check_error(&world)?;
        let record = world
            .relations
            .get_mut(&relation_id)
            .ok_or_else(|| TlsError::RelationNotFound(format!("id {}", relation_id)))?;
        record
            .databags
            .entry(owner.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }
}
