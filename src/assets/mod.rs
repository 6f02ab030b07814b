//! Org-scoped, read-mostly configuration. Handlers get an `Arc<OrgAssets>` snapshot and
//! keep it for the whole operation; refreshes build a new snapshot and never touch the
//! one already handed out.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaigns::{Campaign, CampaignEvent};
use crate::error::CoreResult;
use crate::triggers::Trigger;

mod loader;
mod types;

pub use loader::PgAssetLoader;
pub use types::{Channel, ChannelRole, Flow, Group, Org, Template, TemplateStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Org,
    Channels,
    Groups,
    Flows,
    Triggers,
    Campaigns,
    Templates,
    Globals,
}

impl AssetKind {
    pub const ALL: [AssetKind; 8] = [
        AssetKind::Org,
        AssetKind::Channels,
        AssetKind::Groups,
        AssetKind::Flows,
        AssetKind::Triggers,
        AssetKind::Campaigns,
        AssetKind::Templates,
        AssetKind::Globals,
    ];
}

/// Source of truth the cache loads from.
pub trait AssetLoader: Send + Sync {
    fn load_org(&self, org_id: Uuid) -> CoreResult<Org>;
    fn load_channels(&self, org_id: Uuid) -> CoreResult<Vec<Channel>>;
    fn load_groups(&self, org_id: Uuid) -> CoreResult<Vec<Group>>;
    fn load_flows(&self, org_id: Uuid) -> CoreResult<Vec<Flow>>;
    fn load_triggers(&self, org_id: Uuid) -> CoreResult<Vec<Trigger>>;
    fn load_campaigns(&self, org_id: Uuid) -> CoreResult<Vec<Campaign>>;
    fn load_templates(&self, org_id: Uuid) -> CoreResult<Vec<Template>>;
    fn load_globals(&self, org_id: Uuid) -> CoreResult<HashMap<String, String>>;

    /// Runs `load` against a view of the source that doesn't change between its loads.
    fn consistent(
        &self,
        load: &mut dyn FnMut(&dyn AssetLoader) -> CoreResult<OrgAssets>,
    ) -> CoreResult<OrgAssets>;
}

#[derive(Debug, Clone)]
pub struct OrgAssets {
    org: Arc<Org>,
    channels: Arc<Vec<Channel>>,
    groups: Arc<Vec<Group>>,
    flows: Arc<Vec<Flow>>,
    triggers: Arc<Vec<Trigger>>,
    campaigns: Arc<Vec<Campaign>>,
    templates: Arc<Vec<Template>>,
    globals: Arc<HashMap<String, String>>,
    versions: BTreeMap<AssetKind, u64>,
    loaded_on: DateTime<Utc>,
}

impl OrgAssets {
    /// An empty snapshot for `org`, mostly useful for building fixtures.
    pub fn new(org: Org) -> Self {
        Self {
            org: Arc::new(org),
            channels: Arc::default(),
            groups: Arc::default(),
            flows: Arc::default(),
            triggers: Arc::default(),
            campaigns: Arc::default(),
            templates: Arc::default(),
            globals: Arc::default(),
            versions: AssetKind::ALL.iter().map(|kind| (*kind, 1)).collect(),
            loaded_on: Utc::now(),
        }
    }

    pub fn load(loader: &dyn AssetLoader, org_id: Uuid) -> CoreResult<Self> {
        loader.consistent(&mut |view| {
            let mut assets = Self::new(view.load_org(org_id)?);
            for kind in AssetKind::ALL.iter().skip(1) {
                assets.reload(view, *kind)?;
            }
            Ok(assets)
        })
    }

    /// Copy-on-refresh: a new snapshot sharing every kind not named in `kinds`.
    pub fn refreshed(&self, loader: &dyn AssetLoader, kinds: &[AssetKind]) -> CoreResult<Self> {
        loader.consistent(&mut |view| {
            let mut next = self.clone();
            for kind in kinds {
                next.reload(view, *kind)?;
                *next.versions.entry(*kind).or_insert(0) += 1;
            }
            next.loaded_on = Utc::now();
            Ok(next)
        })
    }

    fn reload(&mut self, loader: &dyn AssetLoader, kind: AssetKind) -> CoreResult<()> {
        let org_id = self.org.id;
        match kind {
            AssetKind::Org => self.org = Arc::new(loader.load_org(org_id)?),
            AssetKind::Channels => self.channels = Arc::new(loader.load_channels(org_id)?),
            AssetKind::Groups => self.groups = Arc::new(loader.load_groups(org_id)?),
            AssetKind::Flows => self.flows = Arc::new(loader.load_flows(org_id)?),
            AssetKind::Triggers => self.triggers = Arc::new(loader.load_triggers(org_id)?),
            AssetKind::Campaigns => self.campaigns = Arc::new(loader.load_campaigns(org_id)?),
            AssetKind::Templates => self.templates = Arc::new(loader.load_templates(org_id)?),
            AssetKind::Globals => self.globals = Arc::new(loader.load_globals(org_id)?),
        }
        Ok(())
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = Arc::new(channels);
        self
    }

    pub fn with_groups(mut self, groups: Vec<Group>) -> Self {
        self.groups = Arc::new(groups);
        self
    }

    pub fn with_flows(mut self, flows: Vec<Flow>) -> Self {
        self.flows = Arc::new(flows);
        self
    }

    pub fn with_triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.triggers = Arc::new(triggers);
        self
    }

    pub fn with_campaigns(mut self, campaigns: Vec<Campaign>) -> Self {
        self.campaigns = Arc::new(campaigns);
        self
    }

    pub fn with_templates(mut self, templates: Vec<Template>) -> Self {
        self.templates = Arc::new(templates);
        self
    }

    pub fn with_globals(mut self, globals: HashMap<String, String>) -> Self {
        self.globals = Arc::new(globals);
        self
    }

    pub fn org(&self) -> &Org {
        &self.org
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: Uuid) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id == id)
    }

    /// The channel a message to a URN of `scheme` should go out on: the URN's own
    /// channel affinity if that channel can still send to it, else the first channel
    /// that can.
    pub fn sendable_channel(&self, scheme: &str, affinity: Option<Uuid>) -> Option<&Channel> {
        affinity
            .and_then(|id| self.channel(id))
            .filter(|channel| channel.can_send_to(scheme))
            .or_else(|| self.channels.iter().find(|channel| channel.can_send_to(scheme)))
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: Uuid) -> Option<&Group> {
        self.groups.iter().find(|group| group.id == id)
    }

    pub fn flow(&self, id: Uuid) -> Option<&Flow> {
        self.flows.iter().find(|flow| flow.id == id)
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn campaigns(&self) -> &[Campaign] {
        &self.campaigns
    }

    pub fn campaign_event(&self, event_id: Uuid) -> Option<(&Campaign, &CampaignEvent)> {
        self.campaigns.iter().find_map(|campaign| {
            campaign
                .events
                .iter()
                .find(|event| event.id == event_id)
                .map(|event| (campaign, event))
        })
    }

    pub fn template(&self, name: &str, channel_id: Uuid, language: &str) -> Option<&Template> {
        self.templates.iter().find(|template| {
            template.name == name && template.channel_id == channel_id && template.language == language
        })
    }

    pub fn globals(&self) -> &HashMap<String, String> {
        &self.globals
    }

    pub fn version(&self, kind: AssetKind) -> u64 {
        self.versions.get(&kind).copied().unwrap_or(0)
    }

    pub fn loaded_on(&self) -> DateTime<Utc> {
        self.loaded_on
    }
}

/// Process-local cache of org snapshots with a time-to-live per org. Loads and
/// refreshes of one org are serialized so none of them overwrites another's reload.
#[derive(Clone)]
pub struct AssetCache {
    cache: Cache<Uuid, Arc<OrgAssets>>,
    loader: Arc<dyn AssetLoader>,
    org_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl AssetCache {
    pub fn new(loader: Arc<dyn AssetLoader>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self {
            cache,
            loader,
            org_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, org_id: Uuid) -> CoreResult<Arc<OrgAssets>> {
        if let Some(assets) = self.cache.get(&org_id) {
            return Ok(assets);
        }

        let lock = self.org_lock(org_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.cache.get(&org_id) {
            Some(assets) => Ok(assets),
            None => self.load_locked(org_id),
        }
    }

    /// Reloads only `kinds` for the org and swaps the new snapshot in. Readers holding
    /// the previous snapshot keep using it untouched.
    pub fn refresh(&self, org_id: Uuid, kinds: &[AssetKind]) -> CoreResult<Arc<OrgAssets>> {
        let lock = self.org_lock(org_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = self.cache.get(&org_id) else {
            return self.load_locked(org_id);
        };

        let next = Arc::new(current.refreshed(self.loader.as_ref(), kinds)?);
        tracing::debug!(%org_id, ?kinds, "refreshed org assets");
        self.cache.insert(org_id, next.clone());
        Ok(next)
    }

    fn org_lock(&self, org_id: Uuid) -> Arc<Mutex<()>> {
        self.org_locks.entry(org_id).or_default().clone()
    }

    /// Caller holds the org's lock.
    fn load_locked(&self, org_id: Uuid) -> CoreResult<Arc<OrgAssets>> {
        let assets = Arc::new(OrgAssets::load(self.loader.as_ref(), org_id)?);
        tracing::debug!(%org_id, "loaded org assets");
        self.cache.insert(org_id, assets.clone());
        Ok(assets)
    }

    pub fn insert(&self, assets: OrgAssets) -> Arc<OrgAssets> {
        let assets = Arc::new(assets);
        self.cache.insert(assets.org().id, assets.clone());
        assets
    }

    pub fn invalidate(&self, org_id: Uuid) {
        self.cache.invalidate(&org_id);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn org(timezone: chrono_tz::Tz) -> Org {
        Org {
            id: Uuid::new_v4(),
            name: "Nyaruka".to_string(),
            is_suspended: false,
            uses_topups: false,
            default_language: Some("eng".to_string()),
            allowed_languages: vec!["eng".to_string(), "spa".to_string(), "fra".to_string()],
            timezone,
        }
    }

    pub fn channel(org_id: Uuid, scheme: &str, roles: &[ChannelRole]) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            org_id,
            name: format!("{scheme} channel"),
            channel_type: "T".to_string(),
            address: None,
            schemes: vec![scheme.to_string()],
            roles: roles.to_vec(),
            config: serde_json::json!({}),
        }
    }
}
