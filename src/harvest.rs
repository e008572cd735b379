use std::time::Duration;

use serde::Serialize;

use crate::auth::{AuthService, LocalAuthService};
use crate::catalog::{
    Catalog, ExperimentParameter, ExperimentRecord, JsonCatalog, LocalUser, NewExperiment,
};
use crate::config::{HarvestConfig, PlaceholderPolicy, normalize_source};
use crate::dedup::{Claim, DuplicateGuard, lock_key};
use crate::document::{DocumentParser, XmlDocumentParser};
use crate::domain::{ExperimentId, FeedIdentity, PublicAccess, RecordDescriptor, RemoteId};
use crate::error::HarvestError;
use crate::fetcher::{HttpFetcher, RemoteFetcher};
use crate::lock::{FileLockCache, LockCache};
use crate::oaipmh::{FeedClient, verify_origin};
use crate::producer::Producer;
use crate::registration::Registrar;
use crate::store::Store;
use crate::users::UserResolver;

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub source: String,
    pub ingested: Vec<ExperimentId>,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRecord {
    pub identifier: RemoteId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    Duplicate { existing: ExperimentId },
    LockBusy,
    KeyUnavailable,
    UnresolvedUser { detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub experiments: Vec<ExperimentRecord>,
}

enum Outcome {
    Ingested(ExperimentId),
    Skipped(SkipReason),
}

pub type DefaultHarvester =
    Harvester<HttpFetcher, JsonCatalog, FileLockCache, XmlDocumentParser, LocalAuthService>;

pub struct Harvester<F, C, L, P, A> {
    config: HarvestConfig,
    store: Store,
    fetcher: F,
    catalog: C,
    locks: L,
    parser: P,
    auth: A,
}

impl DefaultHarvester {
    pub fn from_config(config: HarvestConfig) -> Result<Self, HarvestError> {
        let store = Store::new(config.storage_root.clone());
        store.ensure_root()?;
        let fetcher = HttpFetcher::new(Duration::from_secs(config.http_timeout_secs))?;
        let catalog = JsonCatalog::open(&store)?;
        let locks = FileLockCache::new(store.lock_dir());
        let parser = XmlDocumentParser::new(store.clone());
        Ok(Harvester::new(
            config,
            store,
            fetcher,
            catalog,
            locks,
            parser,
            LocalAuthService::default(),
        ))
    }
}

impl<F, C, L, P, A> Harvester<F, C, L, P, A>
where
    F: RemoteFetcher,
    C: Catalog,
    L: LockCache,
    P: DocumentParser,
    A: AuthService,
{
    pub fn new(
        config: HarvestConfig,
        store: Store,
        fetcher: F,
        catalog: C,
        locks: L,
        parser: P,
        auth: A,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            catalog,
            locks,
            parser,
            auth,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn identify(&self, source: &str) -> Result<FeedIdentity, HarvestError> {
        let source = normalize_source(source)?;
        let identity = FeedClient::new(&self.fetcher, &source).identify()?;
        verify_origin(&identity, &source)?;
        Ok(identity)
    }

    pub fn list(&self) -> Result<ListResult, HarvestError> {
        Ok(ListResult {
            experiments: self.catalog.list_experiments()?,
        })
    }

    pub fn transfer_experiments(&self, source: &str) -> Result<Vec<ExperimentId>, HarvestError> {
        self.harvest(source).map(|summary| summary.ingested)
    }

    pub fn harvest(&self, source: &str) -> Result<HarvestSummary, HarvestError> {
        let source = normalize_source(source)?;
        self.store.ensure_root()?;

        let feed = FeedClient::new(&self.fetcher, &source);
        let identity = feed.identify()?;
        verify_origin(&identity, &source)?;
        let records = feed.list_public_records()?;
        tracing::info!(source = %source, records = records.len(), "harvesting feed");

        let mut summary = HarvestSummary {
            source: source.clone(),
            ingested: Vec::new(),
            skipped: Vec::new(),
        };
        for record in records {
            match self.ingest_record(&source, &record) {
                Ok(Outcome::Ingested(id)) => summary.ingested.push(id),
                Ok(Outcome::Skipped(reason)) => {
                    tracing::warn!(remote_id = %record.identifier, ?reason, "record skipped");
                    summary.skipped.push(SkippedRecord {
                        identifier: record.identifier,
                        reason,
                    });
                }
                Err(err) => {
                    tracing::error!(
                        remote_id = %record.identifier,
                        ingested = ?summary.ingested,
                        error = %err,
                        "harvest aborted"
                    );
                    return Err(err);
                }
            }
        }

        tracing::info!(
            source = %source,
            ingested = summary.ingested.len(),
            skipped = summary.skipped.len(),
            "harvest finished"
        );
        Ok(summary)
    }

    fn ingest_record(
        &self,
        source: &str,
        record: &RecordDescriptor,
    ) -> Result<Outcome, HarvestError> {
        let remote_id = &record.identifier;
        let producer = Producer::new(&self.fetcher, source);
        let users = UserResolver::new(&self.fetcher, &self.catalog);

        let creator = match users.resolve_user(source, &record.creator) {
            Ok(user) => user,
            Err(HarvestError::RemoteUserRead(detail)) => {
                return Ok(Outcome::Skipped(SkipReason::UnresolvedUser { detail }));
            }
            Err(err) => return Err(err),
        };
        tracing::debug!(%remote_id, creator = %creator.username, "creator resolved");

        let code = producer.experiment_state(remote_id)?;
        let access = PublicAccess::from_code(code)
            .filter(|access| access.is_harvestable())
            .ok_or_else(|| {
                HarvestError::bad_access(format!(
                    "experiment {remote_id} has public access {code}"
                ))
            })?;

        let mut owners = Vec::new();
        for entry in producer.acls(remote_id)? {
            if !entry.is_local_owner() {
                tracing::warn!(
                    %remote_id,
                    plugin = %entry.plugin_id,
                    entity = %entry.entity_id,
                    "ignoring ACL entry"
                );
                continue;
            }
            let owner_id: RemoteId = entry.entity_id.parse()?;
            match users.resolve_user(source, &owner_id) {
                Ok(owner) => owners.push(owner.username),
                Err(HarvestError::RemoteUserRead(detail)) => {
                    return Ok(Outcome::Skipped(SkipReason::UnresolvedUser { detail }));
                }
                Err(err) => return Err(err),
            }
        }

        let document = producer.mets_document(remote_id, self.config.force_http_urls)?;

        let Some(key) = producer.experiment_key(remote_id)? else {
            return Ok(Outcome::Skipped(SkipReason::KeyUnavailable));
        };

        let guard = DuplicateGuard::new(
            &self.catalog,
            &self.locks,
            &self.config.key_schema,
            &self.config.key_parameter,
            Duration::from_secs(self.config.lock_ttl_secs),
        );
        let claim = guard.claim(
            &lock_key(self.config.lock_scope, source, remote_id),
            &key,
            || self.create_placeholder(&creator, access, key.as_str()),
        )?;
        let expid = match claim {
            Claim::Created(expid) => expid,
            Claim::Duplicate(existing) => {
                tracing::info!(%remote_id, %existing, %key, "already harvested");
                return Ok(Outcome::Skipped(SkipReason::Duplicate { existing }));
            }
            Claim::Busy => return Ok(Outcome::Skipped(SkipReason::LockBusy)),
        };
        tracing::info!(%remote_id, %expid, "created placeholder experiment");

        if let Err(err) = self.register(&creator, expid, &document, &owners) {
            tracing::error!(%remote_id, %expid, error = %err, "document registration failed");
            self.discard_placeholder(expid);
            return Err(err);
        }

        self.finalize(source, remote_id, expid)?;
        tracing::info!(%remote_id, %expid, "experiment ingested");
        Ok(Outcome::Ingested(expid))
    }

    fn create_placeholder(
        &self,
        creator: &LocalUser,
        access: PublicAccess,
        key: &str,
    ) -> Result<ExperimentId, HarvestError> {
        let experiment = self
            .catalog
            .create_experiment(NewExperiment::placeholder(creator.id, access))?;
        let parameter = ExperimentParameter {
            experiment_id: experiment.id,
            schema: self.config.key_schema.clone(),
            name: self.config.key_parameter.clone(),
            value: key.to_string(),
        };
        if let Err(err) = self.catalog.add_parameter(parameter) {
            if let Err(cleanup) = self.catalog.delete_experiment(experiment.id) {
                tracing::warn!(expid = %experiment.id, error = %cleanup, "failed to delete placeholder experiment");
            }
            return Err(err);
        }
        Ok(experiment.id)
    }

    fn register(
        &self,
        creator: &LocalUser,
        expid: ExperimentId,
        document: &[u8],
        owners: &[String],
    ) -> Result<(), HarvestError> {
        let path = self.store.write_document(expid, document)?;
        let registrar = Registrar::new(
            &self.catalog,
            &self.parser,
            &self.auth,
            self.config.default_auth.as_deref(),
            self.config.force_user_create,
        );
        let (_, sync_root) = registrar.register_experiment_document(&path, creator, expid, owners)?;
        tracing::debug!(%expid, %sync_root, "document registered");
        Ok(())
    }

    fn discard_placeholder(&self, expid: ExperimentId) {
        if let Err(err) = self.catalog.remove_parameter(
            expid,
            &self.config.key_schema,
            &self.config.key_parameter,
        ) {
            tracing::warn!(%expid, error = %err, "failed to drop key parameter from placeholder");
        }
        if self.config.placeholder_on_failure != PlaceholderPolicy::Delete {
            return;
        }
        if let Err(err) = self.catalog.delete_experiment(expid) {
            tracing::warn!(%expid, error = %err, "failed to delete placeholder experiment");
        }
        if let Err(err) = self.store.remove_experiment_dir(expid) {
            tracing::warn!(%expid, error = %err, "failed to remove placeholder directory");
        }
    }

    /// Marks datafiles as remote and records where the experiment came from.
    fn finalize(
        &self,
        source: &str,
        remote_id: &RemoteId,
        expid: ExperimentId,
    ) -> Result<(), HarvestError> {
        let mut experiment = self
            .catalog
            .get_experiment(expid)?
            .ok_or_else(|| HarvestError::Catalog(format!("experiment {expid} vanished")))?;

        for mut datafile in self.catalog.datafiles(expid)? {
            datafile.stay_remote = true;
            self.catalog.update_datafile(&datafile)?;
        }

        let origin = Producer::new(&self.fetcher, source)
            .endpoints()
            .experiment_view(remote_id);
        experiment
            .description
            .push_str(&format!("\nOriginally from {origin}\n"));
        self.catalog.update_experiment(&experiment)
    }
}
