use std::time::Duration;

use crate::catalog::Catalog;
use crate::config::LockScope;
use crate::domain::{ExperimentId, ExperimentKey, RemoteId};
use crate::error::HarvestError;
use crate::lock::{LockCache, LockGuard};

pub const LOCK_PREFIX: &str = "reposconsumer-dedup";

#[derive(Debug, PartialEq, Eq)]
pub enum Claim<T> {
    Created(T),
    Duplicate(ExperimentId),
    Busy,
}

pub fn lock_key(scope: LockScope, source: &str, remote_id: &RemoteId) -> String {
    match scope {
        LockScope::Global => LOCK_PREFIX.to_string(),
        LockScope::Record => format!("{LOCK_PREFIX}:{source}:{remote_id}"),
    }
}

pub struct DuplicateGuard<'a, C: Catalog + ?Sized, L: LockCache + ?Sized> {
    catalog: &'a C,
    locks: &'a L,
    schema: &'a str,
    parameter: &'a str,
    ttl: Duration,
}

impl<'a, C: Catalog + ?Sized, L: LockCache + ?Sized> DuplicateGuard<'a, C, L> {
    pub fn new(
        catalog: &'a C,
        locks: &'a L,
        schema: &'a str,
        parameter: &'a str,
        ttl: Duration,
    ) -> Self {
        Self {
            catalog,
            locks,
            schema,
            parameter,
            ttl,
        }
    }

    pub fn is_duplicate(&self, key: &ExperimentKey) -> Result<Option<ExperimentId>, HarvestError> {
        Ok(self
            .catalog
            .parameter_values(self.schema, self.parameter)?
            .into_iter()
            .find(|(_, value)| value == key.as_str())
            .map(|(id, _)| id))
    }

    /// Scans for `key` and, when absent, runs `create` before the lock is
    /// released. `create` must record `key` on the experiment it makes.
    pub fn claim<T>(
        &self,
        lock_key: &str,
        key: &ExperimentKey,
        create: impl FnOnce() -> Result<T, HarvestError>,
    ) -> Result<Claim<T>, HarvestError> {
        let Some(_guard) = LockGuard::acquire(self.locks, lock_key, self.ttl)? else {
            return Ok(Claim::Busy);
        };
        if let Some(existing) = self.is_duplicate(key)? {
            return Ok(Claim::Duplicate(existing));
        }
        create().map(Claim::Created)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::catalog::{ExperimentParameter, JsonCatalog, NewExperiment, NewUser};
    use crate::domain::PublicAccess;
    use crate::lock::{DEFAULT_LOCK_TTL, FileLockCache};
    use crate::store::Store;

    const SCHEMA: &str = "http://example.org/key";

    struct Fixture {
        _temp: tempfile::TempDir,
        catalog: JsonCatalog,
        locks: FileLockCache,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(root);
        let catalog = JsonCatalog::open(&store).unwrap();
        let locks = FileLockCache::new(store.lock_dir());
        Fixture {
            _temp: temp,
            catalog,
            locks,
        }
    }

    fn create_with_key(catalog: &JsonCatalog, key: &str) -> ExperimentId {
        let user = match catalog.find_user_by_username("alice").unwrap() {
            Some(user) => user,
            None => catalog
                .create_user(NewUser {
                    username: "alice".to_string(),
                    first_name: "Alice".to_string(),
                    last_name: "L".to_string(),
                    email: "alice@example.org".to_string(),
                })
                .unwrap(),
        };
        let experiment = catalog
            .create_experiment(NewExperiment::placeholder(user.id, PublicAccess::Full))
            .unwrap();
        catalog
            .add_parameter(ExperimentParameter {
                experiment_id: experiment.id,
                schema: SCHEMA.to_string(),
                name: "key".to_string(),
                value: key.to_string(),
            })
            .unwrap();
        experiment.id
    }

    #[test]
    fn lock_keys_by_scope() {
        let id: RemoteId = "42".parse().unwrap();
        assert_eq!(
            lock_key(LockScope::Global, "http://a", &id),
            "reposconsumer-dedup"
        );
        assert_eq!(
            lock_key(LockScope::Record, "http://a", &id),
            "reposconsumer-dedup:http://a:42"
        );
    }

    #[test]
    fn claim_creates_once_then_reports_duplicate() {
        let fx = fixture();
        let guard = DuplicateGuard::new(&fx.catalog, &fx.locks, SCHEMA, "key", DEFAULT_LOCK_TTL);
        let key = ExperimentKey::new("K1").unwrap();

        let first = guard
            .claim("lock", &key, || Ok(create_with_key(&fx.catalog, "K1")))
            .unwrap();
        let id = match first {
            Claim::Created(id) => id,
            other => panic!("expected creation, got {other:?}"),
        };

        let second = guard
            .claim("lock", &key, || Ok(create_with_key(&fx.catalog, "K1")))
            .unwrap();
        assert_eq!(second, Claim::Duplicate(id));
        assert_eq!(fx.catalog.list_experiments().unwrap().len(), 1);

        assert!(fx.locks.try_lock("lock", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn claim_is_busy_while_lock_held() {
        let fx = fixture();
        let guard = DuplicateGuard::new(&fx.catalog, &fx.locks, SCHEMA, "key", DEFAULT_LOCK_TTL);
        assert!(fx.locks.try_lock("lock", DEFAULT_LOCK_TTL).unwrap());

        let claim = guard
            .claim("lock", &ExperimentKey::new("K1").unwrap(), || {
                Ok(create_with_key(&fx.catalog, "K1"))
            })
            .unwrap();
        assert_eq!(claim, Claim::Busy);
        assert!(fx.catalog.list_experiments().unwrap().is_empty());
    }

    #[test]
    fn failed_create_releases_lock() {
        let fx = fixture();
        let guard = DuplicateGuard::new(&fx.catalog, &fx.locks, SCHEMA, "key", DEFAULT_LOCK_TTL);

        let err = guard
            .claim::<()>("lock", &ExperimentKey::new("K1").unwrap(), || {
                Err(HarvestError::Catalog("disk full".to_string()))
            })
            .unwrap_err();
        assert_matches!(err, HarvestError::Catalog(_));
        assert!(fx.locks.try_lock("lock", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn other_keys_are_not_duplicates() {
        let fx = fixture();
        create_with_key(&fx.catalog, "K1");
        let guard = DuplicateGuard::new(&fx.catalog, &fx.locks, SCHEMA, "key", DEFAULT_LOCK_TTL);

        assert!(guard.is_duplicate(&ExperimentKey::new("K2").unwrap()).unwrap().is_none());
        assert!(guard.is_duplicate(&ExperimentKey::new("K1").unwrap()).unwrap().is_some());
    }
}
