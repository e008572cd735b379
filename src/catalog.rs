use std::fs::{self, File, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use fs4::FileExt;
use serde::{Deserialize, Serialize};

use crate::domain::{ExperimentId, LOCAL_USER_PLUGIN, PublicAccess, UserId};
use crate::error::HarvestError;
use crate::store::Store;

pub const PLACEHOLDER_TITLE: &str = "Placeholder Title";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub is_local_account: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub title: String,
    pub description: String,
    pub approved: bool,
    pub created_by: UserId,
    pub public_access: PublicAccess,
    pub locked: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExperiment {
    pub title: String,
    pub description: String,
    pub approved: bool,
    pub created_by: UserId,
    pub public_access: PublicAccess,
    pub locked: bool,
}

impl NewExperiment {
    pub fn placeholder(created_by: UserId, public_access: PublicAccess) -> Self {
        Self {
            title: PLACEHOLDER_TITLE.to_string(),
            description: String::new(),
            approved: true,
            created_by,
            public_access,
            locked: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentParameter {
    pub experiment_id: ExperimentId,
    pub schema: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datafile {
    pub id: u64,
    pub experiment_id: ExperimentId,
    pub filename: String,
    pub url: Option<String>,
    pub size: Option<u64>,
    pub stay_remote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDatafile {
    pub filename: String,
    pub url: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclOwnershipType {
    OwnerOwned,
    SystemOwned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentAcl {
    pub id: u64,
    pub experiment_id: ExperimentId,
    pub plugin_id: String,
    pub entity_id: String,
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub is_owner: bool,
    pub ownership_type: AclOwnershipType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAcl {
    pub experiment_id: ExperimentId,
    pub plugin_id: String,
    pub entity_id: String,
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub is_owner: bool,
    pub ownership_type: AclOwnershipType,
}

impl NewAcl {
    pub fn owner(experiment_id: ExperimentId, user: UserId) -> Self {
        Self {
            experiment_id,
            plugin_id: LOCAL_USER_PLUGIN.to_string(),
            entity_id: user.to_string(),
            can_read: true,
            can_write: true,
            can_delete: true,
            is_owner: true,
            ownership_type: AclOwnershipType::OwnerOwned,
        }
    }
}

pub trait Catalog: Send + Sync {
    fn find_user_by_username(&self, username: &str) -> Result<Option<LocalUser>, HarvestError>;
    fn find_user_by_email(&self, email: &str) -> Result<Option<LocalUser>, HarvestError>;
    fn create_user(&self, user: NewUser) -> Result<LocalUser, HarvestError>;
    /// Lookup and creation in one step; `true` when the user was created.
    fn find_or_create_user(&self, user: NewUser) -> Result<(LocalUser, bool), HarvestError>;
    fn user_profile(&self, id: UserId) -> Result<Option<UserProfile>, HarvestError>;

    fn create_experiment(
        &self,
        experiment: NewExperiment,
    ) -> Result<ExperimentRecord, HarvestError>;
    fn get_experiment(&self, id: ExperimentId) -> Result<Option<ExperimentRecord>, HarvestError>;
    fn update_experiment(&self, experiment: &ExperimentRecord) -> Result<(), HarvestError>;
    fn delete_experiment(&self, id: ExperimentId) -> Result<(), HarvestError>;
    fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, HarvestError>;

    fn add_parameter(&self, parameter: ExperimentParameter) -> Result<(), HarvestError>;
    fn remove_parameter(
        &self,
        experiment_id: ExperimentId,
        schema: &str,
        name: &str,
    ) -> Result<(), HarvestError>;
    fn parameter_values(
        &self,
        schema: &str,
        name: &str,
    ) -> Result<Vec<(ExperimentId, String)>, HarvestError>;

    fn add_datafile(
        &self,
        experiment_id: ExperimentId,
        datafile: NewDatafile,
    ) -> Result<Datafile, HarvestError>;
    fn datafiles(&self, experiment_id: ExperimentId) -> Result<Vec<Datafile>, HarvestError>;
    fn update_datafile(&self, datafile: &Datafile) -> Result<(), HarvestError>;

    fn create_acl(&self, acl: NewAcl) -> Result<ExperimentAcl, HarvestError>;
    fn acls(&self, experiment_id: ExperimentId) -> Result<Vec<ExperimentAcl>, HarvestError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogState {
    #[serde(default)]
    last_user_id: u64,
    #[serde(default)]
    last_experiment_id: u64,
    #[serde(default)]
    last_datafile_id: u64,
    #[serde(default)]
    last_acl_id: u64,
    #[serde(default)]
    users: Vec<LocalUser>,
    #[serde(default)]
    profiles: Vec<UserProfile>,
    #[serde(default)]
    experiments: Vec<ExperimentRecord>,
    #[serde(default)]
    parameters: Vec<ExperimentParameter>,
    #[serde(default)]
    datafiles: Vec<Datafile>,
    #[serde(default)]
    acls: Vec<ExperimentAcl>,
}

impl CatalogState {
    fn experiment_mut(&mut self, id: ExperimentId) -> Result<&mut ExperimentRecord, HarvestError> {
        self.experiments
            .iter_mut()
            .find(|experiment| experiment.id == id)
            .ok_or_else(|| HarvestError::Catalog(format!("experiment {id} does not exist")))
    }

    fn user_by_username(&self, username: &str) -> Option<&LocalUser> {
        self.users.iter().find(|user| user.username == username)
    }

    fn insert_user(&mut self, user: NewUser) -> LocalUser {
        self.last_user_id += 1;
        let created = LocalUser {
            id: UserId(self.last_user_id),
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
        };
        self.users.push(created.clone());
        self.profiles.push(UserProfile {
            user_id: created.id,
            is_local_account: true,
        });
        created
    }

    fn require_experiment(&self, id: ExperimentId) -> Result<(), HarvestError> {
        if self.experiments.iter().any(|experiment| experiment.id == id) {
            Ok(())
        } else {
            Err(HarvestError::Catalog(format!("experiment {id} does not exist")))
        }
    }
}

#[derive(Debug)]
pub struct JsonCatalog {
    path: Utf8PathBuf,
}

impl JsonCatalog {
    pub fn open(store: &Store) -> Result<Self, HarvestError> {
        store.ensure_root()?;
        Ok(Self::at_path(store.catalog_path()))
    }

    pub fn at_path(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn lock_path(&self) -> Utf8PathBuf {
        let mut name = self.path.file_name().unwrap_or("catalog.json").to_string();
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    fn lock_exclusive(&self) -> Result<File, HarvestError> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.as_std_path())
            .map_err(|err| HarvestError::Catalog(format!("open {path}: {err}")))?;
        file.lock_exclusive()
            .map_err(|err| HarvestError::Catalog(format!("lock {path}: {err}")))?;
        Ok(file)
    }

    fn load(&self) -> Result<CatalogState, HarvestError> {
        if !self.path.as_std_path().exists() {
            return Ok(CatalogState::default());
        }
        let content = fs::read(self.path.as_std_path())
            .map_err(|err| HarvestError::Catalog(format!("read {}: {err}", self.path)))?;
        serde_json::from_slice(&content)
            .map_err(|err| HarvestError::Catalog(format!("decode {}: {err}", self.path)))
    }

    fn save(&self, state: &CatalogState) -> Result<(), HarvestError> {
        let content = serde_json::to_vec_pretty(state)
            .map_err(|err| HarvestError::Catalog(err.to_string()))?;
        Store::write_bytes_atomic(&self.path, &content)
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogState) -> T) -> Result<T, HarvestError> {
        let _lock = self.lock_exclusive()?;
        let state = self.load()?;
        Ok(f(&state))
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut CatalogState) -> Result<T, HarvestError>,
    ) -> Result<T, HarvestError> {
        let _lock = self.lock_exclusive()?;
        let mut state = self.load()?;
        let value = f(&mut state)?;
        self.save(&state)?;
        Ok(value)
    }
}

impl Catalog for JsonCatalog {
    fn find_user_by_username(&self, username: &str) -> Result<Option<LocalUser>, HarvestError> {
        self.read(|state| {
            state
                .users
                .iter()
                .find(|user| user.username == username)
                .cloned()
        })
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<LocalUser>, HarvestError> {
        self.read(|state| {
            state
                .users
                .iter()
                .find(|user| user.email.eq_ignore_ascii_case(email))
                .cloned()
        })
    }

    fn create_user(&self, user: NewUser) -> Result<LocalUser, HarvestError> {
        self.mutate(|state| {
            if state.user_by_username(&user.username).is_some() {
                return Err(HarvestError::Catalog(format!(
                    "username {} already exists",
                    user.username
                )));
            }
            Ok(state.insert_user(user))
        })
    }

    fn find_or_create_user(&self, user: NewUser) -> Result<(LocalUser, bool), HarvestError> {
        self.mutate(|state| match state.user_by_username(&user.username) {
            Some(existing) => Ok((existing.clone(), false)),
            None => Ok((state.insert_user(user), true)),
        })
    }

    fn user_profile(&self, id: UserId) -> Result<Option<UserProfile>, HarvestError> {
        self.read(|state| {
            state
                .profiles
                .iter()
                .find(|profile| profile.user_id == id)
                .cloned()
        })
    }

    fn create_experiment(
        &self,
        experiment: NewExperiment,
    ) -> Result<ExperimentRecord, HarvestError> {
        self.mutate(|state| {
            state.last_experiment_id += 1;
            let created = ExperimentRecord {
                id: ExperimentId(state.last_experiment_id),
                title: experiment.title,
                description: experiment.description,
                approved: experiment.approved,
                created_by: experiment.created_by,
                public_access: experiment.public_access,
                locked: experiment.locked,
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            state.experiments.push(created.clone());
            Ok(created)
        })
    }

    fn get_experiment(&self, id: ExperimentId) -> Result<Option<ExperimentRecord>, HarvestError> {
        self.read(|state| {
            state
                .experiments
                .iter()
                .find(|experiment| experiment.id == id)
                .cloned()
        })
    }

    fn update_experiment(&self, experiment: &ExperimentRecord) -> Result<(), HarvestError> {
        self.mutate(|state| {
            *state.experiment_mut(experiment.id)? = experiment.clone();
            Ok(())
        })
    }

    fn delete_experiment(&self, id: ExperimentId) -> Result<(), HarvestError> {
        self.mutate(|state| {
            state.require_experiment(id)?;
            state.experiments.retain(|experiment| experiment.id != id);
            state.parameters.retain(|param| param.experiment_id != id);
            state.datafiles.retain(|datafile| datafile.experiment_id != id);
            state.acls.retain(|acl| acl.experiment_id != id);
            Ok(())
        })
    }

    fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, HarvestError> {
        self.read(|state| state.experiments.clone())
    }

    fn add_parameter(&self, parameter: ExperimentParameter) -> Result<(), HarvestError> {
        self.mutate(|state| {
            state.require_experiment(parameter.experiment_id)?;
            state.parameters.push(parameter);
            Ok(())
        })
    }

    fn remove_parameter(
        &self,
        experiment_id: ExperimentId,
        schema: &str,
        name: &str,
    ) -> Result<(), HarvestError> {
        self.mutate(|state| {
            state.parameters.retain(|param| {
                !(param.experiment_id == experiment_id && param.schema == schema && param.name == name)
            });
            Ok(())
        })
    }

    fn parameter_values(
        &self,
        schema: &str,
        name: &str,
    ) -> Result<Vec<(ExperimentId, String)>, HarvestError> {
        self.read(|state| {
            state
                .parameters
                .iter()
                .filter(|param| param.schema == schema && param.name == name)
                .map(|param| (param.experiment_id, param.value.clone()))
                .collect()
        })
    }

    fn add_datafile(
        &self,
        experiment_id: ExperimentId,
        datafile: NewDatafile,
    ) -> Result<Datafile, HarvestError> {
        self.mutate(|state| {
            state.require_experiment(experiment_id)?;
            state.last_datafile_id += 1;
            let created = Datafile {
                id: state.last_datafile_id,
                experiment_id,
                filename: datafile.filename,
                url: datafile.url,
                size: datafile.size,
                stay_remote: false,
            };
            state.datafiles.push(created.clone());
            Ok(created)
        })
    }

    fn datafiles(&self, experiment_id: ExperimentId) -> Result<Vec<Datafile>, HarvestError> {
        self.read(|state| {
            state
                .datafiles
                .iter()
                .filter(|datafile| datafile.experiment_id == experiment_id)
                .cloned()
                .collect()
        })
    }

    fn update_datafile(&self, datafile: &Datafile) -> Result<(), HarvestError> {
        self.mutate(|state| {
            let existing = state
                .datafiles
                .iter_mut()
                .find(|existing| existing.id == datafile.id)
                .ok_or_else(|| {
                    HarvestError::Catalog(format!("datafile {} does not exist", datafile.id))
                })?;
            *existing = datafile.clone();
            Ok(())
        })
    }

    fn create_acl(&self, acl: NewAcl) -> Result<ExperimentAcl, HarvestError> {
        self.mutate(|state| {
            state.require_experiment(acl.experiment_id)?;
            state.last_acl_id += 1;
            let created = ExperimentAcl {
                id: state.last_acl_id,
                experiment_id: acl.experiment_id,
                plugin_id: acl.plugin_id,
                entity_id: acl.entity_id,
                can_read: acl.can_read,
                can_write: acl.can_write,
                can_delete: acl.can_delete,
                is_owner: acl.is_owner,
                ownership_type: acl.ownership_type,
            };
            state.acls.push(created.clone());
            Ok(created)
        })
    }

    fn acls(&self, experiment_id: ExperimentId) -> Result<Vec<ExperimentAcl>, HarvestError> {
        self.read(|state| {
            state
                .acls
                .iter()
                .filter(|acl| acl.experiment_id == experiment_id)
                .cloned()
                .collect()
        })
    }
}
