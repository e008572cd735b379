use crate::catalog::{Catalog, LocalUser, NewUser};
use crate::error::HarvestError;

pub const LOCAL_AUTH_METHOD: &str = "localdb";

pub trait AuthService: Send + Sync {
    fn username_by_email(
        &self,
        catalog: &dyn Catalog,
        auth_method: &str,
        email: &str,
    ) -> Result<Option<String>, HarvestError>;

    fn get_user(
        &self,
        catalog: &dyn Catalog,
        auth_method: &str,
        username: &str,
        force_user_create: bool,
    ) -> Result<Option<LocalUser>, HarvestError>;
}

#[derive(Debug, Clone)]
pub struct LocalAuthService {
    method: String,
}

impl Default for LocalAuthService {
    fn default() -> Self {
        Self::new(LOCAL_AUTH_METHOD)
    }
}

impl LocalAuthService {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }

    fn serves(&self, auth_method: &str) -> bool {
        if auth_method == self.method {
            return true;
        }
        tracing::warn!(auth_method, served = %self.method, "unknown auth method");
        false
    }
}

impl AuthService for LocalAuthService {
    fn username_by_email(
        &self,
        catalog: &dyn Catalog,
        auth_method: &str,
        email: &str,
    ) -> Result<Option<String>, HarvestError> {
        if !self.serves(auth_method) {
            return Ok(None);
        }
        Ok(catalog.find_user_by_email(email)?.map(|user| user.username))
    }

    fn get_user(
        &self,
        catalog: &dyn Catalog,
        auth_method: &str,
        username: &str,
        force_user_create: bool,
    ) -> Result<Option<LocalUser>, HarvestError> {
        if !self.serves(auth_method) {
            return Ok(None);
        }
        if !force_user_create {
            return catalog.find_user_by_username(username);
        }
        let (user, created) = catalog.find_or_create_user(NewUser {
            username: username.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
        })?;
        if created {
            tracing::info!(username, user_id = %user.id, "created user on first login");
        }
        Ok(Some(user))
    }
}
