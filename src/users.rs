use crate::catalog::{Catalog, LocalUser, NewUser};
use crate::domain::RemoteId;
use crate::error::HarvestError;
use crate::fetcher::RemoteFetcher;
use crate::producer::Producer;

pub struct UserResolver<'a, F: RemoteFetcher + ?Sized, C: Catalog + ?Sized> {
    fetcher: &'a F,
    catalog: &'a C,
}

impl<'a, F: RemoteFetcher + ?Sized, C: Catalog + ?Sized> UserResolver<'a, F, C> {
    pub fn new(fetcher: &'a F, catalog: &'a C) -> Self {
        Self { fetcher, catalog }
    }

    pub fn resolve_user(&self, source: &str, remote_id: &RemoteId) -> Result<LocalUser, HarvestError> {
        let profile = Producer::new(self.fetcher, source)
            .user_profile(remote_id)
            .map_err(|err| match err {
                HarvestError::Transport(_) => err,
                other => HarvestError::RemoteUserRead(format!("user {remote_id}: {other}")),
            })?;

        let (user, created) = self.catalog.find_or_create_user(NewUser {
            username: profile.username,
            first_name: profile.first_name,
            last_name: profile.last_name,
            email: profile.email,
        })?;
        if created {
            tracing::info!(username = %user.username, user_id = %user.id, "created local user");
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::catalog::JsonCatalog;
    use crate::store::Store;

    struct ProfileFetcher(&'static str);

    impl RemoteFetcher for ProfileFetcher {
        fn fetch_url(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
            assert!(url.ends_with("/apps/reposproducer/user/7/"));
            Ok(self.0.as_bytes().to_vec())
        }
    }

    struct Rejecting;

    impl RemoteFetcher for Rejecting {
        fn fetch_url(&self, _url: &str) -> Result<Vec<u8>, HarvestError> {
            Err(HarvestError::BadAccess {
                status: Some(500),
                message: "boom".to_string(),
            })
        }
    }

    fn catalog() -> (tempfile::TempDir, JsonCatalog) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let catalog = JsonCatalog::open(&Store::new(root)).unwrap();
        (temp, catalog)
    }

    #[test]
    fn resolving_twice_returns_same_user() {
        let (_temp, catalog) = catalog();
        let fetcher = ProfileFetcher(
            r#"{"username":"tom","first_name":"Thomas","last_name":"Atkins","email":"tommy@atkins.net"}"#,
        );
        let resolver = UserResolver::new(&fetcher, &catalog);
        let id: RemoteId = "7".parse().unwrap();

        let first = resolver.resolve_user("http://host", &id).unwrap();
        let second = resolver.resolve_user("http://host", &id).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.first_name, "Thomas");
        assert!(catalog.user_profile(first.id).unwrap().is_some());
    }

    #[test]
    fn incomplete_profile_is_remote_user_error() {
        let (_temp, catalog) = catalog();
        let fetcher = ProfileFetcher(r#"{"username":"tom"}"#);
        let resolver = UserResolver::new(&fetcher, &catalog);

        let err = resolver
            .resolve_user("http://host", &"7".parse().unwrap())
            .unwrap_err();
        assert_matches!(err, HarvestError::RemoteUserRead(_));
        assert!(catalog.find_user_by_username("tom").unwrap().is_none());
    }

    #[test]
    fn rejected_fetch_is_remote_user_error() {
        let (_temp, catalog) = catalog();
        let resolver = UserResolver::new(&Rejecting, &catalog);
        let err = resolver
            .resolve_user("http://host", &"7".parse().unwrap())
            .unwrap_err();
        assert_matches!(err, HarvestError::RemoteUserRead(_));
    }
}
