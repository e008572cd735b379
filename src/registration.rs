use camino::Utf8Path;

use crate::auth::AuthService;
use crate::catalog::{Catalog, LocalUser, NewAcl};
use crate::document::{DocumentKind, DocumentParser, sniff};
use crate::domain::ExperimentId;
use crate::error::HarvestError;

pub struct Registrar<'a, P: DocumentParser + ?Sized, A: AuthService + ?Sized> {
    catalog: &'a dyn Catalog,
    parser: &'a P,
    auth: &'a A,
    default_auth: Option<&'a str>,
    force_user_create: bool,
}

impl<'a, P: DocumentParser + ?Sized, A: AuthService + ?Sized> Registrar<'a, P, A> {
    pub fn new(
        catalog: &'a dyn Catalog,
        parser: &'a P,
        auth: &'a A,
        default_auth: Option<&'a str>,
        force_user_create: bool,
    ) -> Self {
        Self {
            catalog,
            parser,
            auth,
            default_auth,
            force_user_create,
        }
    }

    pub fn register_experiment_document(
        &self,
        path: &Utf8Path,
        created_by: &LocalUser,
        expid: ExperimentId,
        owners: &[String],
    ) -> Result<(ExperimentId, String), HarvestError> {
        let parsed = sniff(path).and_then(|kind| match kind {
            DocumentKind::Simple => {
                self.parser
                    .process_simple(self.catalog, path, created_by, expid)
            }
            DocumentKind::Mets => self.parser.parse_mets(self.catalog, path, created_by, expid),
        });
        let (expid, sync_root) = parsed.map_err(|err| match err {
            HarvestError::MetsParse(_) => err,
            other => HarvestError::MetsParse(format!("{path}: {other}")),
        })?;

        let Some(auth_method) = self.default_auth else {
            tracing::error!(%expid, "no default auth method configured; owners not granted access");
            return Ok((expid, sync_root));
        };

        for owner in owners.iter().map(|owner| owner.trim()) {
            if owner.is_empty() {
                continue;
            }
            self.grant_owner(auth_method, expid, owner)?;
        }
        Ok((expid, sync_root))
    }

    fn grant_owner(
        &self,
        auth_method: &str,
        expid: ExperimentId,
        owner: &str,
    ) -> Result<(), HarvestError> {
        let username = if owner.contains('@') {
            self.auth
                .username_by_email(self.catalog, auth_method, owner)?
                .unwrap_or_else(|| owner.to_string())
        } else {
            owner.to_string()
        };

        match self
            .auth
            .get_user(self.catalog, auth_method, &username, self.force_user_create)?
        {
            Some(user) => {
                self.catalog.create_acl(NewAcl::owner(expid, user.id))?;
                tracing::debug!(%expid, username = %user.username, "granted owner access");
            }
            None => tracing::warn!(%expid, owner, auth_method, "owner has no local account"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::auth::{LOCAL_AUTH_METHOD, LocalAuthService};
    use crate::catalog::{JsonCatalog, NewExperiment, NewUser};
    use crate::document::XmlDocumentParser;
    use crate::domain::{LOCAL_USER_PLUGIN, PublicAccess};
    use crate::store::Store;

    const DOCUMENT: &str = "<experiment>\n<title>Run 7</title>\n</experiment>\n";

    struct Fixture {
        _temp: tempfile::TempDir,
        store: Store,
        catalog: JsonCatalog,
        alice: LocalUser,
        expid: ExperimentId,
    }

    fn user(catalog: &JsonCatalog, username: &str, email: &str) -> LocalUser {
        catalog
            .create_user(NewUser {
                username: username.to_string(),
                first_name: String::new(),
                last_name: String::new(),
                email: email.to_string(),
            })
            .unwrap()
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(root);
        let catalog = JsonCatalog::open(&store).unwrap();
        let alice = user(&catalog, "alice", "alice@example.org");
        user(&catalog, "bob", "bob@example.org");
        let expid = catalog
            .create_experiment(NewExperiment::placeholder(alice.id, PublicAccess::Full))
            .unwrap()
            .id;
        Fixture {
            _temp: temp,
            store,
            catalog,
            alice,
            expid,
        }
    }

    #[test]
    fn grants_owner_acls_by_username_and_email() {
        let fx = fixture();
        let path = fx.store.write_document(fx.expid, DOCUMENT.as_bytes()).unwrap();
        let parser = XmlDocumentParser::new(fx.store.clone());
        let auth = LocalAuthService::default();
        let registrar = Registrar::new(&fx.catalog, &parser, &auth, Some(LOCAL_AUTH_METHOD), false);

        let owners = vec![
            "alice".to_string(),
            "bob@example.org".to_string(),
            " ".to_string(),
            "mallory".to_string(),
        ];
        let (expid, _) = registrar
            .register_experiment_document(&path, &fx.alice, fx.expid, &owners)
            .unwrap();

        let acls = fx.catalog.acls(expid).unwrap();
        assert_eq!(acls.len(), 2);
        assert!(acls.iter().all(|acl| acl.is_owner && acl.plugin_id == LOCAL_USER_PLUGIN));
        assert_eq!(fx.catalog.get_experiment(expid).unwrap().unwrap().title, "Run 7");
    }

    #[test]
    fn without_default_auth_no_acls() {
        let fx = fixture();
        let path = fx.store.write_document(fx.expid, DOCUMENT.as_bytes()).unwrap();
        let parser = XmlDocumentParser::new(fx.store.clone());
        let auth = LocalAuthService::default();
        let registrar = Registrar::new(&fx.catalog, &parser, &auth, None, true);

        registrar
            .register_experiment_document(&path, &fx.alice, fx.expid, &["alice".to_string()])
            .unwrap();
        assert!(fx.catalog.acls(fx.expid).unwrap().is_empty());
    }

    #[test]
    fn missing_document_is_parse_error() {
        let fx = fixture();
        let parser = XmlDocumentParser::new(fx.store.clone());
        let auth = LocalAuthService::default();
        let registrar = Registrar::new(&fx.catalog, &parser, &auth, Some(LOCAL_AUTH_METHOD), false);

        let err = registrar
            .register_experiment_document(
                &fx.store.document_path(fx.expid),
                &fx.alice,
                fx.expid,
                &[],
            )
            .unwrap_err();
        assert_matches!(err, HarvestError::MetsParse(_));
    }
}
