use serde_json::Value;

use crate::domain::{AclEntry, ExperimentKey, RemoteId, RemoteUserProfile};
use crate::error::HarvestError;
use crate::fetcher::{RemoteFetcher, fetch_json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    source: String,
}

impl Endpoints {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.trim_end_matches('/').to_string(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn identify(&self) -> String {
        format!("{}/apps/oaipmh/?verb=Identify", self.source)
    }

    pub fn list_records(&self) -> String {
        format!(
            "{}/apps/oaipmh/?verb=ListRecords&metadataPrefix=oai_dc",
            self.source
        )
    }

    pub fn list_records_resume(&self, token: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
        format!(
            "{}/apps/oaipmh/?verb=ListRecords&resumptionToken={encoded}",
            self.source
        )
    }

    pub fn user(&self, id: &RemoteId) -> String {
        format!("{}/apps/reposproducer/user/{id}/", self.source)
    }

    pub fn experiment_state(&self, id: &RemoteId) -> String {
        format!("{}/apps/reposproducer/expstate/{id}/", self.source)
    }

    pub fn acls(&self, id: &RemoteId) -> String {
        format!("{}/apps/reposproducer/acls/{id}/", self.source)
    }

    pub fn key(&self, id: &RemoteId) -> String {
        format!("{}/apps/reposproducer/key/{id}/", self.source)
    }

    pub fn mets_export(&self, id: &RemoteId, force_http_urls: bool) -> String {
        if force_http_urls {
            format!("{}/experiment/metsexport/{id}/?force_http_urls", self.source)
        } else {
            format!("{}/experiment/metsexport/{id}/", self.source)
        }
    }

    pub fn experiment_view(&self, id: &RemoteId) -> String {
        format!("{}/experiment/view/{id}/", self.source)
    }
}

pub struct Producer<'a, F: RemoteFetcher + ?Sized> {
    fetcher: &'a F,
    endpoints: Endpoints,
}

impl<'a, F: RemoteFetcher + ?Sized> Producer<'a, F> {
    pub fn new(fetcher: &'a F, source: &str) -> Self {
        Self {
            fetcher,
            endpoints: Endpoints::new(source),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn user_profile(&self, id: &RemoteId) -> Result<RemoteUserProfile, HarvestError> {
        fetch_json(self.fetcher, &self.endpoints.user(id))
    }

    pub fn experiment_state(&self, id: &RemoteId) -> Result<i64, HarvestError> {
        let url = self.endpoints.experiment_state(id);
        let value: Value = fetch_json(self.fetcher, &url)?;
        let code = match &value {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        };
        code.ok_or_else(|| {
            HarvestError::ReposRead(format!("{url}: expected an access level, got {value}"))
        })
    }

    pub fn acls(&self, id: &RemoteId) -> Result<Vec<AclEntry>, HarvestError> {
        fetch_json(self.fetcher, &self.endpoints.acls(id))
    }

    /// `None` while the producer has not assigned a key yet.
    pub fn experiment_key(&self, id: &RemoteId) -> Result<Option<ExperimentKey>, HarvestError> {
        let url = self.endpoints.key(id);
        let value: Option<String> = match fetch_json(self.fetcher, &url) {
            Ok(value) => value,
            Err(HarvestError::BadAccess {
                status: Some(404), ..
            }) => None,
            Err(err) => return Err(err),
        };
        Ok(value.and_then(ExperimentKey::new))
    }

    pub fn mets_document(
        &self,
        id: &RemoteId,
        force_http_urls: bool,
    ) -> Result<Vec<u8>, HarvestError> {
        let url = self.endpoints.mets_export(id, force_http_urls);
        let body = self.fetcher.fetch_url(&url)?;
        if body.iter().all(|byte| byte.is_ascii_whitespace()) {
            return Err(HarvestError::ReposRead(format!("{url}: empty document")));
        }
        Ok(body)
    }
}
