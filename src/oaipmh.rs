use std::collections::HashSet;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use url::Url;

use crate::domain::{FeedIdentity, RecordDescriptor, RemoteId};
use crate::error::HarvestError;
use crate::fetcher::RemoteFetcher;
use crate::producer::Endpoints;

const NO_RECORDS_MATCH: &str = "noRecordsMatch";

pub struct FeedClient<'a, F: RemoteFetcher + ?Sized> {
    fetcher: &'a F,
    endpoints: Endpoints,
}

impl<'a, F: RemoteFetcher + ?Sized> FeedClient<'a, F> {
    pub fn new(fetcher: &'a F, source: &str) -> Self {
        Self {
            fetcher,
            endpoints: Endpoints::new(source),
        }
    }

    pub fn identify(&self) -> Result<FeedIdentity, HarvestError> {
        let body = self.fetcher.fetch_url(&self.endpoints.identify())?;
        parse_identify(&decode_utf8(&body)?)
    }

    pub fn list_public_records(&self) -> Result<Vec<RecordDescriptor>, HarvestError> {
        let mut records = Vec::new();
        let mut seen_tokens = HashSet::new();
        let mut url = self.endpoints.list_records();
        loop {
            let body = self.fetcher.fetch_url(&url)?;
            let page = parse_list_records(&decode_utf8(&body)?)?;
            records.extend(page.records);
            let Some(token) = page.resumption_token else {
                break;
            };
            if !seen_tokens.insert(token.clone()) {
                return Err(HarvestError::OaiPmh(format!(
                    "resumption token {token:?} repeated"
                )));
            }
            tracing::debug!(token = %token, "following resumption token");
            url = self.endpoints.list_records_resume(&token);
        }
        Ok(records)
    }
}

pub fn verify_origin(identity: &FeedIdentity, source: &str) -> Result<(), HarvestError> {
    let reported = Url::parse(&identity.base_url).map_err(|err| {
        HarvestError::ReposRead(format!("invalid baseURL {:?}: {err}", identity.base_url))
    })?;
    let expected =
        Url::parse(source).map_err(|err| HarvestError::InvalidSource(format!("{source}: {err}")))?;
    if reported.origin() != expected.origin() {
        return Err(HarvestError::bad_access(format!(
            "feed at {source} reports base URL {}",
            identity.base_url
        )));
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub records: Vec<RecordDescriptor>,
    pub resumption_token: Option<String>,
}

pub fn parse_identify(xml: &str) -> Result<FeedIdentity, HarvestError> {
    let mut base_url = None;
    let mut repository_name = None;
    walk_response(xml, |event| {
        if let XmlEvent::Close { name, text, .. } = event {
            match name {
                "baseURL" if base_url.is_none() => base_url = Some(text.trim().to_string()),
                "repositoryName" if repository_name.is_none() => {
                    repository_name = Some(text.trim().to_string())
                }
                _ => {}
            }
        }
        Ok(())
    })?;

    let base_url = base_url
        .filter(|value| !value.is_empty())
        .ok_or_else(|| HarvestError::ReposRead("Identify response lacks baseURL".to_string()))?;
    Ok(FeedIdentity {
        base_url,
        repository_name: repository_name.filter(|value| !value.is_empty()),
    })
}

pub fn parse_list_records(xml: &str) -> Result<ListPage, HarvestError> {
    let mut page = ListPage::default();
    let mut current: Option<PartialRecord> = None;

    let outcome = walk_response(xml, |event| {
        match event {
            XmlEvent::Open { name: "record", .. } => current = Some(PartialRecord::default()),
            XmlEvent::Open {
                name: "header",
                deleted,
                ..
            } => {
                if let Some(record) = current.as_mut() {
                    record.deleted = deleted;
                }
            }
            XmlEvent::Close {
                name,
                text,
                in_metadata,
            } => match name {
                "record" => {
                    if let Some(record) = current.take() {
                        if let Some(descriptor) = record.finish()? {
                            page.records.push(descriptor);
                        }
                    }
                }
                "identifier" | "creator" if in_metadata => {
                    if let Some(record) = current.as_mut() {
                        let slot = if name == "identifier" {
                            &mut record.identifier
                        } else {
                            &mut record.creator
                        };
                        if slot.is_none() && !text.trim().is_empty() {
                            *slot = Some(text.trim().to_string());
                        }
                    }
                }
                "resumptionToken" => {
                    let token = text.trim();
                    if !token.is_empty() {
                        page.resumption_token = Some(token.to_string());
                    }
                }
                _ => {}
            },
            XmlEvent::Open { .. } => {}
        }
        Ok(())
    });

    match outcome {
        Ok(()) => Ok(page),
        Err(HarvestError::OaiPmh(message)) if message.starts_with(NO_RECORDS_MATCH) => {
            Ok(ListPage::default())
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug, Default)]
struct PartialRecord {
    deleted: bool,
    identifier: Option<String>,
    creator: Option<String>,
}

impl PartialRecord {
    fn finish(self) -> Result<Option<RecordDescriptor>, HarvestError> {
        if self.deleted {
            return Ok(None);
        }
        let identifier = self
            .identifier
            .ok_or_else(|| HarvestError::ReposRead("record lacks dc:identifier".to_string()))?;
        let creator = self.creator.ok_or_else(|| {
            HarvestError::ReposRead(format!("record {identifier} lacks dc:creator"))
        })?;
        Ok(Some(RecordDescriptor {
            identifier: identifier.parse()?,
            creator: creator.parse::<RemoteId>()?,
        }))
    }
}

enum XmlEvent<'e> {
    Open {
        name: &'e str,
        deleted: bool,
    },
    Close {
        name: &'e str,
        text: &'e str,
        in_metadata: bool,
    },
}

fn walk_response<V>(xml: &str, mut visit: V) -> Result<(), HarvestError>
where
    V: FnMut(XmlEvent<'_>) -> Result<(), HarvestError>,
{
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut saw_root = false;
    let mut error_code: Option<String> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| HarvestError::OaiPmh(format!("malformed response: {err}")))?;
        match event {
            Event::Start(start) => {
                let name = local_name(&start);
                if stack.is_empty() {
                    check_root(&name)?;
                    saw_root = true;
                }
                if name == "error" {
                    error_code = Some(attribute(&start, "code")?.unwrap_or_default());
                }
                let deleted = name == "header"
                    && attribute(&start, "status")?.as_deref() == Some("deleted");
                visit(XmlEvent::Open {
                    name: &name,
                    deleted,
                })?;
                stack.push(name);
                text.clear();
            }
            Event::Empty(start) => {
                let name = local_name(&start);
                if stack.is_empty() {
                    check_root(&name)?;
                    saw_root = true;
                }
                if name == "error" {
                    let code = attribute(&start, "code")?.unwrap_or_default();
                    return Err(HarvestError::OaiPmh(code));
                }
                let deleted = name == "header"
                    && attribute(&start, "status")?.as_deref() == Some("deleted");
                visit(XmlEvent::Open {
                    name: &name,
                    deleted,
                })?;
                let in_metadata = stack.iter().any(|open| open == "metadata");
                visit(XmlEvent::Close {
                    name: &name,
                    text: "",
                    in_metadata,
                })?;
                text.clear();
            }
            Event::Text(content) => {
                let content = content
                    .unescape()
                    .map_err(|err| HarvestError::OaiPmh(format!("malformed text: {err}")))?;
                text.push_str(&content);
            }
            Event::CData(content) => {
                text.push_str(&String::from_utf8_lossy(&content.into_inner()));
            }
            Event::End(_) => {
                let Some(name) = stack.pop() else {
                    return Err(HarvestError::OaiPmh("unbalanced end tag".to_string()));
                };
                if name == "error" {
                    let code = error_code.take().unwrap_or_default();
                    return Err(HarvestError::OaiPmh(format!("{code}: {}", text.trim())));
                }
                let in_metadata = stack.iter().any(|open| open == "metadata");
                visit(XmlEvent::Close {
                    name: &name,
                    text: &text,
                    in_metadata,
                })?;
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(HarvestError::OaiPmh(
            "response is not an OAI-PMH document".to_string(),
        ));
    }
    Ok(())
}

fn check_root(name: &str) -> Result<(), HarvestError> {
    if name == "OAI-PMH" {
        Ok(())
    } else {
        Err(HarvestError::OaiPmh(format!("unexpected root element <{name}>")))
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn attribute(start: &BytesStart<'_>, wanted: &str) -> Result<Option<String>, HarvestError> {
    for attr in start.attributes() {
        let attr = attr.map_err(|err| HarvestError::OaiPmh(format!("malformed attribute: {err}")))?;
        if attr.key.local_name().as_ref() == wanted.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| HarvestError::OaiPmh(format!("malformed attribute: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn decode_utf8(body: &[u8]) -> Result<String, HarvestError> {
    String::from_utf8(body.to_vec())
        .map_err(|err| HarvestError::OaiPmh(format!("response is not UTF-8: {err}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const IDENTIFY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2012-06-01T00:00:00Z</responseDate>
  <request verb="Identify">http://127.0.0.1:9000/apps/oaipmh/</request>
  <Identify>
    <repositoryName>Test Repository</repositoryName>
    <baseURL>http://127.0.0.1:9000/apps/oaipmh</baseURL>
    <protocolVersion>2.0</protocolVersion>
  </Identify>
</OAI-PMH>"#;

    #[test]
    fn parse_identify_reads_base_url() {
        let identity = parse_identify(IDENTIFY).unwrap();
        assert_eq!(identity.base_url, "http://127.0.0.1:9000/apps/oaipmh");
        assert_eq!(identity.repository_name.as_deref(), Some("Test Repository"));
    }

    #[test]
    fn parse_identify_without_base_url() {
        let xml = r#"<OAI-PMH><Identify><repositoryName>x</repositoryName></Identify></OAI-PMH>"#;
        assert_matches!(parse_identify(xml), Err(HarvestError::ReposRead(_)));
    }

    #[test]
    fn parse_identify_protocol_error() {
        let xml = r#"<OAI-PMH><error code="badVerb">Illegal verb</error></OAI-PMH>"#;
        assert_matches!(
            parse_identify(xml),
            Err(HarvestError::OaiPmh(message)) if message == "badVerb: Illegal verb"
        );
    }

    #[test]
    fn non_oai_document_is_protocol_error() {
        assert_matches!(
            parse_identify("<html><body>oops</body></html>"),
            Err(HarvestError::OaiPmh(_))
        );
        assert_matches!(parse_identify("not xml at all"), Err(HarvestError::OaiPmh(_)));
    }

    #[test]
    fn parse_records_skips_deleted_and_reads_token() {
        let xml = r#"<OAI-PMH xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/"
                              xmlns:dc="http://purl.org/dc/elements/1.1/">
  <ListRecords>
    <record>
      <header><identifier>oai:host:experiment/42</identifier></header>
      <metadata><oai_dc:dc>
        <dc:title>Sample</dc:title>
        <dc:identifier>42</dc:identifier>
        <dc:identifier>ignored</dc:identifier>
        <dc:creator>7</dc:creator>
      </oai_dc:dc></metadata>
    </record>
    <record>
      <header status="deleted"><identifier>oai:host:experiment/43</identifier></header>
    </record>
    <resumptionToken cursor="0">page-2</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

        let page = parse_list_records(xml).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].identifier.as_str(), "42");
        assert_eq!(page.records[0].creator.as_str(), "7");
        assert_eq!(page.resumption_token.as_deref(), Some("page-2"));
    }

    #[test]
    fn no_records_match_is_empty() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nothing</error></OAI-PMH>"#;
        assert_eq!(parse_list_records(xml).unwrap(), ListPage::default());
    }

    #[test]
    fn record_without_creator_is_read_error() {
        let xml = r#"<OAI-PMH><ListRecords><record><header/>
            <metadata><dc><identifier>42</identifier></dc></metadata>
        </record></ListRecords></OAI-PMH>"#;
        assert_matches!(parse_list_records(xml), Err(HarvestError::ReposRead(_)));
    }

    #[test]
    fn empty_resumption_token_ends_listing() {
        let xml = r#"<OAI-PMH><ListRecords><resumptionToken/></ListRecords></OAI-PMH>"#;
        assert_eq!(parse_list_records(xml).unwrap().resumption_token, None);
    }

    #[test]
    fn origin_check() {
        let identity = FeedIdentity {
            base_url: "http://127.0.0.1:9000/apps/oaipmh".to_string(),
            repository_name: None,
        };
        verify_origin(&identity, "http://127.0.0.1:9000").unwrap();
        assert_matches!(
            verify_origin(&identity, "http://127.0.0.1:9001"),
            Err(HarvestError::BadAccess { status: None, .. })
        );
        assert_matches!(
            verify_origin(&identity, "https://127.0.0.1:9000"),
            Err(HarvestError::BadAccess { .. })
        );
    }
}
