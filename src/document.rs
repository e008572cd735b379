use std::fs::File;
use std::io::{BufRead, BufReader};

use camino::Utf8Path;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::catalog::{Catalog, LocalUser, NewDatafile};
use crate::domain::ExperimentId;
use crate::error::HarvestError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Simple,
    Mets,
}

pub fn sniff(path: &Utf8Path) -> Result<DocumentKind, HarvestError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("open {path}: {err}")))?;
    let mut first_line = String::new();
    BufReader::new(file)
        .read_line(&mut first_line)
        .map_err(|err| HarvestError::MetsParse(format!("read {path}: {err}")))?;
    if first_line.trim_start().starts_with("<experiment") {
        Ok(DocumentKind::Simple)
    } else {
        Ok(DocumentKind::Mets)
    }
}

pub trait DocumentParser: Send + Sync {
    fn process_simple(
        &self,
        catalog: &dyn Catalog,
        path: &Utf8Path,
        created_by: &LocalUser,
        expid: ExperimentId,
    ) -> Result<(ExperimentId, String), HarvestError>;

    fn parse_mets(
        &self,
        catalog: &dyn Catalog,
        path: &Utf8Path,
        created_by: &LocalUser,
        expid: ExperimentId,
    ) -> Result<(ExperimentId, String), HarvestError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentContent {
    pub title: Option<String>,
    pub description: Option<String>,
    pub datafiles: Vec<NewDatafile>,
}

#[derive(Debug, Clone)]
pub struct XmlDocumentParser {
    store: Store,
}

impl XmlDocumentParser {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn apply(
        &self,
        catalog: &dyn Catalog,
        content: DocumentContent,
        expid: ExperimentId,
    ) -> Result<(ExperimentId, String), HarvestError> {
        let mut experiment = catalog
            .get_experiment(expid)?
            .ok_or_else(|| HarvestError::MetsParse(format!("experiment {expid} does not exist")))?;
        let title = content
            .title
            .filter(|title| !title.trim().is_empty())
            .ok_or_else(|| HarvestError::MetsParse("document declares no title".to_string()))?;
        experiment.title = title;
        if let Some(description) = content.description {
            experiment.description = description;
        }
        catalog.update_experiment(&experiment)?;
        for datafile in content.datafiles {
            catalog.add_datafile(expid, datafile)?;
        }
        let sync_root = self.store.get_or_create_experiment_dir(expid)?;
        Ok((expid, sync_root.to_string()))
    }
}

impl DocumentParser for XmlDocumentParser {
    fn process_simple(
        &self,
        catalog: &dyn Catalog,
        path: &Utf8Path,
        created_by: &LocalUser,
        expid: ExperimentId,
    ) -> Result<(ExperimentId, String), HarvestError> {
        tracing::debug!(%path, user = %created_by.username, "processing simple experiment XML");
        let content = parse_simple_content(&read_document(path)?)?;
        self.apply(catalog, content, expid)
    }

    fn parse_mets(
        &self,
        catalog: &dyn Catalog,
        path: &Utf8Path,
        created_by: &LocalUser,
        expid: ExperimentId,
    ) -> Result<(ExperimentId, String), HarvestError> {
        tracing::debug!(%path, user = %created_by.username, "processing METS");
        let content = parse_mets_content(&read_document(path)?)?;
        self.apply(catalog, content, expid)
    }
}

fn read_document(path: &Utf8Path) -> Result<String, HarvestError> {
    std::fs::read_to_string(path.as_std_path())
        .map_err(|err| HarvestError::MetsParse(format!("read {path}: {err}")))
}

pub fn parse_mets_content(xml: &str) -> Result<DocumentContent, HarvestError> {
    let mut content = DocumentContent::default();
    let mut pending_file: Option<PendingFile> = None;

    walk(xml, "mets", |event| {
        match event {
            Node::Open { name: "file", start } => {
                pending_file = Some(PendingFile {
                    id: attribute(start, "ID")?,
                    owner_id: attribute(start, "OWNERID")?,
                    size: parse_size(attribute(start, "SIZE")?)?,
                    href: None,
                });
            }
            Node::Open {
                name: "FLocat",
                start,
            } => {
                if let Some(file) = pending_file.as_mut() {
                    file.href = attribute(start, "href")?;
                }
            }
            Node::Close { name: "file", .. } => {
                if let Some(file) = pending_file.take() {
                    content.datafiles.push(file.finish()?);
                }
            }
            Node::Close {
                name: "title",
                text,
            } if content.title.is_none() => content.title = Some(text.trim().to_string()),
            Node::Close {
                name: "abstract",
                text,
            } if content.description.is_none() => {
                content.description = Some(text.trim().to_string())
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(content)
}

pub fn parse_simple_content(xml: &str) -> Result<DocumentContent, HarvestError> {
    let mut content = DocumentContent::default();

    walk(xml, "experiment", |event| {
        match event {
            Node::Open {
                name: "datafile",
                start,
            } => {
                let url = attribute(start, "url")?;
                let name = attribute(start, "name")?;
                let filename = name
                    .or_else(|| url.as_deref().map(basename))
                    .ok_or_else(|| {
                        HarvestError::MetsParse("datafile has neither name nor url".to_string())
                    })?;
                content.datafiles.push(NewDatafile {
                    filename,
                    url,
                    size: parse_size(attribute(start, "size")?)?,
                });
            }
            Node::Close {
                name: "title",
                text,
            } if content.title.is_none() => content.title = Some(text.trim().to_string()),
            Node::Close {
                name: "description",
                text,
            } if content.description.is_none() => {
                content.description = Some(text.trim().to_string())
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(content)
}

struct PendingFile {
    id: Option<String>,
    owner_id: Option<String>,
    size: Option<u64>,
    href: Option<String>,
}

impl PendingFile {
    fn finish(self) -> Result<NewDatafile, HarvestError> {
        let filename = self
            .owner_id
            .or_else(|| self.href.as_deref().map(basename))
            .or(self.id)
            .ok_or_else(|| HarvestError::MetsParse("mets:file has no name".to_string()))?;
        Ok(NewDatafile {
            filename,
            url: self.href,
            size: self.size,
        })
    }
}

enum Node<'e> {
    Open {
        name: &'e str,
        start: &'e BytesStart<'e>,
    },
    Close {
        name: &'e str,
        text: &'e str,
    },
}

fn walk<V>(xml: &str, root: &str, mut visit: V) -> Result<(), HarvestError>
where
    V: FnMut(Node<'_>) -> Result<(), HarvestError>,
{
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut depth = 0usize;
    let mut saw_root = false;
    let mut names: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|err| HarvestError::MetsParse(format!("malformed document: {err}")))?;
        match event {
            Event::Start(start) if !saw_root => {
                expect_root(&start, root)?;
                saw_root = true;
                names.push(root.to_string());
                depth += 1;
            }
            Event::Empty(start) if !saw_root => {
                expect_root(&start, root)?;
                saw_root = true;
            }
            Event::Start(start) => {
                let name = local_name(&start);
                visit(Node::Open {
                    name: &name,
                    start: &start,
                })?;
                names.push(name);
                depth += 1;
                text.clear();
            }
            Event::Empty(start) => {
                let name = local_name(&start);
                visit(Node::Open {
                    name: &name,
                    start: &start,
                })?;
                visit(Node::Close {
                    name: &name,
                    text: "",
                })?;
                text.clear();
            }
            Event::Text(content) => {
                let content = content
                    .unescape()
                    .map_err(|err| HarvestError::MetsParse(format!("malformed text: {err}")))?;
                text.push_str(&content);
            }
            Event::CData(content) => {
                text.push_str(&String::from_utf8_lossy(&content.into_inner()));
            }
            Event::End(_) => {
                let name = names
                    .pop()
                    .ok_or_else(|| HarvestError::MetsParse("unbalanced end tag".to_string()))?;
                depth -= 1;
                if depth > 0 {
                    visit(Node::Close {
                        name: &name,
                        text: &text,
                    })?;
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(HarvestError::MetsParse(format!(
            "document has no <{root}> element"
        )));
    }
    if let Some(open) = names.last() {
        return Err(HarvestError::MetsParse(format!(
            "document ends inside <{open}>"
        )));
    }
    Ok(())
}

fn expect_root(start: &BytesStart<'_>, root: &str) -> Result<(), HarvestError> {
    let name = local_name(start);
    if name == root {
        Ok(())
    } else {
        Err(HarvestError::MetsParse(format!(
            "expected <{root}> document, found <{name}>"
        )))
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn attribute(start: &BytesStart<'_>, wanted: &str) -> Result<Option<String>, HarvestError> {
    for attr in start.attributes() {
        let attr =
            attr.map_err(|err| HarvestError::MetsParse(format!("malformed attribute: {err}")))?;
        if attr.key.local_name().as_ref() == wanted.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| HarvestError::MetsParse(format!("malformed attribute: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn parse_size(value: Option<String>) -> Result<Option<u64>, HarvestError> {
    value
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| HarvestError::MetsParse(format!("invalid file size {raw:?}")))
        })
        .transpose()
}

fn basename(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_string()
}
