//! Container and package-document metadata parsing using quick-xml SAX-style
//! events
//!
//! `find_package_path` reads `META-INF/container.xml`, `parse_metadata`
//! pulls the Dublin Core fields the library registry needs out of the OPF.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::{MetadataError, ReaderError, StructureError};

/// Standard location of the container descriptor.
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Maximum number of `dc:subject` entries kept as genres
const MAX_GENRES: usize = 64;

/// Dublin Core fields extracted from a package document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageMetadata {
    /// Book title (`dc:title`, first occurrence)
    pub title: String,
    /// Author (`dc:creator`, first occurrence)
    pub author: String,
    /// Description (`dc:description`), empty when absent
    pub description: String,
    /// Genres (`dc:subject`, document order)
    pub genres: Vec<String>,
}

pub(crate) fn xml_error(e: impl std::fmt::Debug) -> StructureError {
    StructureError::Xml(format!("{:?}", e))
}

/// Find the package document path in `container.xml`.
///
/// Returns the `full-path` of the first `<rootfile>` element.
pub fn find_package_path(content: &[u8]) -> Result<String, StructureError> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(&reader, &e)? == "rootfile" {
                    if let Some(path) = attribute(&reader, &e, "full-path")? {
                        if !path.is_empty() {
                            return Ok(path);
                        }
                    }
                    return Err(StructureError::ContainerMalformed);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Err(StructureError::ContainerMalformed)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Creator,
    Description,
    Subject,
}

impl Field {
    fn from_local_name(name: &str) -> Option<Self> {
        match name {
            "title" => Some(Self::Title),
            "creator" => Some(Self::Creator),
            "description" => Some(Self::Description),
            "subject" => Some(Self::Subject),
            _ => None,
        }
    }
}

/// Parse title, author, description and genres from OPF bytes.
///
/// Title and author are required; the rest default to empty.
pub fn parse_metadata(content: &[u8]) -> Result<PackageMetadata, ReaderError> {
    let mut reader = Reader::from_reader(content);

    let mut buf = Vec::new();
    let mut meta = PackageMetadata::default();
    let mut have_title = false;
    let mut have_author = false;
    let mut have_description = false;

    let mut in_metadata = false;
    let mut current: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&reader, &e)?;
                if name == "metadata" {
                    in_metadata = true;
                } else if in_metadata && current.is_none() {
                    current = Field::from_local_name(&name);
                    text.clear();
                }
            }
            Ok(Event::Text(e)) if current.is_some() => {
                let chunk = reader.decoder().decode(&e).map_err(xml_error)?;
                text.push_str(&chunk);
            }
            Ok(Event::CData(e)) if current.is_some() => {
                let chunk = reader.decoder().decode(&e).map_err(xml_error)?;
                text.push_str(&chunk);
            }
            Ok(Event::GeneralRef(e)) if current.is_some() => {
                let entity_name = e.decode().map_err(xml_error)?;
                let entity = format!("&{};", entity_name);
                match quick_xml::escape::unescape(&entity) {
                    Ok(resolved) => text.push_str(&resolved),
                    Err(_) => text.push_str(&entity),
                }
            }
            Ok(Event::End(e)) => {
                let name = reader
                    .decoder()
                    .decode(e.local_name().as_ref())
                    .map_err(xml_error)?
                    .into_owned();
                if name == "metadata" {
                    in_metadata = false;
                    current = None;
                } else if let Some(field) = current {
                    if Field::from_local_name(&name) == Some(field) {
                        let value = text.trim();
                        match field {
                            Field::Title if !have_title && !value.is_empty() => {
                                meta.title = value.to_string();
                                have_title = true;
                            }
                            Field::Creator if !have_author && !value.is_empty() => {
                                meta.author = value.to_string();
                                have_author = true;
                            }
                            Field::Description if !have_description => {
                                meta.description = value.to_string();
                                have_description = true;
                            }
                            Field::Subject
                                if !value.is_empty() && meta.genres.len() < MAX_GENRES =>
                            {
                                meta.genres.push(value.to_string());
                            }
                            _ => {}
                        }
                        current = None;
                        text.clear();
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e).into()),
            _ => {}
        }
        buf.clear();
    }

    if !have_title {
        return Err(MetadataError::MissingField("title").into());
    }
    if !have_author {
        return Err(MetadataError::MissingField("author").into());
    }
    Ok(meta)
}

/// Local (unprefixed) element name.
pub(crate) fn local_name(
    reader: &Reader<&[u8]>,
    e: &BytesStart<'_>,
) -> Result<String, StructureError> {
    Ok(reader
        .decoder()
        .decode(e.local_name().as_ref())
        .map_err(xml_error)?
        .into_owned())
}

/// Value of the attribute whose (unprefixed) key is `key`, unescaped.
pub(crate) fn attribute(
    reader: &Reader<&[u8]>,
    e: &BytesStart<'_>,
    key: &str,
) -> Result<Option<String>, StructureError> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_error)?;
        let local = attr.key.local_name();
        let name = reader.decoder().decode(local.as_ref()).map_err(xml_error)?;
        if name == key {
            let raw = reader.decoder().decode(&attr.value).map_err(xml_error)?;
            let value = match quick_xml::escape::unescape(&raw) {
                Ok(v) => v.into_owned(),
                Err(_) => raw.to_string(),
            };
            return Ok(Some(value));
        }
    }
    Ok(None)
}
