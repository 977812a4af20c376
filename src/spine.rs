//! Spine resolution: manifest id -> href, then spine order -> archive paths
//!
//! The resulting path list is the book's linear reading order. Chunk
//! planning and every chapter index in a session are defined against it.

use std::collections::{HashMap, HashSet};

use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::StructureError;
use crate::metadata::{attribute, local_name, xml_error};

/// Ordered chapter paths from the package document's spine.
///
/// Manifest hrefs are resolved against `package_path` (see [`resolve_href`]).
/// `itemref`s whose `idref` has no manifest entry are dropped, as are repeat
/// references to a path already in the list.
pub fn parse_spine_order(
    content: &[u8],
    package_path: &str,
) -> Result<Vec<String>, StructureError> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut idrefs: Vec<String> = Vec::new();
    let mut in_manifest = false;
    let mut in_spine = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(&reader, &e)?;
                match name.as_str() {
                    "manifest" => in_manifest = true,
                    "spine" => in_spine = true,
                    "item" if in_manifest => {
                        let id = attribute(&reader, &e, "id")?;
                        let href = attribute(&reader, &e, "href")?;
                        if let (Some(id), Some(href)) = (id, href) {
                            manifest.entry(id).or_insert(href);
                        }
                    }
                    "itemref" if in_spine => {
                        if let Some(idref) = attribute(&reader, &e, "idref")? {
                            idrefs.push(idref);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let local = e.local_name();
                let name = reader.decoder().decode(local.as_ref()).map_err(xml_error)?;
                match &*name {
                    "manifest" => in_manifest = false,
                    "spine" => in_spine = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    let mut seen = HashSet::new();
    let mut order = Vec::with_capacity(idrefs.len());
    for idref in &idrefs {
        let Some(href) = manifest.get(idref) else {
            log::warn!("[SPINE] itemref '{}' has no manifest entry", idref);
            continue;
        };
        let path = resolve_href(package_path, href);
        if seen.insert(path.clone()) {
            order.push(path);
        } else {
            log::warn!("[SPINE] duplicate spine reference to {}", path);
        }
    }
    Ok(order)
}

/// Resolve a manifest href to an archive entry path.
///
/// The href is percent-decoded, its fragment dropped, and it is joined to the
/// package document's directory with `.`/`..` segments normalized.
pub fn resolve_href(package_path: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let decoded = percent_decode_str(href).decode_utf8_lossy();
    if let Some(absolute) = decoded.strip_prefix('/') {
        return normalize_path(absolute);
    }

    match package_path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => normalize_path(&format!("{}/{}", dir, decoded)),
        _ => normalize_path(&decoded),
    }
}

fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts.join("/")
}
