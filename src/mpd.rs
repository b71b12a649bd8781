//! Widevine protection header lookup in DASH manifests.
use base64::Engine;
use roxmltree::{Document, Node};
use tracing::debug;

use crate::error::{Error, Result};

/// `schemeIdUri` identifying Widevine `ContentProtection` declarations.
pub const WIDEVINE_SCHEME_ID_URI: &str = "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";

/// Return the decoded Widevine `pssh` payload of an MPD document.
///
/// Declarations on an `AdaptationSet` win over those on its `Representation`s,
/// and within a level the first declaration in document order wins.
pub fn locate_protection_header(manifest: &str) -> Result<Vec<u8>> {
    let doc = parse(manifest)?;
    let payload = pssh_payloads(&doc).into_iter().next().ok_or(Error::NotFound)?;
    decode_payload(payload)
}

/// Return every decoded Widevine `pssh` payload, in lookup precedence order.
pub fn locate_all_protection_headers(manifest: &str) -> Result<Vec<Vec<u8>>> {
    let doc = parse(manifest)?;
    let payloads = pssh_payloads(&doc);
    if payloads.is_empty() {
        return Err(Error::NotFound);
    }
    payloads.into_iter().map(decode_payload).collect()
}

fn parse(manifest: &str) -> Result<Document<'_>> {
    Document::parse(manifest).map_err(|e| Error::InvalidManifest(e.to_string()))
}

fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    debug!(len = bytes.len(), "Located Widevine protection header");
    Ok(bytes)
}

fn pssh_payloads<'a, 'input: 'a>(doc: &'a Document<'input>) -> Vec<&'a str> {
    let adaptation_sets: Vec<Node<'a, 'input>> = children(doc.root_element(), "Period")
        .flat_map(|period| children(period, "AdaptationSet"))
        .collect();

    let outer = adaptation_sets
        .iter()
        .flat_map(|set| widevine_payloads(*set));
    let inner = adaptation_sets
        .iter()
        .flat_map(|set| children(*set, "Representation"))
        .flat_map(widevine_payloads);

    outer.chain(inner).collect()
}

fn widevine_payloads<'a, 'input: 'a>(
    parent: Node<'a, 'input>,
) -> impl Iterator<Item = &'a str> + 'a {
    children(parent, "ContentProtection")
        .filter(|cp| cp.attribute("schemeIdUri") == Some(WIDEVINE_SCHEME_ID_URI))
        .filter_map(|cp| {
            children(cp, "pssh")
                .filter_map(|pssh| pssh.text())
                .map(str::trim)
                .find(|text| !text.is_empty())
        })
}

fn children<'a, 'input: 'a>(
    parent: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    parent
        .children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}
