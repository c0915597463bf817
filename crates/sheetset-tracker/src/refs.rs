use std::io::Read;
use std::path::{Component, Path, PathBuf};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use quick_xml::Reader;
use quick_xml::events::Event;
use rustc_hash::FxHashSet;

use crate::error::{Result, TrackerError};

/// Extension accepted by the dataset directory filter.
pub const DATASET_EXTENSION: &str = "xlsx";

/// Editor lock files start with this prefix and are never tracked.
pub const LOCK_FILE_PREFIX: &str = "~$";

const REL_TYPE_EXTERNAL_LINK_PATH: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/externalLinkPath";

/// Characters escaped when a reference path is reported externally.
const REF_PATH_ESCAPE: &AsciiSet = &CONTROLS.add(b' ');

/// Whether a directory entry is a dataset file: regular file, accepted
/// extension, not an editor lock file.
pub fn is_dataset_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let matched_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(DATASET_EXTENSION));
    let locked = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(LOCK_FILE_PREFIX));
    matched_ext && !locked
}

/// The raw linked-file identifiers of a workbook's external-link table.
///
/// Read straight out of the package: every relationship of an
/// `xl/externalLinks` part that points outside the package contributes its
/// target. Deduplicated and sorted for deterministic edge rebuilds.
pub fn external_refs(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut package =
        zip::ZipArchive::new(file).map_err(|e| TrackerError::Package(e.to_string()))?;

    let rels_parts: Vec<String> = package
        .file_names()
        .filter(|name| name.starts_with("xl/externalLinks/_rels/") && name.ends_with(".rels"))
        .map(str::to_string)
        .collect();

    let mut refs = FxHashSet::default();
    for part in rels_parts {
        let mut xml = String::new();
        package
            .by_name(&part)
            .map_err(|e| TrackerError::Package(e.to_string()))?
            .read_to_string(&mut xml)?;
        for target in parse_external_targets(&xml)? {
            refs.insert(target);
        }
    }

    let mut out: Vec<String> = refs.into_iter().collect();
    out.sort();
    Ok(out)
}

/// Pull externally-targeted relationship targets out of one `.rels` part.
pub(crate) fn parse_external_targets(rels_xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(rels_xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut out = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| TrackerError::Xml(e.to_string()))?
        {
            Event::Eof => break,
            Event::Empty(e) | Event::Start(e) if e.local_name().as_ref() == b"Relationship" => {
                let mut ty: Option<String> = None;
                let mut target: Option<String> = None;
                let mut external = false;

                let decoder = reader.decoder();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| TrackerError::Xml(e.to_string()))?;
                    let value = attr
                        .decode_and_unescape_value(decoder)
                        .map_err(|e| TrackerError::Xml(e.to_string()))?
                        .to_string();
                    match attr.key.as_ref() {
                        b"Type" => ty = Some(value),
                        b"Target" => target = Some(value),
                        b"TargetMode" => external = value == "External",
                        _ => {}
                    }
                }

                let link_path = ty.as_deref() == Some(REL_TYPE_EXTERNAL_LINK_PATH);
                if let Some(target) = target
                    && (external || link_path)
                    && !target.is_empty()
                {
                    out.push(target);
                }
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Decode a raw linked-file identifier into a filesystem path string.
pub fn decode_ref_path(raw: &str) -> String {
    let stripped = raw.strip_prefix("file://").unwrap_or(raw);
    percent_decode_str(stripped).decode_utf8_lossy().into_owned()
}

/// Encode a path for reporting as an externally visible reference.
pub fn encode_ref_path(path: &str) -> String {
    utf8_percent_encode(path, REF_PATH_ESCAPE).to_string()
}

/// Resolve a decoded reference against the dependent file's directory and
/// normalize it lexically (the target may not exist yet).
pub fn resolve_ref_path(dependent: &Path, decoded: &str) -> PathBuf {
    let reference = Path::new(decoded);
    let joined = if reference.is_absolute() {
        reference.to_path_buf()
    } else {
        dependent
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(reference)
    };
    normalize_path(&joined)
}

/// Lexical normalization: resolves `.` and `..` components without touching
/// the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_external_relationship_targets() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1"
    Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/externalLinkPath"
    Target="shared%20data.xlsx" TargetMode="External"/>
  <Relationship Id="rId2"
    Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image"
    Target="../media/image1.png"/>
</Relationships>"#;
        let targets = parse_external_targets(xml).unwrap();
        assert_eq!(targets, vec!["shared%20data.xlsx"]);
    }

    #[test]
    fn decodes_uri_style_identifiers() {
        assert_eq!(decode_ref_path("shared%20data.xlsx"), "shared data.xlsx");
        assert_eq!(
            decode_ref_path("file:///tmp/ds/Parent.xlsx"),
            "/tmp/ds/Parent.xlsx"
        );
        assert_eq!(encode_ref_path("shared data.xlsx"), "shared%20data.xlsx");
    }

    #[test]
    fn resolves_relative_to_the_dependent_directory() {
        let dependent = Path::new("/data/sets/main.xlsx");
        assert_eq!(
            resolve_ref_path(dependent, "shared.xlsx"),
            PathBuf::from("/data/sets/shared.xlsx")
        );
        assert_eq!(
            resolve_ref_path(dependent, "../other/ref.xlsx"),
            PathBuf::from("/data/other/ref.xlsx")
        );
    }

    #[test]
    fn dataset_filter_skips_locks_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("a.xlsx");
        let lock = dir.path().join("~$a.xlsx");
        let other = dir.path().join("a.txt");
        for p in [&ok, &lock, &other] {
            std::fs::write(p, b"x").unwrap();
        }
        assert!(is_dataset_file(&ok));
        assert!(!is_dataset_file(&lock));
        assert!(!is_dataset_file(&other));
        assert!(!is_dataset_file(dir.path()));
    }
}
