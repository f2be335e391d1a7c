//! `merge` and `hash` subcommands: run the merge strategies and the hasher on local files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kmerge_core::{Kind, Payload};
use kmerge_merge::{content_hash, MergeStrategy};

/// Merge `files` in the given order; later files win.
pub fn merge_files(kind: Kind, files: &[PathBuf]) -> Result<Vec<u8>> {
    let blobs = files.iter().map(|p| read(p)).collect::<Result<Vec<_>>>()?;
    let refs: Vec<&[u8]> = blobs.iter().map(Vec::as_slice).collect();
    let merged = kind.merge(&refs).with_context(|| format!("{kind} merge"))?;
    Ok(merged)
}

/// Digest of the payload made of `KEY=FILE` entries, as written to the hash tag.
pub fn hash_entries(entries: &[(String, PathBuf)]) -> Result<String> {
    let mut payload = Payload::new();
    for (key, path) in entries {
        payload.insert(key.clone(), read(path)?);
    }
    Ok(content_hash(&payload))
}

/// Clap value parser for `KEY=FILE`.
pub fn parse_entry(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((key, path)) if !key.is_empty() && !path.is_empty() => Ok((key.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected KEY=FILE, got {s:?}")),
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn merges_files_in_argument_order() {
        let (a, b) = (file(r#"{"x":1,"n":{"a":1}}"#), file(r#"{"x":2,"n":{"b":2}}"#));
        let out = merge_files(Kind::Json, &[a.path().into(), b.path().into()]).unwrap();
        assert_eq!(out, br#"{"n":{"a":1,"b":2},"x":2}"#);
        let out = merge_files(Kind::Raw, &[b.path().into(), a.path().into()]).unwrap();
        assert_eq!(out, br#"{"x":2,"n":{"b":2}}{"x":1,"n":{"a":1}}"#);
    }

    #[test]
    fn merge_reports_bad_input() {
        let bad = file("- just\n- a list\n");
        let err = merge_files(Kind::Yaml, &[bad.path().into()]).unwrap_err();
        assert!(format!("{err:#}").contains("not a mapping"), "{err:#}");
        assert!(merge_files(Kind::Raw, &[PathBuf::from("/nonexistent/blob")]).is_err());
    }

    #[test]
    fn hash_matches_payload_digest() {
        let f = file("value");
        let got = hash_entries(&[("k".into(), f.path().into())]).unwrap();
        let want = content_hash(&Payload::from([("k".to_string(), b"value".to_vec())]));
        assert_eq!(got, want);
    }

    #[test]
    fn entry_parser() {
        assert_eq!(parse_entry("app.yaml=./a.yaml").unwrap(), ("app.yaml".into(), PathBuf::from("./a.yaml")));
        assert!(parse_entry("novalue").is_err());
        assert!(parse_entry("=x").is_err());
    }
}
