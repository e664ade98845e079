//! Layering guardrails for the workspace manifest.
//!
//! The in-memory module builder (`dllexport_metadata`'s `test-support` feature) may only be enabled
//! from `[dev-dependencies]`, so the shipped binary never carries fixture code. The text crate stays
//! free of the metadata crate: it works on disassembly text alone.

/// Lines of `table` in `manifest`, comments stripped.
fn table_lines<'a>(manifest: &'a str, table: &str) -> Vec<&'a str> {
    let mut inside = false;
    let mut lines = Vec::new();
    for raw_line in manifest.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.starts_with('[') {
            inside = line == table;
            continue;
        }
        if inside && !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

#[test]
fn test_support_feature_is_dev_only() {
    let manifest = include_str!("../Cargo.toml");
    for line in table_lines(manifest, "[dependencies]") {
        assert!(
            !line.contains("test-support"),
            "`test-support` must not be enabled in [dependencies]: {line}"
        );
    }
    assert!(
        table_lines(manifest, "[dev-dependencies]")
            .iter()
            .any(|line| line.starts_with("dllexport_metadata") && line.contains("test-support"))
    );
}

#[test]
fn text_crate_does_not_depend_on_metadata() {
    let manifest = include_str!("../crates/dllexport_iltext/Cargo.toml");
    for line in table_lines(manifest, "[dependencies]") {
        assert!(!line.starts_with("dllexport_metadata"), "unexpected dependency: {line}");
    }
}
