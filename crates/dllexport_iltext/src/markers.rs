//! Export markers and the pass that turns them into `.export` directives.
//!
//! A stub's first instruction loads the marker text as a string. Once the stub module has been
//! disassembled, that line reads `IL_0000:  ldstr ".export [0] as Add"`; replacing the whole
//! instruction with the unquoted string leaves a valid `.export` directive at the top of the body.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::PatchError;
use crate::names::{identifier, unescape_literal};

static LDSTR_AT_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?P<indent>[ \t]*)IL_0000:\s*ldstr\s+"(?P<body>(?:[^"\\]|\\.)*)"\s*$"#)
        .unwrap_or_else(|e| unreachable!("marker pattern is valid: {e}"))
});

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\.export \[(?P<index>\d+)\] as (?P<name>.+)$")
        .unwrap_or_else(|e| unreachable!("marker pattern is valid: {e}"))
});

/// Correlates a synthesized stub with the name it is exported under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportMarker {
    pub index: usize,
    pub exported_name: String,
}

impl ExportMarker {
    pub fn new(index: usize, exported_name: impl Into<String>) -> Self {
        Self {
            index,
            exported_name: exported_name.into(),
        }
    }

    /// Parse marker text; `None` when the text is not marker-shaped.
    pub fn parse(text: &str) -> Option<(usize, &str)> {
        let caps = MARKER.captures(text)?;
        let index = caps.name("index")?.as_str().parse().ok()?;
        Some((index, caps.name("name")?.as_str()))
    }
}

impl fmt::Display for ExportMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".export [{}] as {}", self.index, identifier(&self.exported_name))
    }
}

/// Rewrite every expected marker line into its `.export` directive.
///
/// Lines that load a non-marker string at `IL_0000` are left alone. A marker with an unknown
/// index, a different name, or one seen twice is an error, as is an expected marker that never
/// shows up.
pub fn patch_markers(text: &str, markers: &[ExportMarker]) -> Result<String, PatchError> {
    let expected: BTreeMap<usize, String> = markers.iter().map(|m| (m.index, m.to_string())).collect();
    let mut seen = BTreeSet::new();
    let mut out = String::with_capacity(text.len());

    for (number, line) in text.split_inclusive('\n').enumerate() {
        let (content, ending) = split_line_ending(line);
        let Some(caps) = LDSTR_AT_ENTRY.captures(content) else {
            out.push_str(line);
            continue;
        };
        let body = unescape_literal(caps.name("body").map_or("", |m| m.as_str()));
        let Some((index, _)) = ExportMarker::parse(&body) else {
            out.push_str(line);
            continue;
        };

        let line_number = number + 1;
        let directive = expected.get(&index).ok_or(PatchError::UnknownIndex {
            index,
            line: line_number,
        })?;
        if *directive != body {
            return Err(PatchError::NameMismatch {
                index,
                expected: directive.clone(),
                found: body,
                line: line_number,
            });
        }
        if !seen.insert(index) {
            return Err(PatchError::DuplicateIndex {
                index,
                line: line_number,
            });
        }

        out.push_str(caps.name("indent").map_or("", |m| m.as_str()));
        out.push_str(directive);
        out.push_str(ending);
    }

    if let Some((_, marker)) = expected.iter().find(|(index, _)| !seen.contains(*index)) {
        return Err(PatchError::Missing {
            marker: marker.clone(),
        });
    }
    Ok(out)
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, &line[content.len()..])
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, &line[content.len()..])
    } else {
        (line, "")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const STUB: &str = "\
.method public static int32 modopt([mscorlib]System.Runtime.CompilerServices.CallConvCdecl)
        Add(int32 a,
            int32 b) cil managed
{
  // Code size       15 (0xf)
  .maxstack  3
  IL_0000:  ldstr      \".export [0] as Add\"
  IL_0005:  ldarg.0
  IL_0006:  ldarg.1
  IL_0007:  call       int32 [Calc]Acme.Calc::Add(int32,
                                                  int32)
  IL_000c:  ret
} // end of global method Add
";

    #[test]
    fn test_marker_text() {
        assert_eq!(ExportMarker::new(0, "Add").to_string(), ".export [0] as Add");
        assert_eq!(ExportMarker::new(3, "sub").to_string(), ".export [3] as 'sub'");
    }

    #[test]
    fn test_patch_replaces_instruction_and_keeps_indent() {
        let patched = patch_markers(STUB, &[ExportMarker::new(0, "Add")]).unwrap();
        assert!(patched.contains("\n  .export [0] as Add\n  IL_0005:  ldarg.0\n"));
        assert!(!patched.contains("ldstr"));
        assert_eq!(patched.lines().count(), STUB.lines().count());
    }

    #[test]
    fn test_patch_preserves_crlf() {
        let crlf = STUB.replace('\n', "\r\n");
        let patched = patch_markers(&crlf, &[ExportMarker::new(0, "Add")]).unwrap();
        assert!(patched.contains("\r\n  .export [0] as Add\r\n"));
    }

    #[test]
    fn test_ordinary_strings_at_entry_are_untouched() {
        let text = format!("{STUB}  IL_0000:  ldstr      \"hello\"\n");
        let patched = patch_markers(&text, &[ExportMarker::new(0, "Add")]).unwrap();
        assert!(patched.ends_with("  IL_0000:  ldstr      \"hello\"\n"));
    }

    #[test]
    fn test_unknown_index_is_an_error() {
        let err = patch_markers(STUB, &[ExportMarker::new(1, "Add")]).unwrap_err();
        assert_eq!(err, PatchError::UnknownIndex { index: 0, line: 7 });
    }

    #[test]
    fn test_name_mismatch_is_an_error() {
        let err = patch_markers(STUB, &[ExportMarker::new(0, "Plus")]).unwrap_err();
        assert!(matches!(err, PatchError::NameMismatch { index: 0, .. }));
    }

    #[test]
    fn test_duplicate_marker_is_an_error() {
        let text = format!("{STUB}{STUB}");
        let err = patch_markers(&text, &[ExportMarker::new(0, "Add")]).unwrap_err();
        assert!(matches!(err, PatchError::DuplicateIndex { index: 0, .. }));
    }

    #[test]
    fn test_missing_marker_is_an_error() {
        let markers = [ExportMarker::new(0, "Add"), ExportMarker::new(1, "Sub")];
        let err = patch_markers(STUB, &markers).unwrap_err();
        assert_eq!(
            err,
            PatchError::Missing {
                marker: ".export [1] as Sub".into()
            }
        );
    }

    #[test]
    fn test_keyword_export_name_stays_quoted_in_directive() {
        let marker = ExportMarker::new(3, "sub");
        let literal = crate::names::string_literal(&marker.to_string());
        let text = format!("  IL_0000:  ldstr      {literal}\n");
        let patched = patch_markers(&text, &[marker]).unwrap();
        assert_eq!(patched, "  .export [3] as 'sub'\n");
        assert_eq!(ExportMarker::parse(".export [3] as 'sub'"), Some((3, "'sub'")));
    }

    #[test]
    fn test_quoted_export_names_round_trip_through_literal() {
        let marker = ExportMarker::new(0, "it's");
        let literal = crate::names::string_literal(&marker.to_string());
        let text = format!("  IL_0000:  ldstr      {literal}\n");
        let patched = patch_markers(&text, &[marker]).unwrap();
        assert_eq!(patched, "  .export [0] as 'it\\'s'\n");
    }
}
