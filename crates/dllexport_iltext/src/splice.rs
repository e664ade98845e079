//! Cut the export block out of the stub disassembly and splice it into the target's.

use regex::Regex;

use crate::error::SpliceError;
use crate::names::identifier;

const GLOBAL_METHOD_TRAILER: &str = "// end of global method";

/// The global methods of a patched stub disassembly: from the first top-level `.method` line
/// through the line carrying the last `// end of global method` trailer.
pub fn extract_export_block(text: &str) -> Result<&str, SpliceError> {
    let start = line_starts(text)
        .find(|&offset| text[offset..].starts_with(".method"))
        .ok_or(SpliceError::NoMethods)?;
    let trailer = text.rfind(GLOBAL_METHOD_TRAILER).ok_or(SpliceError::NoTrailer)?;
    if trailer < start {
        return Err(SpliceError::NoTrailer);
    }
    let end = text[trailer..].find('\n').map_or(text.len(), |pos| trailer + pos + 1);
    Ok(&text[start..end])
}

/// Drop `[assembly]` scopes naming `assembly` itself: once spliced, the block lives inside that
/// assembly and its own types are referenced without a scope.
pub fn localize_references(block: &str, assembly: &str) -> String {
    let quoted = identifier(assembly);
    let mut alternatives = vec![regex::escape(assembly)];
    if quoted != assembly {
        alternatives.push(regex::escape(&quoted));
    } else {
        alternatives.push(regex::escape(&format!("'{assembly}'")));
    }
    // The scope is always directly followed by a type name.
    let pattern = format!(r"\[(?:{})\]([A-Za-z_$@`?'])", alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(scope) => scope.replace_all(block, "$1").into_owned(),
        Err(_) => block.to_string(),
    }
}

/// Byte offset where exports go in a target disassembly: the start of the first `.class`
/// (other than a `.class extern` forwarder), `.namespace` or `.method` directive.
pub fn insertion_point(text: &str) -> Option<usize> {
    line_starts(text).find_map(|offset| {
        let line = &text[offset..];
        let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
        let directive = &line[indent..];
        let is_type = directive.starts_with(".class ") && !directive.starts_with(".class extern ");
        let is_anchor = is_type || directive.starts_with(".method ") || directive.starts_with(".namespace ");
        is_anchor.then_some(offset)
    })
}

/// Insert `block` into `target` at its [`insertion_point`].
pub fn splice(target: &str, block: &str) -> Result<String, SpliceError> {
    let at = insertion_point(target).ok_or(SpliceError::NoInsertionPoint)?;
    let newline = if target.contains("\r\n") { "\r\n" } else { "\n" };

    let mut out = String::with_capacity(target.len() + block.len() + 2);
    out.push_str(&target[..at]);
    out.push_str(block);
    if !block.ends_with('\n') {
        out.push_str(newline);
    }
    out.push_str(&target[at..]);
    Ok(out)
}

fn line_starts(text: &str) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(0).chain(text.match_indices('\n').map(|(pos, _)| pos + 1).filter(move |&pos| pos < text.len()))
}
