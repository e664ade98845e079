//! ILAsm lexical helpers: identifier quoting and string literals.

/// Words ILAsm reserves, either as directives' keywords or as instruction names. An identifier
/// spelled like one of these must be single-quoted.
const RESERVED: &[&str] = &[
    "abstract", "add", "and", "ansi", "any", "arglist", "array", "as", "assembly", "assert", "at", "auto",
    "autochar", "beforefieldinit", "blob", "bool", "box", "br", "break", "bytearray", "call", "calli",
    "callmostderived", "cdecl", "char", "cil", "class", "clsid", "const", "cpblk", "cpobj", "currency",
    "custom", "date", "decimal", "default", "demand", "deny", "div", "dup", "endfault", "endfilter",
    "endfinally", "enum", "error", "explicit", "extends", "extern", "false", "famandassem", "family",
    "famorassem", "fastcall", "fault", "field", "filetime", "filter", "final", "finally", "fixed",
    "float", "float32", "float64", "forwardref", "fromunmanaged", "handler", "hidebysig", "hresult",
    "implements", "import", "in", "inheritcheck", "initblk", "initonly", "instance", "int", "int16",
    "int32", "int64", "int8", "interface", "internalcall", "jmp", "lasterr", "lcid", "ldarg", "ldarga",
    "ldc", "ldelem", "ldelema", "ldfld", "ldflda", "ldftn", "ldind", "ldlen", "ldloc", "ldloca",
    "ldnull", "ldobj", "ldsfld", "ldsflda", "ldstr", "ldtoken", "leave", "linkcheck", "literal",
    "localloc", "lpstr", "lpstruct", "lptstr", "lpvoid", "lpwstr", "managed", "marshal", "method",
    "mkrefany", "modopt", "modreq", "mul", "native", "neg", "nested", "newarr", "newobj", "newslot",
    "noappdomain", "noinlining", "nomachine", "nomangle", "nometadata", "noncasdemand",
    "noncasinheritance", "noncaslinkdemand", "nop", "noprocess", "not", "notremotable", "notserialized",
    "null", "nullref", "object", "objectref", "opt", "optil", "or", "out", "permitonly", "pinned",
    "pinvokeimpl", "pop", "prefix1", "prejitdeny", "prejitgrant", "preservesig", "private",
    "privatescope", "property", "public", "record", "refany", "refanytype", "refanyval", "rem",
    "reqmin", "reqopt", "reqrefuse", "reqsecobj", "request", "ret", "rethrow", "retval",
    "rtspecialname", "runtime", "safearray", "sealed", "sequential", "serializable", "shl", "shr",
    "sizeof", "special", "specialname", "starg", "static", "stdcall", "stelem", "stfld", "stind",
    "stloc", "storage", "stored_object", "stream", "streamed_object", "string", "struct", "stsfld",
    "sub", "switch", "synchronized", "syschar", "sysstring", "tbstr", "thiscall", "throw", "tls", "to",
    "true", "typedref", "unaligned", "unbox", "unicode", "unmanaged", "unmanagedexp", "unsigned",
    "unused", "userdefined", "value", "valuetype", "vararg", "variant", "vector", "virtual", "void",
    "volatile", "wchar", "winapi", "with", "wrapper", "xor",
];

fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '_' | '$' | '@' | '`' | '?')
}

fn is_id_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '@' | '`' | '?')
}

/// Whether `name` can be written as a bare ILAsm identifier.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    is_id_start(first) && chars.all(is_id_continue) && !RESERVED.contains(&name)
}

/// Render a single identifier, single-quoting it when it is not a plain identifier.
pub fn identifier(name: &str) -> String {
    if is_plain_identifier(name) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len() + 2);
    out.push('\'');
    for c in name.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render a dotted name (`Acme.Interop.Calc`), quoting each component on its own.
pub fn dotted_name(name: &str) -> String {
    if name.is_empty() {
        return identifier(name);
    }
    name.split('.').map(identifier).collect::<Vec<_>>().join(".")
}

/// Render a double-quoted ILAsm string literal.
pub fn string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Undo the escapes of a string literal body (without the surrounding quotes).
pub fn unescape_literal(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_identifiers_are_not_quoted() {
        assert_eq!(identifier("Calc"), "Calc");
        assert_eq!(identifier("$Calc"), "$Calc");
        assert_eq!(identifier("_x1"), "_x1");
    }

    #[test]
    fn test_reserved_words_are_quoted() {
        assert_eq!(identifier("add"), "'add'");
        assert_eq!(identifier("value"), "'value'");
        // Case matters: `Add` is a fine identifier.
        assert_eq!(identifier("Add"), "Add");
    }

    #[test]
    fn test_odd_characters_are_quoted_and_escaped() {
        assert_eq!(identifier("<Module>"), "'<Module>'");
        assert_eq!(identifier("it's"), "'it\\'s'");
        assert_eq!(identifier("9lives"), "'9lives'");
        assert_eq!(identifier(""), "''");
    }

    #[test]
    fn test_dotted_names_quote_per_component() {
        assert_eq!(dotted_name("Acme.Calc"), "Acme.Calc");
        assert_eq!(dotted_name("My-Lib.Calc"), "'My-Lib'.Calc");
        assert_eq!(dotted_name("$Calc.dll"), "$Calc.dll");
    }

    #[test]
    fn test_string_literal_escapes() {
        let literal = string_literal("a \"b\" \\ c");
        assert_eq!(literal, r#""a \"b\" \\ c""#);
        assert_eq!(unescape_literal(&literal[1..literal.len() - 1]), "a \"b\" \\ c");
    }
}
