//! Help and sample text.

pub const HELP: &str = r#"
dllexport
---------

Gives static methods of a .NET assembly native, C-callable entry points.
Each export is a small forwarding stub that calls the managed method with
its arguments unchanged.

Mark every method to export with an attribute named DllExportAttribute
(`dllexport --sampleclass` prints one you can copy into your project).

Usage:
   dllexport [options] Assembly.dll

   By default the exports go into a separate assembly, $Assembly.dll, in
   the current directory. The original is left alone, which keeps
   debugging simple during development.

Options:
   --merge              Put the exports into Assembly.dll itself, for
                        release builds. The target is overwritten; the
                        previous file is kept as Assembly.dll.bak.

   --keep-temp-files    Leave intermediate files in the current directory.

   --rescan-tools       Search for ildasm and ilasm again instead of using
                        the locations cached by an earlier run.

   --no-logo            Suppress informational messages.

   --debug              Assemble with debug information and keep the
                        generated IL next to the output.

   --help               Show this help.
   --version            Show the version.
   --sampleclass        Show the DllExportAttribute source to include in
                        your assembly.
   --sampleusage        Show examples of using the attribute.

Environment:
   DLLEXPORT_ILDASM, DLLEXPORT_ILASM   explicit tool paths
   DLLEXPORT_CACHE_DIR                 where tool locations are cached
   RUST_LOG                            log filter (default: info)
   NO_COLOR                            plain console output
"#;

pub const SAMPLE_CLASS: &str = r#"
using System;
using System.Runtime.InteropServices;

/// <summary>
/// Marks a static method for export by dllexport.
/// The namespace does not matter; put the class wherever is convenient.
/// </summary>
[AttributeUsage(AttributeTargets.Method)]
public class DllExportAttribute : Attribute {
    public DllExportAttribute(string exportedName)
        : this(CallingConvention.StdCall, exportedName) {
    }

    public DllExportAttribute(CallingConvention convention, string exportedName) {
        ExportedName = exportedName;
        CallingConvention = convention;
    }

    public string ExportedName { get; set; }
    public CallingConvention CallingConvention { get; set; }
}
"#;

pub const SAMPLE_USAGE: &str = r#"
Using DllExportAttribute
------------------------

Add the attribute class (see --sampleclass) to your project; any namespace
will do. Then tag public static methods:

// The export name does not have to match the method name.
// Without a calling convention, stdcall is used.
[DllExport("add_numbers")]
public static int Add(int left, int right) {
    return left + right;
}

// cdecl, for callers that clean up the stack themselves.
[DllExport(CallingConvention.Cdecl, "scale")]
public static double Scale(double value, float factor) {
    return value * factor;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::scan::MARKER_ATTRIBUTE;

    #[test]
    fn test_samples_name_the_marker_attribute() {
        assert!(SAMPLE_CLASS.contains(&format!("class {MARKER_ATTRIBUTE}")));
        assert!(SAMPLE_CLASS.contains("ExportedName"));
        assert!(SAMPLE_CLASS.contains("CallingConvention CallingConvention"));
        assert!(HELP.contains("--merge"));
    }
}
