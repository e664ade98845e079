//! End-to-end export runs against a scripted `ilasm`/`ildasm`.
//!
//! The fake assembler "assembles" by copying its source to the output path, so every binary the
//! pipeline produces is readable IL text. The fake disassembler turns such a stub binary back
//! into ildasm-shaped text (instruction labels and method trailers), and answers for the target
//! assembly with a canned disassembly.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use dllexport::pipeline::scan;
use dllexport::toolchain::switch;
use dllexport::{ExportError, ExportOptions, ExportOutcome, ExportPipeline, Tool, ToolOutput, Toolchain, ToolchainError};
use dllexport_metadata::Assembly;
use dllexport_metadata::testing::CalcFixture;

const TARGET_IL: &str = "\
//  Microsoft (R) .NET Framework IL Disassembler.

.assembly extern mscorlib
{
  .publickeytoken = (B7 7A 5C 56 19 34 E0 89 )
  .ver 4:0:0:0
}
.assembly Calc
{
  .ver 1:0:0:0
}
.module Calc.dll
.corflags 0x00000001

.class public auto ansi sealed beforefieldinit Acme.DllExportAttribute
       extends [mscorlib]System.Attribute
{
} // end of class Acme.DllExportAttribute

.class public auto ansi beforefieldinit Acme.Calc
       extends [mscorlib]System.Object
{
  .method public hidebysig static int32 Add(int32 a, int32 b) cil managed
  {
    .maxstack  8
    IL_0000:  ldarg.0
    IL_0001:  ldarg.1
    IL_0002:  add
    IL_0003:  ret
  } // end of method Calc::Add
} // end of class Acme.Calc
";

const ORIGINAL_IMAGE: &[u8] = b"MZ original image bytes";

#[derive(Default)]
struct FakeToolchain {
    target_il: String,
    /// The resource dump leaves a `.res` beside its output.
    resources: bool,
    /// Fail the nth (zero-based) call of this tool.
    fail: Option<(Tool, usize)>,
    calls: RefCell<Vec<(Tool, Vec<String>)>>,
}

impl FakeToolchain {
    fn new() -> Self {
        Self {
            target_il: TARGET_IL.to_string(),
            ..Self::default()
        }
    }

    fn failing(tool: Tool, nth: usize) -> Self {
        Self {
            fail: Some((tool, nth)),
            ..Self::new()
        }
    }

    fn calls(&self) -> Vec<(Tool, Vec<String>)> {
        self.calls.borrow().clone()
    }

    fn assembler_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(tool, _)| *tool == Tool::Assembler)
            .map(|(_, args)| args)
            .collect()
    }
}

impl Toolchain for FakeToolchain {
    fn locate(&self, tool: Tool) -> Result<PathBuf, ToolchainError> {
        Ok(PathBuf::from(tool.file_name()))
    }

    fn run(&self, tool: Tool, args: &[String], _working_dir: &Path) -> Result<ToolOutput, ToolchainError> {
        let nth = self.calls.borrow().iter().filter(|(t, _)| *t == tool).count();
        self.calls.borrow_mut().push((tool, args.to_vec()));
        if self.fail == Some((tool, nth)) {
            return Ok(ToolOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("{tool}: scripted failure"),
            });
        }

        let input = input_of(args);
        match tool {
            Tool::Assembler => {
                let output = value_of(args, "output").unwrap();
                fs::copy(input, output).unwrap();
                Ok(ToolOutput::default())
            }
            Tool::Disassembler => {
                if let Some(out) = value_of(args, "out") {
                    fs::write(out, &self.target_il).unwrap();
                    if self.resources {
                        fs::write(Path::new(out).with_extension("res"), b"RES").unwrap();
                    }
                    return Ok(ToolOutput::default());
                }
                let is_stub = input.file_name().unwrap().to_string_lossy().starts_with('$');
                let stdout = if is_stub {
                    fake_ildasm(&fs::read_to_string(input).unwrap())
                } else {
                    self.target_il.clone()
                };
                Ok(ToolOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                })
            }
        }
    }
}

fn value_of<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("{}=", switch(name));
    args.iter().find_map(|arg| arg.strip_prefix(prefix.as_str()))
}

fn input_of(args: &[String]) -> &Path {
    let prefix = switch("");
    Path::new(args.iter().find(|arg| !arg.starts_with(&prefix)).unwrap())
}

/// Label instructions and add method trailers the way ildasm prints global methods.
fn fake_ildasm(source: &str) -> String {
    let mut out = String::new();
    let mut method: Option<String> = None;
    let mut offset = 0;
    for line in source.lines() {
        if line.starts_with(".method") {
            let head = &line[..line.rfind('(').unwrap()];
            method = head.rsplit(' ').next().map(str::to_string);
            offset = 0;
            out.push_str(line);
        } else if line == "}" && method.is_some() {
            out.push_str(&format!("}} // end of global method {}", method.take().unwrap()));
        } else if method.is_some() && line.starts_with("  ") && !line.trim_start().starts_with('.') {
            out.push_str(&format!("  IL_{offset:04x}:  {}", line.trim_start()));
            offset += 5;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out.push_str("\n// *********** DISASSEMBLY COMPLETE ***********************\n");
    out
}

struct Workspace {
    _dir: tempfile::TempDir,
    work: PathBuf,
    target: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let target = dir.path().join("Calc.dll");
        fs::write(&target, ORIGINAL_IMAGE).unwrap();
        Self { _dir: dir, work, target }
    }

    fn options(&self) -> ExportOptions {
        ExportOptions {
            quiet: true,
            work_dir: self.work.clone(),
            ..ExportOptions::default()
        }
    }

    fn merge_options(&self) -> ExportOptions {
        ExportOptions {
            merge: true,
            ..self.options()
        }
    }

    fn work_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.work)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// `Add` (cdecl) and `Sub` (stdcall), as in the sample class.
fn calc_assembly() -> Assembly {
    let mut fixture = CalcFixture::new();
    fixture.binary_method("Add", Some((Some("Add"), 2)));
    fixture.binary_method("Sub", Some((Some("Sub"), 3)));
    Assembly::from_metadata(&fixture.metadata()).unwrap()
}

fn backup_of(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

#[test]
fn test_standalone_export_writes_stub_assembly() {
    let ws = Workspace::new();
    let tools = FakeToolchain::new();

    let outcome = ExportPipeline::new(&tools, ws.options())
        .export(&calc_assembly(), &ws.target)
        .unwrap();

    let output = ws.work.join("$Calc.dll");
    assert_eq!(outcome, ExportOutcome::Standalone {
        output: output.clone(),
        exports: 2,
    });
    let il = fs::read_to_string(&output).unwrap();
    assert!(il.contains("  .export [0] as Add\n"));
    assert!(il.contains("  .export [1] as Sub\n"));
    assert!(il.contains("Add(int32 a, int32 b)"));
    assert!(il.contains("modopt([mscorlib]System.Runtime.CompilerServices.CallConvCdecl) Add("));
    assert!(il.contains("modopt([mscorlib]System.Runtime.CompilerServices.CallConvStdcall) Sub("));
    assert!(il.contains("call int32 [Calc]Acme.Calc::Add(int32, int32)"));
    assert!(!il.contains("ldstr"));

    assert_eq!(fs::read(&ws.target).unwrap(), ORIGINAL_IMAGE);
    assert!(!backup_of(&ws.target).exists());
    assert_eq!(ws.work_files(), vec!["$Calc.dll".to_string()]);
}

#[test]
fn test_tool_sequence_for_standalone_run() {
    let ws = Workspace::new();
    let tools = FakeToolchain::new();
    ExportPipeline::new(&tools, ws.options())
        .export(&calc_assembly(), &ws.target)
        .unwrap();

    let sequence: Vec<Tool> = tools.calls().into_iter().map(|(tool, _)| tool).collect();
    assert_eq!(sequence, vec![Tool::Assembler, Tool::Disassembler, Tool::Assembler]);

    let (_, disassembly) = &tools.calls()[1];
    assert_eq!(disassembly[..3], [switch("text"), switch("nobar"), switch("typelist")]);
    for args in tools.assembler_calls() {
        assert_eq!(args[0], switch("dll"));
        assert!(!args.contains(&switch("debug")));
    }
}

#[test]
fn test_malformed_attributes_become_warnings() {
    let ws = Workspace::new();
    let mut fixture = CalcFixture::new();
    fixture.binary_method("Add", Some((Some("Add"), 2)));
    fixture.binary_method("Mul", Some((None, 2)));
    fixture.binary_method("Div", Some((Some(""), 3)));
    fixture.binary_method("Neg", None);
    fixture.binary_method("Sub", Some((Some("Sub"), 3)));
    let assembly = Assembly::from_metadata(&fixture.metadata()).unwrap();

    let report = scan(&assembly);
    assert_eq!(report.members.len(), 2);
    assert_eq!(report.warnings.len(), 2);

    let tools = FakeToolchain::new();
    let outcome = ExportPipeline::new(&tools, ws.options())
        .export(&assembly, &ws.target)
        .unwrap();
    assert!(matches!(outcome, ExportOutcome::Standalone { exports: 2, .. }));

    let il = fs::read_to_string(ws.work.join("$Calc.dll")).unwrap();
    assert_eq!(il.matches(".export [").count(), 2);
    assert!(il.contains(".export [0] as Add"));
    assert!(il.contains(".export [1] as Sub"));
    assert!(!il.contains("Mul("));
    assert!(!il.contains("Div("));
}

#[test]
fn test_no_exports_touches_nothing() {
    let ws = Workspace::new();
    let mut fixture = CalcFixture::new();
    fixture.binary_method("Add", None);
    let assembly = Assembly::from_metadata(&fixture.metadata()).unwrap();
    let tools = FakeToolchain::new();

    let err = ExportPipeline::new(&tools, ws.merge_options())
        .export(&assembly, &ws.target)
        .unwrap_err();

    assert!(matches!(err, ExportError::NoExports { .. }));
    assert!(tools.calls().is_empty());
    assert!(ws.work_files().is_empty());
    assert_eq!(fs::read(&ws.target).unwrap(), ORIGINAL_IMAGE);
}

#[test]
fn test_already_processed_assembly_is_refused() {
    let ws = Workspace::new();
    let mut assembly = calc_assembly();
    assembly.has_native_exports = true;
    let tools = FakeToolchain::new();

    let err = ExportPipeline::new(&tools, ws.options())
        .export(&assembly, &ws.target)
        .unwrap_err();
    assert!(matches!(err, ExportError::AlreadyProcessed { .. }));
    assert!(tools.calls().is_empty());
}

#[test]
fn test_merge_splices_exports_and_keeps_backup() {
    let ws = Workspace::new();
    let tools = FakeToolchain::new();

    let outcome = ExportPipeline::new(&tools, ws.merge_options())
        .export(&calc_assembly(), &ws.target)
        .unwrap();

    let backup = backup_of(&ws.target);
    assert_eq!(outcome, ExportOutcome::Merged {
        target: ws.target.clone(),
        backup: backup.clone(),
        exports: 2,
    });
    assert_eq!(fs::read(&backup).unwrap(), ORIGINAL_IMAGE);

    let merged = fs::read_to_string(&ws.target).unwrap();
    assert_eq!(merged.matches(".export [").count(), 2);
    assert!(merged.find(".export [0] as Add").unwrap() < merged.find(".class public").unwrap());
    assert!(merged.contains("Acme.Calc::Add(int32, int32)"));
    assert!(!merged.contains("[Calc]Acme"));

    // Cutting the spliced block back out leaves the original disassembly untouched.
    let start = merged.find(".method public static").unwrap();
    let trailer = merged.rfind("} // end of global method").unwrap();
    let end = trailer + merged[trailer..].find('\n').unwrap() + 1;
    assert_eq!(format!("{}{}", &merged[..start], &merged[end..]), TARGET_IL);

    assert!(ws.work_files().is_empty());
}

#[test]
fn test_merge_tool_sequence_and_resources() {
    let ws = Workspace::new();
    let tools = FakeToolchain {
        resources: true,
        ..FakeToolchain::new()
    };

    ExportPipeline::new(&tools, ws.merge_options())
        .export(&calc_assembly(), &ws.target)
        .unwrap();

    let sequence: Vec<Tool> = tools.calls().into_iter().map(|(tool, _)| tool).collect();
    assert_eq!(sequence, vec![
        Tool::Assembler,
        Tool::Disassembler,
        Tool::Disassembler,
        Tool::Disassembler,
        Tool::Assembler,
    ]);

    let (_, dump) = &tools.calls()[2];
    assert_eq!(value_of(dump, "out").map(PathBuf::from), Some(ws.work.join("$Calc.il")));

    let last = tools.assembler_calls().pop().unwrap();
    let resource = ws.work.join("$Calc.res");
    assert!(last.contains(&format!("{}={}", switch("resource"), resource.display())));
    assert!(!resource.exists());
}

#[test]
fn test_second_merge_replaces_stale_backup() {
    let ws = Workspace::new();
    fs::write(backup_of(&ws.target), b"stale").unwrap();
    let tools = FakeToolchain::new();

    ExportPipeline::new(&tools, ws.merge_options())
        .export(&calc_assembly(), &ws.target)
        .unwrap();
    assert_eq!(fs::read(backup_of(&ws.target)).unwrap(), ORIGINAL_IMAGE);
}

#[test]
fn test_failing_stub_assembly_reports_tool_output() {
    let ws = Workspace::new();
    let tools = FakeToolchain::failing(Tool::Assembler, 0);

    let err = ExportPipeline::new(&tools, ws.options())
        .export(&calc_assembly(), &ws.target)
        .unwrap_err();

    match &err {
        ExportError::Tool { action, details, .. } => {
            assert_eq!(*action, "assemble the stub module");
            assert!(details.contains("scripted failure"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("More Information:"));
    assert_eq!(tools.calls().len(), 1);
    assert!(ws.work_files().is_empty());
}

#[test]
fn test_failing_merge_assembly_leaves_target_alone() {
    let ws = Workspace::new();
    let tools = FakeToolchain::failing(Tool::Assembler, 1);

    let err = ExportPipeline::new(&tools, ws.merge_options())
        .export(&calc_assembly(), &ws.target)
        .unwrap_err();

    assert!(matches!(err, ExportError::Tool { action: "assemble the merged assembly", .. }));
    assert_eq!(fs::read(&ws.target).unwrap(), ORIGINAL_IMAGE);
    assert!(!backup_of(&ws.target).exists());
}

#[test]
fn test_failing_target_disassembly_is_fatal() {
    let ws = Workspace::new();
    // Calls: stub, resource dump, target text.
    let tools = FakeToolchain::failing(Tool::Disassembler, 2);

    let err = ExportPipeline::new(&tools, ws.merge_options())
        .export(&calc_assembly(), &ws.target)
        .unwrap_err();
    assert!(matches!(err, ExportError::Tool { action: "disassemble the target assembly", .. }));
    assert_eq!(fs::read(&ws.target).unwrap(), ORIGINAL_IMAGE);
}

#[test]
fn test_failing_resource_dump_is_not_fatal() {
    let ws = Workspace::new();
    let tools = FakeToolchain::failing(Tool::Disassembler, 1);

    let outcome = ExportPipeline::new(&tools, ws.merge_options())
        .export(&calc_assembly(), &ws.target)
        .unwrap();
    assert!(matches!(outcome, ExportOutcome::Merged { exports: 2, .. }));
}

#[test]
fn test_keep_temp_files_leaves_intermediates() {
    let ws = Workspace::new();
    let tools = FakeToolchain::new();
    let options = ExportOptions {
        keep_temp_files: true,
        ..ws.options()
    };

    ExportPipeline::new(&tools, options)
        .export(&calc_assembly(), &ws.target)
        .unwrap();
    assert_eq!(ws.work_files(), vec![
        "$Calc.dll".to_string(),
        "$Calc.il".to_string(),
        "$Calc.stub.il".to_string(),
    ]);
}

#[test]
fn test_debug_keeps_final_source_and_passes_switch() {
    let ws = Workspace::new();
    let tools = FakeToolchain::new();
    let options = ExportOptions {
        debug: true,
        ..ws.options()
    };

    ExportPipeline::new(&tools, options)
        .export(&calc_assembly(), &ws.target)
        .unwrap();
    for args in tools.assembler_calls() {
        assert!(args.contains(&switch("debug")));
    }
    assert!(ws.work.join("$Calc.il").exists());
    assert!(!ws.work.join("$Calc.stub.il").exists());
}

#[test]
fn test_run_loads_image_from_disk() {
    let ws = Workspace::new();
    let mut fixture = CalcFixture::new();
    fixture.binary_method("Add", Some((Some("Add"), 2)));
    fs::write(&ws.target, fixture.builder.finish_image(false)).unwrap();
    let tools = FakeToolchain::new();

    let outcome = ExportPipeline::new(&tools, ws.options()).run(&ws.target).unwrap();
    assert!(matches!(outcome, ExportOutcome::Standalone { exports: 1, .. }));
}

#[test]
fn test_run_refuses_image_with_vtable_fixups() {
    let ws = Workspace::new();
    let fixture = CalcFixture::new();
    fs::write(&ws.target, fixture.builder.finish_image(true)).unwrap();
    let tools = FakeToolchain::new();

    let err = ExportPipeline::new(&tools, ws.options()).run(&ws.target).unwrap_err();
    assert!(matches!(err, ExportError::AlreadyProcessed { .. }));
}

#[test]
fn test_run_reports_missing_and_unreadable_input() {
    let ws = Workspace::new();
    let tools = FakeToolchain::new();
    let pipeline = ExportPipeline::new(&tools, ws.options());

    let err = pipeline.run(&ws.work.join("Missing.dll")).unwrap_err();
    assert!(matches!(err, ExportError::MissingInput { .. }));

    let err = pipeline.run(&ws.target).unwrap_err();
    assert!(matches!(err, ExportError::Load { .. }));
    assert!(tools.calls().is_empty());
}
