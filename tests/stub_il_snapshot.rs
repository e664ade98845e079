//! Snapshot of the stub module source for the sample `Calc` class.

use dllexport::emit::render_stub_module;
use dllexport::pipeline::{scan, synthesize};
use dllexport_metadata::Assembly;
use dllexport_metadata::testing::CalcFixture;

fn stub_source(fixture: &CalcFixture) -> String {
    let assembly = Assembly::from_metadata(&fixture.metadata()).unwrap();
    let report = scan(&assembly);
    render_stub_module(&synthesize(&assembly, &report.members))
}

#[test]
fn test_calc_stub_module() {
    let mut fixture = CalcFixture::new();
    fixture.binary_method("Add", Some((Some("Add"), 2)));
    fixture.binary_method("Sub", Some((Some("Sub"), 3)));

    let il = stub_source(&fixture);
    insta::assert_snapshot!(il.trim_end(), @r#"
.assembly extern mscorlib
{
  .publickeytoken = (B7 7A 5C 56 19 34 E0 89 )
  .ver 4:0:0:0
}
.assembly extern Calc
{
  .ver 1:0:0:0
}
.assembly $Calc
{
  .ver 0:0:0:0
}
.module $Calc.dll

.method public static int32 modopt([mscorlib]System.Runtime.CompilerServices.CallConvCdecl) Add(int32 a, int32 b) cil managed
{
  .maxstack 3
  ldstr ".export [0] as Add"
  ldarg.0
  ldarg.1
  call int32 [Calc]Acme.Calc::Add(int32, int32)
  ret
}

.method public static int32 modopt([mscorlib]System.Runtime.CompilerServices.CallConvStdcall) Sub(int32 a, int32 b) cil managed
{
  .maxstack 3
  ldstr ".export [1] as Sub"
  ldarg.0
  ldarg.1
  call int32 [Calc]Acme.Calc::Sub(int32, int32)
  ret
}
"#);
}

#[test]
fn test_renamed_export_keeps_stub_name() {
    let mut fixture = CalcFixture::new();
    fixture.binary_method("Add", Some((Some("add numbers"), 1)));

    let il = stub_source(&fixture);
    assert!(il.contains(r#"ldstr ".export [0] as 'add numbers'""#));
    assert!(il.contains("CallConvStdcall) Add(int32 a, int32 b)"));
    assert!(il.contains("call int32 [Calc]Acme.Calc::Add(int32, int32)"));
}
