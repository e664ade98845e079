//! Rendering a [`StubModule`] as ILAsm source.

use dllexport_iltext::names::{dotted_name, identifier, string_literal};
use dllexport_metadata::{AssemblyIdentity, PublicKey};

use super::il_emitter::IlEmitter;
use super::types::TypeRenderer;
use crate::pipeline::synth::{Instruction, StubMethod, StubModule, StubParam};

/// Full ILAsm source for the stub module.
pub fn render_stub_module(module: &StubModule) -> String {
    let types = TypeRenderer::new(&module.target);
    let mut e = IlEmitter::new();

    for identity in &module.externs {
        assembly_extern(&mut e, identity);
    }
    e.block(&format!(".assembly {}", dotted_name(&module.assembly_name)), |e| {
        e.line(".ver 0:0:0:0");
    });
    e.linef(format_args!(".module {}", dotted_name(&module.module_name())));

    for method in &module.methods {
        e.blank_line();
        stub_method(&mut e, module, &types, method);
    }
    e.finish()
}

fn assembly_extern(e: &mut IlEmitter, identity: &AssemblyIdentity) {
    e.block(&format!(".assembly extern {}", dotted_name(&identity.name)), |e| {
        match &identity.public_key {
            PublicKey::None => {}
            PublicKey::Token(token) => e.linef(format_args!(".publickeytoken = ({} )", hex_bytes(token))),
            PublicKey::Full(key) => e.linef(format_args!(".publickey = ({} )", hex_bytes(key))),
        }
        let v = identity.version;
        e.linef(format_args!(".ver {}:{}:{}:{}", v.major, v.minor, v.build, v.revision));
        if let Some(culture) = &identity.culture {
            e.linef(format_args!(".locale {}", string_literal(culture)));
        }
    });
}

fn stub_method(e: &mut IlEmitter, module: &StubModule, types: &TypeRenderer<'_>, method: &StubMethod) {
    let mut return_type = types.render(&method.return_type);
    if let Some(modifier) = method.modifier {
        return_type = format!("{return_type} modopt({})", types.reference(&module.modifier_type(modifier)));
    }
    let params: Vec<String> = method.params.iter().map(|p| parameter(types, p)).collect();
    let header = format!(
        ".method public static {return_type} {}({}) cil managed",
        identifier(&method.name),
        params.join(", ")
    );

    e.block(&header, |e| {
        e.linef(format_args!(".maxstack {}", method.max_stack));
        for instruction in &method.body {
            e.line(&render_instruction(types, instruction));
        }
    });
}

fn parameter(types: &TypeRenderer<'_>, param: &StubParam) -> String {
    let mut out = String::new();
    for (set, flag) in [(param.is_in, "[in] "), (param.is_out, "[out] "), (param.is_optional, "[opt] ")] {
        if set {
            out.push_str(flag);
        }
    }
    out.push_str(&types.render(&param.ty));
    if !param.name.is_empty() {
        out.push(' ');
        out.push_str(&identifier(&param.name));
    }
    out
}

pub fn render_instruction(types: &TypeRenderer<'_>, instruction: &Instruction) -> String {
    match instruction {
        Instruction::LdStr(value) => format!("ldstr {}", string_literal(value)),
        Instruction::LdArg(slot @ 0..=3) => format!("ldarg.{slot}"),
        Instruction::LdArg(slot @ 4..=255) => format!("ldarg.s {slot}"),
        Instruction::LdArg(slot) => format!("ldarg {slot}"),
        Instruction::Call(target) => format!(
            "call {} {}::{}({})",
            types.render(&target.signature.return_type),
            types.reference(&target.declaring_type),
            identifier(&target.name),
            types.parameter_list(&target.signature.params)
        ),
        Instruction::Ret => "ret".to_string(),
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}
