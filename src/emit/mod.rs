//! ILAsm source generation for the stub module.

pub mod il_emitter;
pub mod module;
pub mod types;

pub use il_emitter::IlEmitter;
pub use module::render_stub_module;
pub use types::TypeRenderer;
