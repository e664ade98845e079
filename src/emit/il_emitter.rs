//! IL text emitter - builds ILAsm source with indentation
//!
//! This module provides the line buffer the stub module renderer writes into.

use std::fmt::Write;

/// A buffer for building IL source with proper indentation
#[derive(Debug)]
pub struct IlEmitter {
    buffer: String,
    indent_level: usize,
    indent_str: &'static str,
}

impl Default for IlEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl IlEmitter {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            indent_level: 0,
            indent_str: "  ", // 2 spaces, as ildasm prints
        }
    }

    /// Get the generated source
    pub fn finish(self) -> String {
        self.buffer
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// Write a line with current indentation
    pub fn line(&mut self, s: &str) {
        self.write_indent();
        self.buffer.push_str(s);
        self.buffer.push('\n');
    }

    /// Write formatted text as one indented line
    pub fn linef(&mut self, args: std::fmt::Arguments<'_>) {
        self.write_indent();
        let _ = self.buffer.write_fmt(args);
        self.buffer.push('\n');
    }

    /// Write text without newline
    pub fn write(&mut self, s: &str) {
        self.buffer.push_str(s);
    }

    pub fn blank_line(&mut self) {
        self.buffer.push('\n');
    }

    pub fn write_indent(&mut self) {
        for _ in 0..self.indent_level {
            self.buffer.push_str(self.indent_str);
        }
    }

    pub fn indent(&mut self) {
        self.indent_level += 1;
    }

    pub fn dedent(&mut self) {
        if self.indent_level > 0 {
            self.indent_level -= 1;
        }
    }

    /// Write `header`, then a braced block on the following lines
    pub fn block<F>(&mut self, header: &str, f: F)
    where
        F: FnOnce(&mut Self),
    {
        self.block_with_trailer(header, None, f);
    }

    /// Like [`IlEmitter::block`], closing with `} // trailer` when one is given
    pub fn block_with_trailer<F>(&mut self, header: &str, trailer: Option<&str>, f: F)
    where
        F: FnOnce(&mut Self),
    {
        self.line(header);
        self.line("{");
        self.indent();
        f(self);
        self.dedent();
        match trailer {
            Some(trailer) => self.linef(format_args!("}} // {trailer}")),
            None => self.line("}"),
        }
    }
}
