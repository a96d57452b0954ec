//! The host-facing surface of the core.
//!
//! The RSP packet parser itself lives outside the crate; it decodes the
//! wire traffic and calls into [`crate::Session`]. What lives here is
//! the output sink it hands us for diagnostic text and the memory map
//! document served for `qXfer:memory-map:read::`.

use std::fmt::Write;

use probe_fw_target::MemoryRegion;

use crate::targets::Target;

/// Diagnostic text sink, rendered to the host as `O` reply payloads.
pub trait GdbOutput {
    /// Print a line of text on the host's console.
    fn gdb_out(&mut self, text: &str);
}

/// An output sink collecting into a string, for tests and deferred
/// replies.
#[derive(Debug, Default)]
pub struct BufferedOutput {
    text: String,
}

impl BufferedOutput {
    /// Everything printed so far.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl GdbOutput for BufferedOutput {
    fn gdb_out(&mut self, text: &str) {
        self.text.push_str(text);
    }
}

/// Render the target's memory map as the `qXfer:memory-map:read::`
/// payload.
pub fn memory_map_xml(target: &Target) -> String {
    let mut xml = String::new();

    xml.push_str(concat!(
        "<?xml version=\"1.0\"?>",
        "<!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" ",
        "\"http://sourceware.org/gdb/gdb-memory-map.dtd\">",
        "<memory-map>"
    ));

    for region in &target.memory_map {
        match region {
            MemoryRegion::Nvm(nvm) => {
                write!(
                    xml,
                    "<memory type=\"flash\" start=\"{:#x}\" length=\"{:#x}\">\
                     <property name=\"blocksize\">{:#x}</property></memory>",
                    nvm.range.start,
                    nvm.range.end - nvm.range.start,
                    nvm.block_size
                )
                .expect("writing to a string cannot fail");
            }
            MemoryRegion::Ram(ram) => {
                write!(
                    xml,
                    "<memory type=\"ram\" start=\"{:#x}\" length=\"{:#x}\"/>",
                    ram.range.start,
                    ram.range.end - ram.range.start
                )
                .expect("writing to a string cannot fail");
            }
        }
    }

    xml.push_str("</memory-map>");
    xml
}
