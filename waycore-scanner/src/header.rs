//! Emission of side-specific constant headers (`client-header` and
//! `server-header` modes).
//!
//! Per interface this produces a module with opcode and since-version
//! constants for every message, and the interface enums rendered as
//! Rust types (plain enums with `TryFrom<u32>`, or constant modules
//! for bitfields).

use std::io::{Result as IoResult, Write};

use crate::protocol::{Enum, Interface, Message, Protocol};
use crate::side::Side;
use crate::util::{snake_to_camel, to_screaming_snake};

fn emit_message_consts<W: Write>(
    out: &mut W,
    prefix: &str,
    direction: &str,
    messages: &[Message],
) -> IoResult<()> {
    for (opcode, message) in messages.iter().enumerate() {
        if let Some((summary, _)) = &message.description {
            writeln!(out, "    /// {} ({})", summary, direction)?;
        }
        let name = to_screaming_snake(&message.name);
        writeln!(out, "    pub const {}_{}_OPCODE: u16 = {};", prefix, name, opcode)?;
        writeln!(out, "    pub const {}_{}_SINCE: u32 = {};", prefix, name, message.since)?;
    }
    Ok(())
}

fn emit_enum<W: Write>(out: &mut W, enu: &Enum) -> IoResult<()> {
    if enu.bitfield {
        // bitfield entries may be combined on the wire, expose them as
        // plain constants
        if let Some((summary, _)) = &enu.description {
            writeln!(out, "    /// {}", summary)?;
        }
        writeln!(out, "    pub mod {} {{", enu.name)?;
        for entry in &enu.entries {
            if let Some(summary) = &entry.summary {
                writeln!(out, "        /// {}", summary)?;
            }
            writeln!(
                out,
                "        pub const {}: u32 = {};",
                to_screaming_snake(&entry.name),
                entry.value
            )?;
        }
        writeln!(out, "    }}")?;
        return Ok(());
    }

    let type_name = snake_to_camel(&enu.name);
    if let Some((summary, _)) = &enu.description {
        writeln!(out, "    /// {}", summary)?;
    }
    writeln!(out, "    #[repr(u32)]")?;
    writeln!(out, "    #[derive(Copy, Clone, PartialEq, Eq, Debug)]")?;
    writeln!(out, "    pub enum {} {{", type_name)?;
    for entry in &enu.entries {
        if let Some(summary) = &entry.summary {
            writeln!(out, "        /// {}", summary)?;
        }
        writeln!(out, "        {} = {},", snake_to_camel(&entry.name), entry.value)?;
    }
    writeln!(out, "    }}")?;

    writeln!(out, "    impl std::convert::TryFrom<u32> for {} {{", type_name)?;
    writeln!(out, "        type Error = ();")?;
    writeln!(out, "        fn try_from(value: u32) -> Result<Self, ()> {{")?;
    writeln!(out, "            match value {{")?;
    for entry in &enu.entries {
        writeln!(out, "                {} => Ok(Self::{}),", entry.value, snake_to_camel(&entry.name))?;
    }
    writeln!(out, "                _ => Err(()),")?;
    writeln!(out, "            }}")?;
    writeln!(out, "        }}")?;
    writeln!(out, "    }}")?;
    Ok(())
}

fn emit_interface<W: Write>(out: &mut W, interface: &Interface, side: Side) -> IoResult<()> {
    writeln!(out)?;
    writeln!(out, "pub mod {} {{", interface.name)?;
    match &interface.description {
        Some((summary, _)) => writeln!(out, "    //! {}", summary)?,
        None => writeln!(out, "    //! The `{}` interface.", interface.name)?,
    }
    writeln!(out)?;
    writeln!(out, "    pub const VERSION: u32 = {};", interface.version)?;

    if !interface.requests.is_empty() {
        writeln!(out)?;
        emit_message_consts(out, "REQ", side.requests_direction(), &interface.requests)?;
    }
    if !interface.events.is_empty() {
        writeln!(out)?;
        emit_message_consts(out, "EVT", side.events_direction(), &interface.events)?;
    }

    for enu in &interface.enums {
        writeln!(out)?;
        emit_enum(out, enu)?;
    }

    writeln!(out, "}}")
}

/// Emit the constant header for one side of the protocol.
pub fn emit_header<W: Write>(protocol: &Protocol, side: Side, out: &mut W) -> IoResult<()> {
    writeln!(out, "//")?;
    writeln!(out, "// This file was auto-generated, do not edit directly.")?;
    writeln!(out, "//")?;

    if let Some(ref copyright) = protocol.copyright {
        writeln!(out)?;
        writeln!(out, "/*")?;
        for line in copyright.lines() {
            writeln!(out, "{}", line.trim())?;
        }
        writeln!(out, "*/")?;
    }

    for interface in &protocol.interfaces {
        emit_interface(out, interface, side)?;
    }
    Ok(())
}
