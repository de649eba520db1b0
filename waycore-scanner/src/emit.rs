//! Emission of the runtime interface tables (`code` mode).
//!
//! For every interface of the protocol this produces a
//! `pub static <NAME>_INTERFACE: Interface` table holding the message
//! descriptors: the compact signature strings and, per wire argument,
//! a reference to the peer interface or `None`.
//!
//! Messages that reference no peer interface all share a single run of
//! `None` slots (`TYPES_NULL`), sized to the largest argument count
//! among them; every other message gets its own types array.

use std::io::{Result as IoResult, Write};

use crate::protocol::{Interface, Message, Protocol, Type};
use crate::util::to_screaming_snake;

/// Longest wire-argument count among messages that can share the
/// common NULL run.
pub fn null_run_length(protocol: &Protocol) -> usize {
    protocol
        .interfaces
        .iter()
        .flat_map(|interface| interface.requests.iter().chain(&interface.events))
        .filter(|message| message.all_null())
        .map(Message::wire_arg_count)
        .max()
        .unwrap_or(0)
}

/// The sorted, deduplicated names of peer interfaces referenced by the
/// protocol's messages but not defined by the protocol itself.
pub fn external_interfaces(protocol: &Protocol) -> Vec<&str> {
    let mut externals: Vec<&str> = protocol
        .interfaces
        .iter()
        .flat_map(|interface| interface.requests.iter().chain(&interface.events))
        .flat_map(|message| &message.args)
        .filter_map(|arg| arg.interface.as_deref())
        .filter(|name| !protocol.interfaces.iter().any(|i| i.name == *name))
        .collect();
    externals.sort_unstable();
    externals.dedup();
    externals
}

fn types_array_name(interface: &Interface, kind: &str, message: &Message) -> String {
    format!(
        "{}_{}_{}_TYPES",
        to_screaming_snake(&interface.name),
        kind.to_ascii_uppercase(),
        to_screaming_snake(&message.name)
    )
}

fn emit_types_array<W: Write>(
    out: &mut W,
    interface: &Interface,
    kind: &str,
    message: &Message,
) -> IoResult<()> {
    writeln!(
        out,
        "static {}: [Option<&'static Interface>; {}] = [",
        types_array_name(interface, kind, message),
        message.wire_arg_count()
    )?;
    for arg in &message.args {
        match (arg.typ, &arg.interface) {
            (Type::Object | Type::NewId, Some(peer)) => {
                writeln!(out, "    Some(&{}_INTERFACE),", to_screaming_snake(peer))?
            }
            (Type::NewId, None) => {
                // the wire expansion of a generic new_id: interface
                // name, version, then the id itself
                writeln!(out, "    None,")?;
                writeln!(out, "    None,")?;
                writeln!(out, "    None,")?;
            }
            _ => writeln!(out, "    None,")?,
        }
    }
    writeln!(out, "];")
}

fn emit_message_list<W: Write>(
    out: &mut W,
    interface: &Interface,
    kind: &str,
    messages: &[Message],
) -> IoResult<()> {
    if messages.is_empty() {
        return writeln!(out, "    {}: &[],", kind);
    }
    writeln!(out, "    {}: &[", kind)?;
    for message in messages {
        writeln!(out, "        MessageDesc {{")?;
        writeln!(out, "            name: \"{}\",", message.name)?;
        writeln!(out, "            signature: \"{}\",", message.signature())?;
        if message.all_null() {
            writeln!(out, "            types: &TYPES_NULL,")?;
        } else {
            writeln!(out, "            types: &{},", types_array_name(interface, kind, message))?;
        }
        writeln!(out, "            is_destructor: {},", message.destructor)?;
        writeln!(out, "        }},")?;
    }
    writeln!(out, "    ],")
}

/// Emit the interface data tables for the whole protocol.
pub fn emit_code<W: Write>(protocol: &Protocol, out: &mut W) -> IoResult<()> {
    writeln!(out, "//")?;
    writeln!(out, "// This file was auto-generated, do not edit directly.")?;
    writeln!(out, "//")?;
    writeln!(out)?;

    if let Some(ref copyright) = protocol.copyright {
        writeln!(out, "/*")?;
        for line in copyright.lines() {
            writeln!(out, "{}", line.trim())?;
        }
        writeln!(out, "*/")?;
        writeln!(out)?;
    }

    writeln!(out, "use waycore_protocol::{{Interface, MessageDesc}};")?;

    let externals = external_interfaces(protocol);
    if !externals.is_empty() {
        let list: Vec<String> =
            externals.iter().map(|name| format!("{}_INTERFACE", to_screaming_snake(name))).collect();
        writeln!(out, "use super::{{{}}};", list.join(", "))?;
    }
    writeln!(out)?;

    writeln!(
        out,
        "static TYPES_NULL: [Option<&'static Interface>; {}] = [None; {}];",
        null_run_length(protocol),
        null_run_length(protocol)
    )?;

    for interface in &protocol.interfaces {
        writeln!(out)?;
        writeln!(out, "// {}", interface.name)?;
        writeln!(out)?;

        for message in interface.requests.iter().filter(|m| !m.all_null()) {
            emit_types_array(out, interface, "requests", message)?;
        }
        for message in interface.events.iter().filter(|m| !m.all_null()) {
            emit_types_array(out, interface, "events", message)?;
        }

        writeln!(
            out,
            "pub static {}_INTERFACE: Interface = Interface {{",
            to_screaming_snake(&interface.name)
        )?;
        writeln!(out, "    name: \"{}\",", interface.name)?;
        writeln!(out, "    version: {},", interface.version)?;
        emit_message_list(out, interface, "requests", &interface.requests)?;
        emit_message_list(out, interface, "events", &interface.events)?;
        writeln!(out, "}};")?;
    }

    Ok(())
}
