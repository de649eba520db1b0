//! In-memory model of a parsed protocol description.
//!
//! Pure data: every parent keeps its children in source order, and
//! enum entry values are preserved as the literal text they were
//! written as.

#[derive(Debug)]
pub struct Protocol {
    pub name: String,
    pub copyright: Option<String>,
    pub description: Option<(String, String)>,
    pub interfaces: Vec<Interface>,
}

impl Protocol {
    pub fn new(name: String) -> Protocol {
        Protocol { name, copyright: None, description: None, interfaces: Vec::new() }
    }
}

#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub version: u32,
    pub description: Option<(String, String)>,
    pub requests: Vec<Message>,
    pub events: Vec<Message>,
    pub enums: Vec<Enum>,
}

impl Interface {
    pub fn new(name: String, version: u32) -> Interface {
        Interface {
            name,
            version,
            description: None,
            requests: Vec::new(),
            events: Vec::new(),
            enums: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Message {
    pub name: String,
    pub destructor: bool,
    pub since: u32,
    pub description: Option<(String, String)>,
    pub args: Vec<Arg>,
}

impl Message {
    pub fn new(name: String) -> Message {
        Message { name, destructor: false, since: 1, description: None, args: Vec::new() }
    }

    /// True when no argument references a peer interface, i.e. the
    /// message's slots in the types vector are all NULL and it can
    /// share the common NULL run.
    pub fn all_null(&self) -> bool {
        self.args
            .iter()
            .all(|a| !((a.typ == Type::Object || a.typ == Type::NewId) && a.interface.is_some()))
    }

    /// Number of arguments on the wire: a new_id without a declared
    /// interface expands to three (string, uint, new id).
    pub fn wire_arg_count(&self) -> usize {
        self.args
            .iter()
            .map(|a| if a.typ == Type::NewId && a.interface.is_none() { 3 } else { 1 })
            .sum()
    }

    /// The compact signature of this message, wire order.
    pub fn signature(&self) -> String {
        let mut sig = String::new();
        if self.since > 1 {
            sig.push_str(&self.since.to_string());
        }
        for arg in &self.args {
            if arg.typ.nullable() && arg.allow_null {
                sig.push('?');
            }
            match arg.typ {
                Type::Int => sig.push('i'),
                Type::Uint => sig.push('u'),
                Type::Fixed => sig.push('f'),
                Type::String => sig.push('s'),
                Type::Object => sig.push('o'),
                Type::NewId => {
                    if arg.interface.is_none() {
                        sig.push_str("su");
                    }
                    sig.push('n');
                }
                Type::Array => sig.push('a'),
                Type::Fd => sig.push('h'),
            }
        }
        sig
    }
}

#[derive(Debug)]
pub struct Arg {
    pub name: String,
    pub typ: Type,
    pub interface: Option<String>,
    pub summary: Option<String>,
    pub description: Option<(String, String)>,
    pub allow_null: bool,
    pub enum_: Option<String>,
}

#[derive(Debug)]
pub struct Enum {
    pub name: String,
    pub since: u32,
    pub description: Option<(String, String)>,
    pub entries: Vec<Entry>,
    pub bitfield: bool,
}

#[derive(Debug)]
pub struct Entry {
    pub name: String,
    /// The literal value text, preserved for emission (it may be a
    /// hex literal).
    pub value: String,
    pub since: u32,
    pub description: Option<(String, String)>,
    pub summary: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Type {
    Int,
    Uint,
    Fixed,
    String,
    Object,
    NewId,
    Array,
    Fd,
}

impl Type {
    /// Types for which `allow-null` is permitted.
    pub fn nullable(self) -> bool {
        matches!(self, Type::String | Type::Object | Type::NewId | Type::Array)
    }

    pub fn from_str(txt: &str) -> Option<Type> {
        Some(match txt {
            "int" => Type::Int,
            "uint" => Type::Uint,
            "fixed" => Type::Fixed,
            "string" => Type::String,
            "object" => Type::Object,
            "new_id" => Type::NewId,
            "array" => Type::Array,
            "fd" => Type::Fd,
            _ => return None,
        })
    }
}
