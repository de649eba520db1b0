//! XML parsing of protocol descriptions.
//!
//! The parser validates the structural constraints of the description
//! format as it goes; any violation aborts the whole run with a
//! source location.

use std::io::Read;

use xml::attribute::OwnedAttribute;
use xml::common::{Position, TextPosition};
use xml::reader::{EventReader, ParserConfig, XmlEvent};

use crate::protocol::*;

/// A fatal description error, carrying its source location.
#[derive(Debug)]
pub struct ParseError {
    line: u64,
    column: u64,
    message: String,
}

impl ParseError {
    fn new(position: TextPosition, message: String) -> ParseError {
        ParseError { line: position.row + 1, column: position.column + 1, message }
    }
}

impl std::error::Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}: {}", self.line, self.column, self.message)
    }
}

/// Parse a protocol description from a stream of XML.
pub fn parse_stream<R: Read>(stream: R) -> Result<Protocol, ParseError> {
    let reader = EventReader::new_with_config(
        stream,
        ParserConfig::new().trim_whitespace(true).cdata_to_characters(true),
    );
    Parser { reader }.parse_document()
}

fn attribute<'a>(attrs: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attrs.iter().find(|attr| attr.name.local_name == name).map(|attr| attr.value.as_str())
}

struct Parser<R: Read> {
    reader: EventReader<R>,
}

impl<R: Read> Parser<R> {
    fn error<T>(&self, message: String) -> Result<T, ParseError> {
        Err(ParseError::new(self.reader.position(), message))
    }

    fn warn(&self, message: &str) {
        let position = self.reader.position();
        eprintln!(
            "waycore-scanner: warning: line {}, column {}: {}",
            position.row + 1,
            position.column + 1,
            message
        );
    }

    fn next(&mut self) -> Result<XmlEvent, ParseError> {
        let position = self.reader.position();
        self.reader
            .next()
            .map_err(|e| ParseError::new(position, format!("invalid XML: {}", e.msg())))
    }

    fn parse_document(&mut self) -> Result<Protocol, ParseError> {
        loop {
            match self.next()? {
                XmlEvent::StartElement { name, attributes, .. } => {
                    if name.local_name != "protocol" {
                        return self
                            .error(format!("expected protocol element, got `{}`", name.local_name));
                    }
                    return self.parse_protocol(&attributes);
                }
                XmlEvent::EndDocument => {
                    return self.error("no protocol element in description".into())
                }
                _ => {}
            }
        }
    }

    fn parse_protocol(&mut self, attrs: &[OwnedAttribute]) -> Result<Protocol, ParseError> {
        let name = match attribute(attrs, "name") {
            Some(name) => name.to_owned(),
            None => return self.error("no protocol name given".into()),
        };
        let mut protocol = Protocol::new(name);

        loop {
            match self.next()? {
                XmlEvent::StartElement { name, attributes, .. } => {
                    match &name.local_name[..] {
                        "copyright" => protocol.copyright = Some(self.parse_text("copyright")?),
                        "interface" => {
                            protocol.interfaces.push(self.parse_interface(&attributes)?)
                        }
                        "description" => {
                            protocol.description = Some(self.parse_description(&attributes)?)
                        }
                        other => {
                            return self.error(format!(
                                "unexpected element `{}` in protocol {}",
                                other, protocol.name
                            ))
                        }
                    }
                }
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return self.error("unexpected end of description".into())
                }
                _ => {}
            }
        }

        Ok(protocol)
    }

    fn parse_interface(&mut self, attrs: &[OwnedAttribute]) -> Result<Interface, ParseError> {
        let name = match attribute(attrs, "name") {
            Some(name) => name.to_owned(),
            None => return self.error("no interface name given".into()),
        };
        let version = match attribute(attrs, "version") {
            Some(version) => match version.parse::<u32>() {
                Ok(version) if version > 0 => version,
                _ => return self.error(format!("invalid interface version ({})", version)),
            },
            None => return self.error(format!("no version given for interface {}", name)),
        };
        let mut interface = Interface::new(name, version);

        // running since maxima, tracked independently for each message
        // kind
        let mut request_since = 1;
        let mut event_since = 1;

        loop {
            match self.next()? {
                XmlEvent::StartElement { name, attributes, .. } => match &name.local_name[..] {
                    "description" => {
                        interface.description = Some(self.parse_description(&attributes)?)
                    }
                    "request" => interface
                        .requests
                        .push(self.parse_message("request", &attributes, &mut request_since)?),
                    "event" => interface
                        .events
                        .push(self.parse_message("event", &attributes, &mut event_since)?),
                    "enum" => interface.enums.push(self.parse_enum(&attributes)?),
                    other => {
                        return self.error(format!(
                            "unexpected element `{}` in interface {}",
                            other, interface.name
                        ))
                    }
                },
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return self.error("unexpected end of description".into())
                }
                _ => {}
            }
        }

        Ok(interface)
    }

    fn parse_message(
        &mut self,
        element: &str,
        attrs: &[OwnedAttribute],
        last_since: &mut u32,
    ) -> Result<Message, ParseError> {
        let name = match attribute(attrs, "name") {
            Some(name) => name.to_owned(),
            None => return self.error(format!("no {} name given", element)),
        };
        let mut message = Message::new(name);

        match attribute(attrs, "type") {
            None => {}
            Some("destructor") => message.destructor = true,
            Some(other) => {
                return self.error(format!(
                    "invalid type `{}` for {} {}",
                    other, element, message.name
                ))
            }
        }

        if let Some(since) = attribute(attrs, "since") {
            message.since = match since.parse() {
                Ok(since) => since,
                Err(_) => return self.error(format!("invalid integer ({})", since)),
            };
        }
        if message.since < *last_since {
            self.warn("since version not increasing");
        } else {
            *last_since = message.since;
        }

        if element == "request" && message.name == "destroy" && !message.destructor {
            return self.error("destroy request should be destructor type".into());
        }

        loop {
            match self.next()? {
                XmlEvent::StartElement { name, attributes, .. } => match &name.local_name[..] {
                    "description" => {
                        message.description = Some(self.parse_description(&attributes)?)
                    }
                    "arg" => message.args.push(self.parse_arg(&attributes)?),
                    other => {
                        return self.error(format!(
                            "unexpected element `{}` in {} {}",
                            other, element, message.name
                        ))
                    }
                },
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return self.error("unexpected end of description".into())
                }
                _ => {}
            }
        }

        Ok(message)
    }

    fn parse_arg(&mut self, attrs: &[OwnedAttribute]) -> Result<Arg, ParseError> {
        let name = match attribute(attrs, "name") {
            Some(name) => name.to_owned(),
            None => return self.error("no argument name given".into()),
        };
        let typ = match attribute(attrs, "type") {
            Some(typ) => match Type::from_str(typ) {
                Some(typ) => typ,
                None => return self.error(format!("unknown type ({})", typ)),
            },
            None => return self.error(format!("no type given for argument {}", name)),
        };

        let interface = attribute(attrs, "interface").map(str::to_owned);
        if interface.is_some() && !matches!(typ, Type::Object | Type::NewId) {
            return self.error(format!("interface attribute not allowed for argument {}", name));
        }

        let allow_null = match attribute(attrs, "allow-null") {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return self.error(format!("invalid value for allow-null attribute ({})", other))
            }
        };
        if allow_null && !typ.nullable() {
            return self
                .error("allow-null is only valid for objects, strings, and arrays".into());
        }

        let mut arg = Arg {
            name,
            typ,
            interface,
            summary: attribute(attrs, "summary").map(str::to_owned),
            description: None,
            allow_null,
            enum_: attribute(attrs, "enum").map(str::to_owned),
        };

        loop {
            match self.next()? {
                XmlEvent::StartElement { name, attributes, .. } => match &name.local_name[..] {
                    "description" => arg.description = Some(self.parse_description(&attributes)?),
                    other => {
                        return self
                            .error(format!("unexpected element `{}` in arg {}", other, arg.name))
                    }
                },
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return self.error("unexpected end of description".into())
                }
                _ => {}
            }
        }

        Ok(arg)
    }

    fn parse_enum(&mut self, attrs: &[OwnedAttribute]) -> Result<Enum, ParseError> {
        let name = match attribute(attrs, "name") {
            Some(name) => name.to_owned(),
            None => return self.error("no enum name given".into()),
        };
        let mut enu = Enum {
            name,
            since: 1,
            description: None,
            entries: Vec::new(),
            bitfield: attribute(attrs, "bitfield") == Some("true"),
        };
        if let Some(since) = attribute(attrs, "since") {
            enu.since = match since.parse() {
                Ok(since) => since,
                Err(_) => return self.error(format!("invalid integer ({})", since)),
            };
        }

        loop {
            match self.next()? {
                XmlEvent::StartElement { name, attributes, .. } => match &name.local_name[..] {
                    "description" => enu.description = Some(self.parse_description(&attributes)?),
                    "entry" => enu.entries.push(self.parse_entry(&attributes)?),
                    other => {
                        return self
                            .error(format!("unexpected element `{}` in enum {}", other, enu.name))
                    }
                },
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return self.error("unexpected end of description".into())
                }
                _ => {}
            }
        }

        Ok(enu)
    }

    fn parse_entry(&mut self, attrs: &[OwnedAttribute]) -> Result<Entry, ParseError> {
        let name = match attribute(attrs, "name") {
            Some(name) => name.to_owned(),
            None => return self.error("no entry name given".into()),
        };
        let value = match attribute(attrs, "value") {
            Some(value) => value.to_owned(),
            None => return self.error(format!("no value given for entry {}", name)),
        };
        let mut entry = Entry {
            name,
            value,
            since: 1,
            description: None,
            summary: attribute(attrs, "summary").map(str::to_owned),
        };
        if let Some(since) = attribute(attrs, "since") {
            entry.since = match since.parse() {
                Ok(since) => since,
                Err(_) => return self.error(format!("invalid integer ({})", since)),
            };
        }

        loop {
            match self.next()? {
                XmlEvent::StartElement { name, attributes, .. } => match &name.local_name[..] {
                    "description" => {
                        entry.description = Some(self.parse_description(&attributes)?)
                    }
                    other => {
                        return self
                            .error(format!("unexpected element `{}` in entry {}", other, entry.name))
                    }
                },
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return self.error("unexpected end of description".into())
                }
                _ => {}
            }
        }

        Ok(entry)
    }

    fn parse_description(
        &mut self,
        attrs: &[OwnedAttribute],
    ) -> Result<(String, String), ParseError> {
        let summary = match attribute(attrs, "summary") {
            // normalize the whitespace of multi-line summaries
            Some(summary) => summary.split_whitespace().collect::<Vec<_>>().join(" "),
            None => return self.error("description without summary".into()),
        };
        let body = self.parse_text("description")?;
        Ok((summary, body))
    }

    // collect the character data of an element until its closing tag
    fn parse_text(&mut self, element: &str) -> Result<String, ParseError> {
        let mut text = String::new();
        loop {
            match self.next()? {
                XmlEvent::Characters(chunk) => text.push_str(&chunk),
                XmlEvent::EndElement { .. } => return Ok(text),
                XmlEvent::StartElement { name, .. } => {
                    return self.error(format!(
                        "unexpected element `{}` in {}",
                        name.local_name, element
                    ))
                }
                XmlEvent::EndDocument => {
                    return self.error("unexpected end of description".into())
                }
                _ => {}
            }
        }
    }
}
