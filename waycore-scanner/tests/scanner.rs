use waycore_scanner::emit::{emit_code, external_interfaces, null_run_length};
use waycore_scanner::header::emit_header;
use waycore_scanner::{parse_stream, Side};

const PROTOCOL: &str = r#"
<protocol name="conjure">
  <copyright>
    Copyright notice for the conjure protocol.
  </copyright>
  <interface name="wc_lamp" version="3">
    <description summary="a lamp">A light-emitting object.</description>
    <request name="destroy" type="destructor"></request>
    <request name="set_output">
      <arg name="output" type="object" interface="wc_output" allow-null="true"/>
    </request>
    <request name="bind_thing" since="2">
      <arg name="name" type="uint"/>
      <arg name="id" type="new_id"/>
    </request>
    <event name="glow">
      <arg name="level" type="fixed"/>
      <arg name="label" type="string" allow-null="true"/>
    </event>
    <enum name="error">
      <entry name="invalid_level" value="0" summary="level out of range"/>
      <entry name="busy" value="0x1"/>
    </enum>
    <enum name="mode" bitfield="true">
      <entry name="dim" value="1"/>
      <entry name="pulse" value="2"/>
    </enum>
  </interface>
  <interface name="wc_lamp_maker" version="1">
    <request name="make_lamp">
      <arg name="id" type="new_id" interface="wc_lamp"/>
      <arg name="backing" type="fd"/>
    </request>
  </interface>
</protocol>
"#;

#[test]
fn parses_model_in_source_order() {
    let protocol = parse_stream(PROTOCOL.as_bytes()).unwrap();
    assert_eq!(protocol.name, "conjure");
    assert!(protocol.copyright.as_deref().unwrap().contains("conjure protocol"));
    assert_eq!(protocol.interfaces.len(), 2);

    let lamp = &protocol.interfaces[0];
    assert_eq!(lamp.name, "wc_lamp");
    assert_eq!(lamp.version, 3);
    assert_eq!(lamp.description.as_ref().unwrap().0, "a lamp");

    let names: Vec<_> = lamp.requests.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["destroy", "set_output", "bind_thing"]);
    assert!(lamp.requests[0].destructor);
    assert_eq!(lamp.requests[2].since, 2);
    assert_eq!(lamp.enums.len(), 2);
    assert!(lamp.enums[1].bitfield);
    assert_eq!(lamp.enums[0].entries[1].value, "0x1");
}

#[test]
fn builds_signatures() {
    let protocol = parse_stream(PROTOCOL.as_bytes()).unwrap();
    let lamp = &protocol.interfaces[0];
    assert_eq!(lamp.requests[0].signature(), "");
    assert_eq!(lamp.requests[1].signature(), "?o");
    assert_eq!(lamp.requests[2].signature(), "2usun");
    assert_eq!(lamp.events[0].signature(), "f?s");
    let maker = &protocol.interfaces[1];
    assert_eq!(maker.requests[0].signature(), "nh");
}

#[test]
fn computes_types_vector_layout() {
    let protocol = parse_stream(PROTOCOL.as_bytes()).unwrap();
    let lamp = &protocol.interfaces[0];

    // generic new_id expands to three wire arguments
    assert_eq!(lamp.requests[2].wire_arg_count(), 4);
    assert!(lamp.requests[2].all_null());
    // an interfaced object keeps the message out of the shared run
    assert!(!lamp.requests[1].all_null());

    assert_eq!(null_run_length(&protocol), 4);
    // wc_lamp is defined by the protocol itself, only wc_output is
    // external
    assert_eq!(external_interfaces(&protocol), vec!["wc_output"]);
}

#[test]
fn emits_interface_tables() {
    let protocol = parse_stream(PROTOCOL.as_bytes()).unwrap();
    let mut out = Vec::new();
    emit_code(&protocol, &mut out).unwrap();
    let code = String::from_utf8(out).unwrap();

    assert!(code.contains("use waycore_protocol::{Interface, MessageDesc};"));
    assert!(code.contains("use super::{WC_OUTPUT_INTERFACE};"));
    assert!(code.contains("static TYPES_NULL: [Option<&'static Interface>; 4] = [None; 4];"));
    assert!(code.contains("pub static WC_LAMP_INTERFACE: Interface = Interface {"));
    assert!(code.contains("signature: \"2usun\","));
    assert!(code.contains("static WC_LAMP_MAKER_REQUESTS_MAKE_LAMP_TYPES"));
    assert!(code.contains("Some(&WC_LAMP_INTERFACE),"));
    assert!(code.contains("is_destructor: true,"));
}

#[test]
fn emits_headers_for_both_sides() {
    let protocol = parse_stream(PROTOCOL.as_bytes()).unwrap();
    for side in [Side::Client, Side::Server] {
        let mut out = Vec::new();
        emit_header(&protocol, side, &mut out).unwrap();
        let header = String::from_utf8(out).unwrap();

        assert!(header.contains("pub mod wc_lamp {"));
        assert!(header.contains("pub const VERSION: u32 = 3;"));
        assert!(header.contains("pub const REQ_DESTROY_OPCODE: u16 = 0;"));
        assert!(header.contains("pub const REQ_BIND_THING_SINCE: u32 = 2;"));
        assert!(header.contains("pub const EVT_GLOW_OPCODE: u16 = 0;"));
        assert!(header.contains("pub enum Error {"));
        assert!(header.contains("InvalidLevel = 0,"));
        assert!(header.contains("Busy = 0x1,"));
        // bitfields become constant modules
        assert!(header.contains("pub mod mode {"));
        assert!(header.contains("pub const PULSE: u32 = 2;"));
    }
}

#[test]
fn destroy_request_must_be_destructor() {
    let xml = r#"
<protocol name="broken">
  <interface name="wc_thing" version="1">
    <request name="destroy"></request>
  </interface>
</protocol>
"#;
    let err = parse_stream(xml.as_bytes()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("destructor"), "unexpected error: {msg}");
    assert!(msg.contains("line"), "error should carry a location: {msg}");
}

#[test]
fn unknown_arg_type_is_fatal() {
    let xml = r#"
<protocol name="broken">
  <interface name="wc_thing" version="1">
    <request name="poke">
      <arg name="what" type="bogus"/>
    </request>
  </interface>
</protocol>
"#;
    let err = parse_stream(xml.as_bytes()).unwrap_err();
    assert!(err.to_string().contains("unknown type"));
}

#[test]
fn allow_null_is_restricted_to_nullable_types() {
    let xml = r#"
<protocol name="broken">
  <interface name="wc_thing" version="1">
    <request name="poke">
      <arg name="count" type="uint" allow-null="true"/>
    </request>
  </interface>
</protocol>
"#;
    assert!(parse_stream(xml.as_bytes()).is_err());
}

#[test]
fn interface_attribute_is_restricted_to_object_types() {
    let xml = r#"
<protocol name="broken">
  <interface name="wc_thing" version="1">
    <request name="poke">
      <arg name="label" type="string" interface="wc_lamp"/>
    </request>
  </interface>
</protocol>
"#;
    assert!(parse_stream(xml.as_bytes()).is_err());
}

#[test]
fn missing_interface_version_is_fatal() {
    let xml = r#"
<protocol name="broken">
  <interface name="wc_thing">
    <request name="destroy" type="destructor"></request>
  </interface>
</protocol>
"#;
    assert!(parse_stream(xml.as_bytes()).is_err());
}

#[test]
fn since_decrease_warns_but_does_not_fail() {
    let xml = r#"
<protocol name="quirky">
  <interface name="wc_thing" version="3">
    <request name="first" since="3"></request>
    <request name="second" since="2"></request>
    <event name="third"></event>
  </interface>
</protocol>
"#;
    let protocol = parse_stream(xml.as_bytes()).unwrap();
    let thing = &protocol.interfaces[0];
    assert_eq!(thing.requests[1].since, 2);
    // event tracking is independent of the request kind
    assert_eq!(thing.events[0].since, 1);
}
