mod common;

use std::sync::Arc;

use common::*;
use waycore_protocol::core_interfaces::{wl_registry, WL_REGISTRY_INTERFACE};
use waycore_protocol::message;
use waycore_protocol::protocol::Argument;
use waycore_server::{ObjectFlags, Readiness};

// wl_display error codes
const INVALID_OBJECT: u32 = 0;
const INVALID_METHOD: u32 = 1;

fn cstr(text: &str) -> Option<Box<std::ffi::CString>> {
    Some(Box::new(std::ffi::CString::new(text).unwrap()))
}

/// Bind a wc_quad global as object 3 and return its name.
fn bind_quad(
    display: &waycore_server::Display<()>,
    client_id: &waycore_server::ClientId,
    wire: &mut WireClient,
    log: &Arc<std::sync::Mutex<Vec<String>>>,
    version: u32,
) -> u32 {
    let global_id =
        display.handle().create_global(&WC_QUAD_INTERFACE, 3, Arc::new(QuadGlobal { log: log.clone() }));
    // get_registry(new id 2)
    wire.send(message!(1, 1, [Argument::NewId(2)]), "n");
    wire.register(2, &WL_REGISTRY_INTERFACE);
    // bind(name, "wc_quad", version, new id 3)
    wire.send(
        message!(
            2,
            wl_registry::REQ_BIND,
            [
                Argument::Uint(global_id.name()),
                Argument::Str(cstr("wc_quad")),
                Argument::Uint(version),
                Argument::NewId(3),
            ],
        ),
        "usun",
    );
    wire.register(3, &WC_QUAD_INTERFACE);
    display.dispatch_client(&mut (), client_id, Readiness::READABLE).unwrap();
    display.flush_clients().unwrap();
    global_id.name()
}

#[test]
fn request_reaches_object_data() {
    let (display, client_id, mut wire, log) = display_pair();
    bind_quad(&display, &client_id, &mut wire, &log, 3);

    wire.send(message!(3, REQ_SET_TITLE, [Argument::Str(cstr("ornament"))]), "s");
    wire.send(message!(3, REQ_SPIN, [Argument::Uint(7)]), "2u");
    let dispatched = display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();
    assert_eq!(dispatched, 2);

    let log = log.lock().unwrap();
    assert!(log.contains(&"set_title@3".to_string()));
    assert!(log.contains(&"spin@3".to_string()));
}

#[test]
fn unknown_object_posts_invalid_object() {
    let (display, client_id, mut wire, _log) = display_pair();

    // a request to an id nothing lives at
    wire.send(message!(42, 0, [Argument::Uint(0)]), "u");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    let events = wire.recv_all();
    let (code, text) = events.iter().find_map(as_display_error).expect("no error event");
    assert_eq!(code, INVALID_OBJECT);
    assert!(text.contains("invalid object 42"), "unexpected message: {text}");
    wire.assert_closed();
}

#[test]
fn out_of_range_opcode_posts_invalid_method() {
    let (display, client_id, mut wire, _log) = display_pair();

    // wl_display only has two requests
    wire.send(message!(1, 9, [Argument::Uint(0)]), "u");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    let events = wire.recv_all();
    let (code, text) = events.iter().find_map(as_display_error).expect("no error event");
    assert_eq!(code, INVALID_METHOD);
    assert!(text.contains("invalid method 9"), "unexpected message: {text}");
    wire.assert_closed();
}

#[test]
fn version_below_since_posts_invalid_method() {
    let (display, client_id, mut wire, log) = display_pair();
    // bind the quad at version 1, spin needs version 2
    bind_quad(&display, &client_id, &mut wire, &log, 1);

    wire.send(message!(3, REQ_SPIN, [Argument::Uint(1)]), "2u");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    let events = wire.recv_all();
    let (code, _) = events.iter().find_map(as_display_error).expect("no error event");
    assert_eq!(code, INVALID_METHOD);
    assert!(!log.lock().unwrap().contains(&"spin@3".to_string()));
    wire.assert_closed();
}

#[test]
fn legacy_objects_skip_the_version_gate() {
    let (display, client_id, mut wire, log) = display_pair();
    let quad = display
        .handle()
        .create_object_with_flags(
            &client_id,
            &WC_QUAD_INTERFACE,
            1,
            ObjectFlags::LEGACY,
            Arc::new(QuadData { log: log.clone() }),
        )
        .unwrap();

    // version 1 object, since-2 request: allowed for legacy entries
    wire.send(message!(quad.protocol_id(), REQ_SPIN, [Argument::Uint(1)]), "2u");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    assert!(log.lock().unwrap().contains(&format!("spin@{}", quad.protocol_id())));
}

#[test]
fn malformed_payload_posts_invalid_method() {
    let (display, client_id, mut wire, log) = display_pair();
    bind_quad(&display, &client_id, &mut wire, &log, 3);

    // set_title declares a string; a zero length is no string at all
    wire.send(message!(3, REQ_SET_TITLE, [Argument::Uint(0)]), "u");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    let events = wire.recv_all();
    let (code, text) = events.iter().find_map(as_display_error).expect("no error event");
    assert_eq!(code, INVALID_METHOD);
    assert!(text.contains("invalid arguments"), "unexpected message: {text}");
    wire.assert_closed();
}

#[test]
fn unknown_argument_object_posts_invalid_object() {
    let (display, client_id, mut wire, log) = display_pair();
    bind_quad(&display, &client_id, &mut wire, &log, 3);

    // attach to an id that was never created
    wire.send(message!(3, REQ_ATTACH, [Argument::Object(17)]), "?o");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    let events = wire.recv_all();
    let (code, text) = events.iter().find_map(as_display_error).expect("no error event");
    assert_eq!(code, INVALID_OBJECT);
    assert!(text.contains("invalid object 17"), "unexpected message: {text}");
}

#[test]
fn nullable_object_argument_accepts_null() {
    let (display, client_id, mut wire, log) = display_pair();
    bind_quad(&display, &client_id, &mut wire, &log, 3);

    wire.send(message!(3, REQ_ATTACH, [Argument::Object(0)]), "?o");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    assert!(log.lock().unwrap().contains(&"attach@3".to_string()));
}

#[test]
fn typed_new_id_creates_a_child_object() {
    let (display, client_id, mut wire, log) = display_pair();
    bind_quad(&display, &client_id, &mut wire, &log, 3);

    wire.send(message!(3, REQ_SPLIT, [Argument::NewId(4)]), "n");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();

    assert!(log.lock().unwrap().contains(&"split@3".to_string()));

    // the child inherits its data from the handler's return value and
    // is reachable at the client-chosen id
    wire.send(message!(4, REQ_SPIN, [Argument::Uint(2)]), "2u");
    display.dispatch_client(&mut (), &client_id, Readiness::READABLE).unwrap();
    assert!(log.lock().unwrap().contains(&"spin@4".to_string()));

    let info = display
        .handle()
        .object_for_protocol_id(&client_id, &WC_QUAD_INTERFACE, 4)
        .unwrap();
    assert_eq!(display.handle().object_info(&info).unwrap().version, 3);
}

#[test]
fn events_are_queued_until_flush_and_kept_in_order() {
    let (display, client_id, mut wire, log) = display_pair();
    bind_quad(&display, &client_id, &mut wire, &log, 3);
    wire.recv_all();

    let handle = display.handle();
    let quad = handle.object_for_protocol_id(&client_id, &WC_QUAD_INTERFACE, 3).unwrap();
    handle.send_event(message!(quad.clone(), 0, [Argument::Uint(1)])).unwrap();
    handle.send_event(message!(quad, 0, [Argument::Uint(2)])).unwrap();

    // nothing reaches the client before the flush
    assert!(wire.recv_all().is_empty());

    display.flush_clients().unwrap();
    let events = wire.recv_all();
    let pings: Vec<u32> = events
        .iter()
        .filter(|msg| msg.sender_id == 3)
        .map(|msg| match msg.args[0] {
            Argument::Uint(serial) => serial,
            _ => panic!("ping without a serial"),
        })
        .collect();
    assert_eq!(pings, vec![1, 2]);
}

#[test]
fn hangup_destroys_the_client() {
    let (display, client_id, wire, log) = display_pair();
    drop(wire);

    display.dispatch_client(&mut (), &client_id, Readiness::HANGUP).unwrap();

    let log = log.lock().unwrap();
    assert!(log.iter().any(|entry| entry.starts_with("disconnected:")));
}
