//! Property-based tests for the wire formats and the port protocol.

use dspflow::context::{Outbox, ProcessContext, Request};
use dspflow::error::{ErrorClass, Severity};
use dspflow::message::{decode_params, decode_params_ext, encode_params, encode_params_ext};
use dspflow::port::{InputPort, OutputEvent, OutputPort, UnrouteStart};
use dspflow::{Address, Message, Opcode, ReturnCode, RouteDesc, Status};
use proptest::prelude::*;

const HOST: Address = Address::client(0);
const PEER: Address = Address::new(0, 2, 0);

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every field of an address lands in its documented byte lane.
    #[test]
    fn address_fields_occupy_their_lanes(core: u8, instance: u16, port: u8) {
        let addr = Address::new(core, instance, port);
        let raw = addr.pack();
        prop_assert_eq!((raw >> 24) as u8, core);
        prop_assert_eq!((raw >> 8) as u16, instance);
        prop_assert_eq!(raw as u8, port);
        prop_assert_eq!(Address::from_raw(raw), addr);
    }

    /// Flag bits never change which handler an opcode selects.
    #[test]
    fn opcode_ignores_flag_bits(raw: u16) {
        match Opcode::from_raw(raw) {
            Ok(op) => {
                prop_assert_eq!(op.index(), raw & 0x3f);
                prop_assert_eq!(Opcode::from_raw(op.raw()).unwrap(), op);
            }
            Err(_) => prop_assert!(Opcode::from_raw(raw & 0x3f).is_err()),
        }
    }

    #[test]
    fn return_code_fields_survive_packing(fatal: bool, class in 0u8..16, codec in 0u8..128, sub in 0u8..32) {
        let severity = if fatal { Severity::Fatal } else { Severity::NonFatal };
        let code = ReturnCode::new(severity, ErrorClass::Other(class), codec, sub);
        prop_assert_eq!(code.is_fatal(), fatal);
        prop_assert_eq!(code.codec(), codec);
        prop_assert_eq!(code.subcode(), sub);
        let expected = match class {
            0 => ErrorClass::Api,
            1 => ErrorClass::Config,
            2 => ErrorClass::Execute,
            c => ErrorClass::Other(c),
        };
        prop_assert_eq!(code.class(), expected);
        prop_assert_eq!(ReturnCode::from_raw(code.raw()), code);
    }

    #[test]
    fn param_pairs_decode_as_encoded(pairs in prop::collection::vec(any::<(u32, u32)>(), 0..16)) {
        let bytes = encode_params(&pairs);
        prop_assert_eq!(bytes.len(), pairs.len() * 8);
        prop_assert_eq!(decode_params(&bytes).unwrap(), pairs);
    }

    /// Truncated or garbage payloads are refused, never mis-read.
    #[test]
    fn param_payloads_tolerate_garbage(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        prop_assert_eq!(decode_params(&bytes).is_ok(), bytes.len() % 8 == 0);
        if let Ok(records) = decode_params_ext(&bytes) {
            let refs: Vec<(u32, &[u8])> = records.iter().map(|(id, v)| (*id, v.as_slice())).collect();
            prop_assert!(encode_params_ext(&refs).len() <= bytes.len());
        }
    }

    /// Whatever the buffer boundaries, filling frames from an input port
    /// yields the bytes in order and answers every buffer exactly once.
    #[test]
    fn input_port_preserves_byte_order(
        buffers in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..8),
        frame in 1usize..12,
    ) {
        let mut port = InputPort::new(Address::new(0, 1, 0), 16);
        let mut scratch = [0u8; 0];
        let mut outbox = Outbox::default();
        let mut out = Vec::new();
        {
            let mut cx = ProcessContext::new(0, &mut scratch, &mut outbox);
            for bytes in &buffers {
                port.put(Message::empty_this_buffer(HOST, port.addr(), bytes.clone()), &mut cx).unwrap();
            }
            let mut block = vec![0u8; frame];
            while port.queued() > 0 {
                let mut filled = 0;
                port.fill(&mut block, &mut filled, &mut cx);
                prop_assert!(filled > 0);
                out.extend_from_slice(&block[..filled]);
            }
        }

        prop_assert_eq!(out, buffers.concat());
        prop_assert_eq!(outbox.messages.len(), buffers.len());
        prop_assert!(outbox.messages.iter().all(|m| m.status == Some(Status::Ok) && m.dst == HOST));
        prop_assert!(!port.is_setup());
    }

    /// A routed pool never gains or loses buffers, and unroute completes
    /// only once the peer has answered everything it holds.
    #[test]
    fn routed_pool_is_conserved(buffers in 1u32..6, ops in prop::collection::vec(any::<bool>(), 0..32)) {
        let mut port = OutputPort::new(Address::new(0, 1, 1), 4, 8);
        port.route(&RouteDesc::new(PEER, buffers), 8).unwrap();
        let mut scratch = [0u8; 0];
        let mut held: Vec<Message> = Vec::new();

        for produce in ops {
            let mut outbox = Outbox::default();
            let mut cx = ProcessContext::new(0, &mut scratch, &mut outbox);
            if produce && port.has_buffer() {
                port.produce_from(&[7; 4], &mut cx).unwrap();
            } else if let Some(msg) = held.pop() {
                let event = port.put(msg.into_response(Status::Ok), &mut cx);
                let pooled = matches!(event, OutputEvent::Buffer { .. });
                prop_assert!(pooled, "returned buffer goes back to the pool");
            }
            drop(cx);
            held.extend(outbox.messages.drain(..).filter(|m| m.dst == PEER));
            prop_assert_eq!(port.in_flight(), held.len());
            prop_assert_eq!(port.in_flight() + port.queued(), buffers as usize);
        }

        let mut outbox = Outbox::default();
        let mut cx = ProcessContext::new(0, &mut scratch, &mut outbox);
        let mut req = Request::new(Message::unroute(HOST, port.addr()));
        let start = port.unroute(&mut req, &mut cx).unwrap();
        if held.is_empty() {
            prop_assert_eq!(start, UnrouteStart::Done);
            prop_assert!(!req.is_taken());
        } else {
            prop_assert_eq!(start, UnrouteStart::Pending);
            prop_assert!(req.is_taken());
            prop_assert!(!port.has_buffer());
            for msg in held.drain(..) {
                port.put(msg.into_response(Status::Ok), &mut cx);
                prop_assert!(port.is_routed());
            }
            drop(cx);
            let flush = outbox
                .messages
                .drain(..)
                .find(|m| m.opcode == Opcode::Flush)
                .unwrap();
            let mut cx = ProcessContext::new(0, &mut scratch, &mut outbox);
            let event = port.put(flush.into_response(Status::Ok), &mut cx);
            let unrouted = matches!(event, OutputEvent::Echo { unrouted: Some(_), .. });
            prop_assert!(unrouted, "flush echo completes the unroute");
        }
        prop_assert!(!port.is_routed());
        prop_assert_eq!(port.in_flight(), 0);
    }
}
