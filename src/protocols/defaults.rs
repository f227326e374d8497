//! Built-in protocol registrations
//!
//! Detection fingerprints, default ports and direction policies for the
//! protocols the engine recognizes out of the box. Parsing stays with
//! the sink state; deployments plug real parsers in at registration.

use super::parser::sink_state;
use super::{FirstDataDir, Pattern, ProbeVerdict, ProtocolDef};
use crate::core::IpProtocol;

/// All built-in protocol definitions, in registration order
pub fn definitions() -> Vec<ProtocolDef> {
    vec![http(), tls(), ssh(), smtp(), ftp(), dns_udp()]
}

fn http() -> ProtocolDef {
    ProtocolDef {
        name: "http",
        ipproto: IpProtocol::Tcp,
        ts_patterns: vec![
            Pattern::prefix(b"GET "),
            Pattern::prefix(b"POST "),
            Pattern::prefix(b"HEAD "),
            Pattern::prefix(b"PUT "),
            Pattern::prefix(b"DELETE "),
            Pattern::prefix(b"OPTIONS "),
            Pattern::prefix(b"CONNECT "),
        ],
        tc_patterns: vec![Pattern::prefix(b"HTTP/")],
        probe_ts: None,
        probe_tc: None,
        default_port: Some(80),
        first_data_dir: FirstDataDir::ToServer,
        make_state: sink_state,
    }
}

fn tls() -> ProtocolDef {
    ProtocolDef {
        name: "tls",
        ipproto: IpProtocol::Tcp,
        // TLS record header: handshake (0x16), major version 3
        ts_patterns: vec![Pattern::prefix(&[0x16, 0x03])],
        tc_patterns: vec![Pattern::prefix(&[0x16, 0x03])],
        probe_ts: None,
        probe_tc: None,
        default_port: Some(443),
        first_data_dir: FirstDataDir::ToServer,
        make_state: sink_state,
    }
}

fn ssh() -> ProtocolDef {
    ProtocolDef {
        name: "ssh",
        ipproto: IpProtocol::Tcp,
        ts_patterns: vec![Pattern::prefix(b"SSH-")],
        tc_patterns: vec![Pattern::prefix(b"SSH-")],
        probe_ts: None,
        probe_tc: None,
        default_port: Some(22),
        first_data_dir: FirstDataDir::Any,
        make_state: sink_state,
    }
}

fn smtp() -> ProtocolDef {
    ProtocolDef {
        name: "smtp",
        ipproto: IpProtocol::Tcp,
        ts_patterns: vec![
            Pattern::within(b"EHLO ", 5),
            Pattern::within(b"HELO ", 5),
        ],
        tc_patterns: vec![Pattern::prefix(b"220 "), Pattern::prefix(b"220-")],
        probe_ts: None,
        probe_tc: None,
        default_port: Some(25),
        // the server greets first
        first_data_dir: FirstDataDir::ToClient,
        make_state: sink_state,
    }
}

fn ftp() -> ProtocolDef {
    ProtocolDef {
        name: "ftp",
        ipproto: IpProtocol::Tcp,
        ts_patterns: vec![
            Pattern::prefix(b"USER "),
            Pattern::prefix(b"PASS "),
            Pattern::prefix(b"FEAT"),
        ],
        tc_patterns: vec![],
        probe_ts: None,
        probe_tc: None,
        default_port: Some(21),
        first_data_dir: FirstDataDir::Any,
        make_state: sink_state,
    }
}

fn dns_udp() -> ProtocolDef {
    ProtocolDef {
        name: "dns",
        ipproto: IpProtocol::Udp,
        ts_patterns: vec![],
        tc_patterns: vec![],
        probe_ts: Some(dns_probe),
        probe_tc: Some(dns_probe),
        default_port: Some(53),
        first_data_dir: FirstDataDir::Any,
        make_state: sink_state,
    }
}

/// Sanity-check a DNS message header
fn dns_probe(data: &[u8]) -> ProbeVerdict {
    if data.len() < 12 {
        return ProbeVerdict::Incomplete;
    }
    let opcode = (data[2] >> 3) & 0x0f;
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    let ancount = u16::from_be_bytes([data[6], data[7]]);

    // opcodes above UPDATE(5) are unassigned; an empty message that
    // neither asks nor answers is not DNS
    if opcode > 5 || (qdcount == 0 && ancount == 0) {
        return ProbeVerdict::Failed;
    }
    if qdcount > 32 {
        return ProbeVerdict::Failed;
    }
    ProbeVerdict::Match
}
