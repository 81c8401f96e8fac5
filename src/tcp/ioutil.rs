//! Wire-side collaborator: encodes outgoing segments and writes them to the
//! tun device standing in for the IP layer (spec S6, "wire side"). This is
//! the narrow interface spec.md S1 carves out as an external collaborator;
//! nothing here participates in state-machine decisions.

use std::io::{Cursor, Write};

use etherparse::{Ipv4Header, TcpHeader, TcpHeaderSlice, TcpOptionElement};
use log::trace;
use tidy_tuntap::Tun;

use super::Quad;

const TTL: u8 = 64;

#[allow(clippy::too_many_arguments)]
fn write_segment(
    quad: &Quad,
    seq: u32,
    ack: u32,
    wnd: u16,
    tun: &mut Tun,
    data: &[u8],
    fin: bool,
    syn: bool,
    ack_flag: bool,
    mss: Option<u16>,
) {
    let mut tcph = TcpHeader::new(quad.dst.port, quad.src.port, seq, wnd);
    tcph.acknowledgment_number = ack;
    tcph.fin = fin;
    tcph.syn = syn;
    tcph.ack = ack_flag;

    if let Some(mss) = mss {
        tcph.set_options(&[TcpOptionElement::MaximumSegmentSize(mss)])
            .expect("mss option always fits in the header");
    }

    let payload_len = tcph.header_len() as usize + data.len();
    let ip4h = Ipv4Header::new(
        payload_len as u16,
        TTL,
        6,
        quad.dst.ipv4.octets(),
        quad.src.ipv4.octets(),
    );

    tcph.checksum = tcph
        .calc_checksum_ipv4(&ip4h, data)
        .expect("checksum computation never fails for a well-formed header");

    let mut buf = [0u8; 1500];
    let len = {
        let mut cursor = Cursor::new(&mut buf[..]);
        ip4h.write(&mut cursor).unwrap();
        tcph.write(&mut cursor).unwrap();
        cursor.write_all(data).unwrap();
        cursor.position() as usize
    };

    trace!(
        "tx {:?} seq={seq} ack={ack} wnd={wnd} fin={fin} syn={syn} ack_flag={ack_flag} len={}",
        quad,
        data.len()
    );
    let _ = tun.write(&buf[..len]);
}

/// General-purpose segment writer used by the transmit and retransmission
/// path, which needs to set arbitrary flag combinations and an optional MSS
/// option (carried only on SYN segments).
#[allow(clippy::too_many_arguments)]
pub fn write_data(
    quad: Quad,
    seq: u32,
    ack: u32,
    wnd: u16,
    tun: &mut Tun,
    data: &[u8],
    fin: bool,
    syn: bool,
    ack_flag: bool,
    mss: Option<u16>,
) {
    write_segment(&quad, seq, ack, wnd, tun, data, fin, syn, ack_flag, mss);
}

pub fn write_syn(quad: &Quad, seq: u32, wnd: u16, mss: u16, tun: &mut Tun) {
    write_segment(quad, seq, 0, wnd, tun, &[], false, true, false, Some(mss));
}

pub fn write_synack(quad: &Quad, seq: u32, ack: u32, wnd: u16, mss: u16, tun: &mut Tun) {
    write_segment(quad, seq, ack, wnd, tun, &[], false, true, true, Some(mss));
}

pub fn write_ack(quad: &Quad, seq: u32, ack: u32, wnd: u16, tun: &mut Tun) {
    write_segment(quad, seq, ack, wnd, tun, &[], false, false, true, None);
}

/// Builds and sends a bare RST carrying `seq`, used by a local `abort()`
/// rather than as a reply to an incoming segment.
pub fn write_local_reset(quad: &Quad, seq: u32, tun: &mut Tun) {
    let mut tcph = TcpHeader::new(quad.dst.port, quad.src.port, seq, 0);
    tcph.rst = true;

    let ip4h = Ipv4Header::new(tcph.header_len(), TTL, 6, quad.dst.ipv4.octets(), quad.src.ipv4.octets());
    tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, &[]).unwrap();

    let mut buf = [0u8; 1500];
    let len = {
        let mut cursor = Cursor::new(&mut buf[..]);
        ip4h.write(&mut cursor).unwrap();
        tcph.write(&mut cursor).unwrap();
        cursor.position() as usize
    };

    trace!("tx {:?} local RST seq={seq}", quad);
    let _ = tun.write(&buf[..len]);
}

/// Builds and sends a RST in response to an unacceptable or unmatched
/// incoming segment (RFC 9293 S3.10.7.1).
pub fn write_reset(quad: &Quad, tcph: &TcpHeaderSlice, data: &[u8], tun: &mut Tun) {
    let (seq, ack, ack_flag) = if tcph.ack() {
        (tcph.acknowledgment_number(), 0, false)
    } else {
        let seg_len =
            data.len() as u32 + if tcph.syn() { 1 } else { 0 } + if tcph.fin() { 1 } else { 0 };
        (0, tcph.sequence_number().wrapping_add(seg_len), true)
    };

    let mut tcph_out = TcpHeader::new(quad.dst.port, quad.src.port, seq, 0);
    tcph_out.rst = true;
    tcph_out.ack = ack_flag;
    tcph_out.acknowledgment_number = ack;

    let ip4h = Ipv4Header::new(
        tcph_out.header_len(),
        TTL,
        6,
        quad.dst.ipv4.octets(),
        quad.src.ipv4.octets(),
    );
    tcph_out.checksum = tcph_out.calc_checksum_ipv4(&ip4h, &[]).unwrap();

    let mut buf = [0u8; 1500];
    let len = {
        let mut cursor = Cursor::new(&mut buf[..]);
        ip4h.write(&mut cursor).unwrap();
        tcph_out.write(&mut cursor).unwrap();
        cursor.position() as usize
    };

    trace!("tx {:?} RST seq={seq} ack={ack}", quad);
    let _ = tun.write(&buf[..len]);
}
