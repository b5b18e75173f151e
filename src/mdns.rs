//! mDNS responder (§4.8): hand-rolled DNS message encode/decode with
//! single-hop name compression, periodic unsolicited advertisement, and
//! service-browse query handling. No mDNS crate in the dependency graph —
//! this mirrors the donor's own appetite for a hand-rolled binary codec
//! over reaching for an off-the-shelf parser.

use std::net::Ipv4Addr;

use crate::byte_codec::{Endian, Reader, Writer};
use crate::error::MdnsError;

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_HINFO: u16 = 13;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_ANY: u16 = 255;

pub const CLASS_IN: u16 = 1;
pub const CACHE_FLUSH: u16 = 0x8000;

pub const SERVICE_TYPE_NAME: &str = "_wahoo-fitness-tnp._tcp.local";
pub const SERVICES_DNS_SD_NAME: &str = "_services._dns-sd._udp.local";

pub fn device_host_name(mac: &[u8; 6]) -> String {
    format!("Wahoo-KICKR-{:02X}{:02X}.local", mac[4], mac[5])
}

pub fn service_instance_name(mac: &[u8; 6]) -> String {
    format!("Wahoo KICKR {:02X}{:02X}.{}", mac[4], mac[5], SERVICE_TYPE_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

pub const FLAG_QR_RESPONSE: u16 = 0x8000;

impl Header {
    pub fn encode(&self, w: &mut Writer) {
        w.write_u16(self.id);
        w.write_u16(self.flags);
        w.write_u16(self.qd_count);
        w.write_u16(self.an_count);
        w.write_u16(self.ns_count);
        w.write_u16(self.ar_count);
    }

    pub fn decode(r: &mut Reader) -> Result<Header, MdnsError> {
        Ok(Header {
            id: r.read_u16()?,
            flags: r.read_u16()?,
            qd_count: r.read_u16()?,
            an_count: r.read_u16()?,
            ns_count: r.read_u16()?,
            ar_count: r.read_u16()?,
        })
    }

    pub fn is_query(&self) -> bool {
        self.flags & FLAG_QR_RESPONSE == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    pub fn cache_flush(mut self) -> Self {
        self.rclass |= CACHE_FLUSH;
        self
    }
}

/// Encode a dotted name as length-prefixed labels, zero-terminated. Never
/// emits compression pointers; only `decode_name` needs to understand them.
pub fn encode_name(name: &str, w: &mut Writer) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        w.write_u8(label.len() as u8);
        w.write_bytes(label.as_bytes());
    }
    w.write_u8(0);
}

/// Decode a name starting at `offset` within the full message `msg`.
/// Supports exactly one pointer hop (§4.8: "single-hop pointer sufficient
/// for this protocol profile"), resolving it and terminating the name.
/// Returns `(name, bytes_consumed_from_offset)`.
pub fn decode_name(msg: &[u8], offset: usize) -> Result<(String, usize), MdnsError> {
    decode_name_inner(msg, offset, true)
}

/// `allow_pointer` is false once a pointer has already been followed once,
/// so a pointer chain (or a pointer targeting itself) can recurse at most
/// one level deep instead of looping or blowing the stack on crafted input.
fn decode_name_inner(msg: &[u8], offset: usize, allow_pointer: bool) -> Result<(String, usize), MdnsError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut consumed_at_pointer: Option<usize> = None;

    loop {
        let len_byte = *msg.get(pos).ok_or(MdnsError::LabelOverrun)?;
        if len_byte == 0 {
            pos += 1;
            break;
        }

        let top_bits = len_byte >> 6;
        match top_bits {
            0b00 => {
                let len = len_byte as usize;
                let start = pos + 1;
                let end = start + len;
                if end > msg.len() {
                    return Err(MdnsError::LabelOverrun);
                }
                labels.push(String::from_utf8_lossy(&msg[start..end]).into_owned());
                pos = end;
            }
            0b11 => {
                if !allow_pointer {
                    return Err(MdnsError::LabelOverrun);
                }
                let low = *msg.get(pos + 1).ok_or(MdnsError::LabelOverrun)? as usize;
                let ptr_offset = (((len_byte as usize) & 0x3F) << 8) | low;
                if ptr_offset >= offset {
                    return Err(MdnsError::LabelOverrun);
                }
                if consumed_at_pointer.is_none() {
                    consumed_at_pointer = Some(pos + 2 - offset);
                }
                let (pointed_name, _) = decode_name_inner(msg, ptr_offset, false)?;
                if !pointed_name.is_empty() {
                    labels.push(pointed_name);
                }
                pos += 2;
                break;
            }
            _ => return Err(MdnsError::ReservedPointerPattern(top_bits)),
        }
    }

    let consumed = consumed_at_pointer.unwrap_or(pos - offset);
    Ok((labels.join("."), consumed))
}

pub fn encode_question(q: &Question, w: &mut Writer) {
    encode_name(&q.name, w);
    w.write_u16(q.qtype);
    w.write_u16(q.qclass);
}

pub fn decode_question(msg: &[u8], offset: usize) -> Result<(Question, usize), MdnsError> {
    let (name, name_len) = decode_name(msg, offset)?;
    let mut pos = offset + name_len;
    let qtype = u16::from_be_bytes([
        *msg.get(pos).ok_or(MdnsError::LabelOverrun)?,
        *msg.get(pos + 1).ok_or(MdnsError::LabelOverrun)?,
    ]);
    pos += 2;
    let qclass = u16::from_be_bytes([
        *msg.get(pos).ok_or(MdnsError::LabelOverrun)?,
        *msg.get(pos + 1).ok_or(MdnsError::LabelOverrun)?,
    ]);
    pos += 2;
    Ok((Question { name, qtype, qclass }, pos - offset))
}

pub fn encode_rr(rr: &ResourceRecord, w: &mut Writer) {
    encode_name(&rr.name, w);
    w.write_u16(rr.rtype);
    w.write_u16(rr.rclass);
    w.write_u32(rr.ttl);
    w.write_u16(rr.rdata.len() as u16);
    w.write_bytes(&rr.rdata);
}

/// Build the A, HINFO, and SRV records shared by advertisement and
/// query-response paths.
pub fn a_record(host_name: &str, addr: Ipv4Addr, ttl: u32) -> ResourceRecord {
    ResourceRecord {
        name: host_name.to_string(),
        rtype: TYPE_A,
        rclass: CLASS_IN,
        ttl,
        rdata: addr.octets().to_vec(),
    }
}

pub fn hinfo_record(host_name: &str, ttl: u32) -> ResourceRecord {
    let cpu = b"RUST";
    let os = b"EMULATOR";
    let mut rdata = Vec::with_capacity(2 + cpu.len() + os.len());
    rdata.push(cpu.len() as u8);
    rdata.extend_from_slice(cpu);
    rdata.push(os.len() as u8);
    rdata.extend_from_slice(os);
    ResourceRecord { name: host_name.to_string(), rtype: TYPE_HINFO, rclass: CLASS_IN, ttl, rdata }
}

pub fn srv_record(service_name: &str, host_name: &str, port: u16, ttl: u32) -> ResourceRecord {
    let mut w = Writer::new(Endian::Big);
    w.write_u16(0); // priority
    w.write_u16(0); // weight
    w.write_u16(port);
    encode_name(host_name, &mut w);
    ResourceRecord { name: service_name.to_string(), rtype: TYPE_SRV, rclass: CLASS_IN, ttl, rdata: w.into_inner() }
}

pub fn ptr_record(queried_name: &str, target_name: &str, ttl: u32) -> ResourceRecord {
    let mut w = Writer::new(Endian::Big);
    encode_name(target_name, &mut w);
    ResourceRecord { name: queried_name.to_string(), rtype: TYPE_PTR, rclass: CLASS_IN, ttl, rdata: w.into_inner() }
}

pub fn txt_record(service_name: &str, serial_number: &str, mac: &[u8; 6]) -> ResourceRecord {
    let mac_str = format!(
        "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
    let entries = [
        format!("serial-number={serial_number}"),
        format!("mac-address={mac_str}"),
        "ble-service-uuids=0x1818,0x1826".to_string(),
    ];
    let mut rdata = Vec::new();
    for e in entries {
        rdata.push(e.len() as u8);
        rdata.extend_from_slice(e.as_bytes());
    }
    ResourceRecord { name: service_name.to_string(), rtype: TYPE_TXT, rclass: CLASS_IN, ttl: 120, rdata }
}

/// One full message: header, questions, and the three record sections.
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(Endian::Big);
        self.header.encode(&mut w);
        for q in &self.questions {
            encode_question(q, &mut w);
        }
        for rr in &self.answers {
            encode_rr(rr, &mut w);
        }
        for rr in &self.authorities {
            encode_rr(rr, &mut w);
        }
        for rr in &self.additionals {
            encode_rr(rr, &mut w);
        }
        w.into_inner()
    }

    pub fn decode(msg: &[u8]) -> Result<Message, MdnsError> {
        let mut r = Reader::new(msg, Endian::Big);
        let header = Header::decode(&mut r)?;
        let mut pos = r.position();

        let mut questions = Vec::with_capacity(header.qd_count as usize);
        for _ in 0..header.qd_count {
            let (q, len) = decode_question(msg, pos)?;
            pos += len;
            questions.push(q);
        }

        Ok(Message {
            header,
            questions,
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        })
    }
}

/// Builds the three unsolicited advertisement packets sent 250 ms apart at
/// startup, and also used for the 60-second periodic re-advertisement:
/// header with three Questions + three Authority records (§4.8).
pub fn build_advertisement_probe(mac: &[u8; 6], addr: Ipv4Addr, port: u16, id: u16) -> Vec<u8> {
    let host = device_host_name(mac);
    let service = service_instance_name(mac);

    Message {
        header: Header { id, flags: 0, qd_count: 3, an_count: 0, ns_count: 3, ar_count: 0 },
        questions: vec![
            Question { name: host.clone(), qtype: TYPE_ANY, qclass: CLASS_IN },
            Question { name: host.clone(), qtype: TYPE_ANY, qclass: CLASS_IN },
            Question { name: service.clone(), qtype: TYPE_ANY, qclass: CLASS_IN },
        ],
        answers: Vec::new(),
        authorities: vec![a_record(&host, addr, 120), hinfo_record(&host, 120), srv_record(&service, &host, port, 120)],
        additionals: Vec::new(),
    }
    .encode()
}

/// The advertisement response that follows the probes: QR=1, three cache
/// flushing Answer records.
pub fn build_advertisement_response(mac: &[u8; 6], addr: Ipv4Addr, port: u16, id: u16) -> Vec<u8> {
    let host = device_host_name(mac);
    let service = service_instance_name(mac);

    Message {
        header: Header { id, flags: FLAG_QR_RESPONSE, qd_count: 0, an_count: 3, ns_count: 0, ar_count: 0 },
        questions: Vec::new(),
        answers: vec![
            a_record(&host, addr, 120).cache_flush(),
            hinfo_record(&host, 120).cache_flush(),
            srv_record(&service, &host, port, 120).cache_flush(),
        ],
        authorities: Vec::new(),
        additionals: Vec::new(),
    }
    .encode()
}

/// Handles one received datagram. Returns `Some(response_bytes)` when the
/// message is a browse query this responder should answer, `None`
/// otherwise (including loopback and malformed-name cases, both logged by
/// the caller).
pub fn handle_query(
    msg: &[u8],
    source: Ipv4Addr,
    bound_addr: Ipv4Addr,
    mac: &[u8; 6],
    port: u16,
    serial_number: &str,
) -> Result<Option<Vec<u8>>, MdnsError> {
    if source == bound_addr {
        return Ok(None); // loopback suppression
    }

    let parsed = Message::decode(msg)?;
    if !parsed.header.is_query() {
        return Ok(None);
    }

    let host = device_host_name(mac);
    let service = service_instance_name(mac);

    for q in &parsed.questions {
        if q.qtype != TYPE_PTR || q.qclass != CLASS_IN {
            continue;
        }
        let is_catalog = q.name == SERVICES_DNS_SD_NAME;
        let is_service_type = q.name == SERVICE_TYPE_NAME;
        if !is_catalog && !is_service_type {
            continue;
        }

        let ptr_target = if is_catalog { SERVICE_TYPE_NAME.to_string() } else { service.clone() };

        let response = Message {
            header: Header { id: parsed.header.id, flags: FLAG_QR_RESPONSE, qd_count: 0, an_count: 4, ns_count: 0, ar_count: 0 },
            questions: Vec::new(),
            answers: vec![
                ptr_record(&q.name, &ptr_target, 120),
                a_record(&host, bound_addr, 120).cache_flush(),
                srv_record(&service, &host, port, 120).cache_flush(),
                txt_record(&service, serial_number, mac),
            ],
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
        .encode();

        return Ok(Some(response));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip_no_compression() {
        let mut w = Writer::new(Endian::Big);
        encode_name("Wahoo-KICKR-1234.local", &mut w);
        let buf = w.into_inner();
        let (name, len) = decode_name(&buf, 0).unwrap();
        assert_eq!(name, "Wahoo-KICKR-1234.local");
        assert_eq!(len, buf.len());
    }

    #[test]
    fn pointer_compression_resolves_single_hop() {
        let mut w = Writer::new(Endian::Big);
        encode_name("local", &mut w); // offset 0
        let local_offset = 0u16;
        w.write_u8(3);
        w.write_bytes(b"foo");
        w.write_u8(0xC0 | ((local_offset >> 8) as u8));
        w.write_u8(local_offset as u8);
        let buf = w.into_inner();

        let pointer_name_offset = 7; // len('local')+2 = 7, start of "foo" label
        let (name, _) = decode_name(&buf, pointer_name_offset).unwrap();
        assert_eq!(name, "foo.local");
    }

    #[test]
    fn self_referential_pointer_errors_instead_of_recursing() {
        // Byte at offset 0 is a pointer whose target is offset 0 itself.
        let buf = [0xC0u8, 0x00];
        assert!(matches!(decode_name(&buf, 0), Err(MdnsError::LabelOverrun)));
    }

    #[test]
    fn forward_pointer_is_rejected() {
        // Pointer at offset 0 targets offset 4, which is ahead of it.
        let buf = [0xC0u8, 0x04, 0x00, 0x00, 0x00];
        assert!(matches!(decode_name(&buf, 0), Err(MdnsError::LabelOverrun)));
    }

    #[test]
    fn pointer_chain_longer_than_one_hop_is_rejected() {
        let mut w = Writer::new(Endian::Big);
        encode_name("local", &mut w); // offset 0
        w.write_u8(0xC0); // offset 7: pointer back to offset 0
        w.write_u8(0x00);
        let first_pointer_offset = 7u16;
        w.write_u8(0xC0 | ((first_pointer_offset >> 8) as u8)); // offset 9: pointer to the first pointer
        w.write_u8(first_pointer_offset as u8);
        let buf = w.into_inner();

        assert!(matches!(decode_name(&buf, 9), Err(MdnsError::LabelOverrun)));
    }

    #[test]
    fn reserved_pointer_pattern_rejected() {
        let buf = [0b0100_0000u8, 0x00, 0x00];
        assert!(matches!(decode_name(&buf, 0), Err(MdnsError::ReservedPointerPattern(0b01))));
        let buf2 = [0b1000_0000u8, 0x00, 0x00];
        assert!(matches!(decode_name(&buf2, 0), Err(MdnsError::ReservedPointerPattern(0b10))));
    }

    #[test]
    fn label_overrun_is_an_error_not_a_panic() {
        let buf = [10u8, b'a', b'b'];
        assert!(matches!(decode_name(&buf, 0), Err(MdnsError::LabelOverrun)));
    }

    #[test]
    fn service_browse_scenario_matches_literal() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        let mut query_w = Writer::new(Endian::Big);
        Header { id: 42, flags: 0, qd_count: 1, an_count: 0, ns_count: 0, ar_count: 0 }.encode(&mut query_w);
        encode_question(&Question { name: SERVICE_TYPE_NAME.to_string(), qtype: TYPE_PTR, qclass: CLASS_IN }, &mut query_w);
        let query = query_w.into_inner();

        let response = handle_query(&query, Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(192, 168, 1, 1), &mac, 36866, "SN123")
            .unwrap()
            .expect("service-type PTR query should be answered");

        let mut r = Reader::new(&response, Endian::Big);
        let header = Header::decode(&mut r).unwrap();
        assert!(!header.is_query());
        assert_eq!(header.an_count, 4);
    }

    #[test]
    fn loopback_source_suppressed() {
        let mac = [0; 6];
        let bound = Ipv4Addr::new(10, 0, 0, 2);
        let mut query_w = Writer::new(Endian::Big);
        Header { id: 1, flags: 0, qd_count: 1, an_count: 0, ns_count: 0, ar_count: 0 }.encode(&mut query_w);
        encode_question(&Question { name: SERVICE_TYPE_NAME.to_string(), qtype: TYPE_PTR, qclass: CLASS_IN }, &mut query_w);
        let query = query_w.into_inner();

        let response = handle_query(&query, bound, bound, &mac, 36866, "SN").unwrap();
        assert!(response.is_none());
    }

    #[test]
    fn device_and_service_names_use_mac_low_bytes() {
        let mac = [0, 0, 0, 0, 0xAB, 0xCD];
        assert_eq!(device_host_name(&mac), "Wahoo-KICKR-ABCD.local");
        assert!(service_instance_name(&mac).starts_with("Wahoo KICKR ABCD."));
    }
}
