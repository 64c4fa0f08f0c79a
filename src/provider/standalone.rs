//! Self-hosted DNS-01 provider (RFC 1035, UDP only).
//!
//! Answers `IN TXT` questions for the `_acme-challenge` names currently being
//! validated. The names must be delegated to this host with NS records; every
//! other question gets `NXDOMAIN`.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str;
use std::sync::mpsc::{sync_channel, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use packed_struct::prelude::*;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::{challenge_record_name, DnsChallengeProvider, ProviderError};

const MESSAGE_MAX_BYTES: usize = 512;
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const QUESTION_TYPE_TXT: u16 = 16;
const QUESTION_CLASS_IN: u16 = 1;
const RCODE_NXDOMAIN: u8 = 3;
// compression pointer to the question name, which always sits right after the header
const QUESTION_NAME_POINTER: [u8; 2] = [0xC0, 0x0C];

type Records = Arc<RwLock<HashMap<String, Vec<String>>>>;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("packing error: {0:?}")]
    Packing(PackingError),

    #[error("label is not valid UTF-8: {0}")]
    Utf8(#[from] str::Utf8Error),

    #[error("message truncated")]
    Truncated,

    #[error("not a standard query")]
    NotAQuery,

    #[error("unsupported question (type {kind}, class {class})")]
    UnsupportedQuestion { kind: u16, class: u16 },
}

impl From<PackingError> for MessageError {
    fn from(e: PackingError) -> Self {
        MessageError::Packing(e)
    }
}

#[derive(PackedStruct, Debug)]
#[packed_struct(endian = "msb")]
pub struct Header {
    id: u16,
    qr: bool,
    opcode: Integer<u8, packed_bits::Bits4>,
    aa: bool,
    tc: bool,
    rd: bool,
    ra: bool,
    z: Integer<u8, packed_bits::Bits3>,
    rcode: Integer<u8, packed_bits::Bits4>,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

#[derive(PackedStruct, Debug)]
#[packed_struct(endian = "msb")]
pub struct QuestionInfo {
    kind: u16,
    class: u16,
}

#[derive(PackedStruct, Debug)]
#[packed_struct(endian = "msb")]
pub struct ResourceInfo {
    kind: u16,
    class: u16,
    ttl: u32,
    rdlength: u16,
}

/// Split `buf` into the question's labels and the remaining bytes.
fn extract_labels(mut buf: &[u8]) -> Result<(Vec<&str>, &[u8]), MessageError> {
    let mut labels = vec![];

    loop {
        let (&length, rest) = buf.split_first().ok_or(MessageError::Truncated)?;
        if length == 0 {
            return Ok((labels, rest));
        }
        // compressed names never appear in a query's only question
        if length & 0xC0 != 0 || rest.len() < length as usize {
            return Err(MessageError::Truncated);
        }

        let (label, rest) = rest.split_at(length as usize);
        labels.push(str::from_utf8(label)?);
        buf = rest;
    }
}

fn put_character_string(out: &mut Vec<u8>, string: &str) {
    for chunk in string.as_bytes().chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

/// Build the response to one query. The question section is echoed back
/// verbatim.
fn respond(request: &[u8], records: &HashMap<String, Vec<String>>) -> Result<Vec<u8>, MessageError> {
    let header_len = Header::packed_bytes();
    if request.len() < header_len {
        return Err(MessageError::Truncated);
    }
    let req_header = Header::unpack_from_slice(&request[..header_len])?;
    if req_header.qr || req_header.qdcount != 1 {
        return Err(MessageError::NotAQuery);
    }

    let (labels, rest) = extract_labels(&request[header_len..])?;
    let info_len = QuestionInfo::packed_bytes();
    if rest.len() < info_len {
        return Err(MessageError::Truncated);
    }
    let question_info = QuestionInfo::unpack_from_slice(&rest[..info_len])?;
    if question_info.kind != QUESTION_TYPE_TXT || question_info.class != QUESTION_CLASS_IN {
        return Err(MessageError::UnsupportedQuestion {
            kind: question_info.kind,
            class: question_info.class,
        });
    }

    let question_end = request.len() - rest.len() + info_len;
    let name = labels.join(".").to_ascii_lowercase();
    let answers = records.get(&name).map(Vec::as_slice).unwrap_or_default();

    let response_header = Header {
        id: req_header.id,
        qr: true,
        opcode: 0u8.into(),
        aa: true,
        tc: false,
        rd: req_header.rd,
        ra: false,
        z: 0u8.into(),
        rcode: (if answers.is_empty() { RCODE_NXDOMAIN } else { 0 }).into(),
        qdcount: 1,
        ancount: answers.len() as u16,
        nscount: 0,
        arcount: 0,
    };

    let mut out = vec![0u8; header_len];
    response_header.pack_to_slice(&mut out)?;
    out.extend_from_slice(&request[header_len..question_end]);

    for proof in answers {
        let mut rdata = Vec::with_capacity(proof.len() + 1);
        put_character_string(&mut rdata, proof);

        let mut resource_info = [0u8; 10];
        ResourceInfo {
            kind: QUESTION_TYPE_TXT,
            class: QUESTION_CLASS_IN,
            ttl: 0,
            rdlength: rdata.len() as u16,
        }
        .pack_to_slice(&mut resource_info)?;

        out.extend_from_slice(&QUESTION_NAME_POINTER);
        out.extend_from_slice(&resource_info);
        out.extend_from_slice(&rdata);
    }

    Ok(out)
}

fn serve(socket: UdpSocket, records: Records, kill_rx: std::sync::mpsc::Receiver<()>) {
    loop {
        let mut buf = [0u8; MESSAGE_MAX_BYTES];
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => {
                let response = {
                    let records = records.read();
                    respond(&buf[..len], &records)
                };
                match response {
                    Ok(response) => {
                        trace!(source = %source, "Answering DNS query");
                        if let Err(e) = socket.send_to(&response, source) {
                            warn!(source = %source, error = %e, "Failed to respond to DNS request");
                        }
                    }
                    Err(e) => debug!(source = %source, error = %e, "Ignoring invalid DNS request"),
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => warn!(error = %e, "DNS socket receive failed"),
        }

        match kill_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }
    }
}

struct Server {
    addr: SocketAddr,
    kill_tx: SyncSender<()>,
    handle: JoinHandle<()>,
}

impl Server {
    fn start(bind: SocketAddr, records: Records) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let addr = socket.local_addr()?;

        let (kill_tx, kill_rx) = sync_channel(1);
        let handle = thread::Builder::new()
            .name("dns-01-responder".into())
            .spawn(move || serve(socket, records, kill_rx))?;

        info!(addr = %addr, "Started DNS-01 responder");
        Ok(Server {
            addr,
            kill_tx,
            handle,
        })
    }

    fn stop(self) {
        let _ = self.kill_tx.try_send(());
        if self.handle.join().is_err() {
            warn!("DNS-01 responder thread panicked");
        }
        info!(addr = %self.addr, "Stopped DNS-01 responder");
    }
}

/// Serves challenge TXT records from a UDP socket bound on first use.
pub struct StandaloneProvider {
    bind: SocketAddr,
    records: Records,
    server: Mutex<Option<Server>>,
}

impl StandaloneProvider {
    pub fn new(bind: SocketAddr) -> Self {
        StandaloneProvider {
            bind,
            records: Records::default(),
            server: Mutex::new(None),
        }
    }

    /// Address the responder is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|server| server.addr)
    }
}

impl DnsChallengeProvider for StandaloneProvider {
    fn present(&self, domain: &str, value: &str) -> Result<(), ProviderError> {
        let mut server = self.server.lock();
        if server.is_none() {
            *server = Some(Server::start(self.bind, self.records.clone())?);
        }

        self.records
            .write()
            .entry(challenge_record_name(domain))
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    fn cleanup(&self, domain: &str, value: &str) -> Result<(), ProviderError> {
        let now_empty = {
            let mut records = self.records.write();
            let name = challenge_record_name(domain);
            if let Some(values) = records.get_mut(&name) {
                values.retain(|v| v != value);
                if values.is_empty() {
                    records.remove(&name);
                }
            }
            records.is_empty()
        };

        if now_empty {
            if let Some(server) = self.server.lock().take() {
                server.stop();
            }
        }
        Ok(())
    }

    // answered directly by us
    fn wait_for_propagation(&self, _domain: &str, _value: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

impl Drop for StandaloneProvider {
    fn drop(&mut self) {
        if let Some(server) = self.server.get_mut().take() {
            server.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(id: u16, name: &str, kind: u16) -> Vec<u8> {
        let mut out = vec![(id >> 8) as u8, id as u8, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&kind.to_be_bytes());
        out.extend_from_slice(&QUESTION_CLASS_IN.to_be_bytes());
        out
    }

    fn records(name: &str, values: &[&str]) -> HashMap<String, Vec<String>> {
        let mut records = HashMap::new();
        records.insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
        records
    }

    /// TXT strings of every answer in `response`, which must echo `request`.
    fn answers(request: &[u8], response: &[u8]) -> Vec<String> {
        let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;
        let mut pos = request.len();
        let mut found = Vec::new();
        for _ in 0..ancount {
            assert_eq!(&response[pos..pos + 2], &QUESTION_NAME_POINTER);
            let rdlength = u16::from_be_bytes([response[pos + 10], response[pos + 11]]) as usize;
            let rdata = &response[pos + 12..pos + 12 + rdlength];
            found.push(str::from_utf8(&rdata[1..]).unwrap().to_string());
            pos += 12 + rdlength;
        }
        assert_eq!(pos, response.len());
        found
    }

    #[test]
    fn answers_known_txt_question() {
        let request = query(0xBEEF, "_acme-challenge.Example.com", QUESTION_TYPE_TXT);
        let response = respond(&request, &records("_acme-challenge.example.com", &["a", "b"])).unwrap();

        assert_eq!(&response[..2], &[0xBE, 0xEF]);
        assert_eq!(response[2] & 0x80, 0x80, "QR bit");
        assert_eq!(response[2] & 0x04, 0x04, "AA bit");
        assert_eq!(response[3] & 0x0F, 0, "rcode");
        assert_eq!(&response[12..request.len()], &request[12..]);
        assert_eq!(answers(&request, &response), vec!["a", "b"]);
    }

    #[test]
    fn unknown_name_is_nxdomain() {
        let request = query(7, "_acme-challenge.other.org", QUESTION_TYPE_TXT);
        let response = respond(&request, &records("_acme-challenge.example.com", &["a"])).unwrap();

        assert_eq!(response[3] & 0x0F, RCODE_NXDOMAIN);
        assert!(answers(&request, &response).is_empty());
    }

    #[test]
    fn rejects_malformed_requests() {
        let records = records("_acme-challenge.example.com", &["a"]);

        assert!(matches!(respond(&[0, 1, 2], &records), Err(MessageError::Truncated)));

        let request = query(1, "_acme-challenge.example.com", 1);
        assert!(matches!(
            respond(&request, &records),
            Err(MessageError::UnsupportedQuestion { kind: 1, .. })
        ));

        let mut truncated = query(1, "_acme-challenge.example.com", QUESTION_TYPE_TXT);
        truncated.truncate(20);
        assert!(matches!(respond(&truncated, &records), Err(MessageError::Truncated)));
    }

    #[test]
    fn long_values_are_split_into_strings() {
        let mut out = Vec::new();
        put_character_string(&mut out, &"x".repeat(300));
        assert_eq!(out[0], 255);
        assert_eq!(out[256], 45);
        assert_eq!(out.len(), 302);
    }

    #[test]
    fn serves_over_udp_until_cleaned_up() {
        let provider = StandaloneProvider::new("127.0.0.1:0".parse().unwrap());
        provider.present("*.example.com", "proof").unwrap();
        let addr = provider.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let request = query(99, "_acme-challenge.example.com", QUESTION_TYPE_TXT);
        client.send_to(&request, addr).unwrap();

        let mut buf = [0u8; MESSAGE_MAX_BYTES];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(answers(&request, &buf[..len]), vec!["proof"]);

        provider.cleanup("*.example.com", "proof").unwrap();
        assert!(provider.local_addr().is_none());
    }
}
