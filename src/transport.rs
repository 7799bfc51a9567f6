//! Upload wire format and the transport seam.
//!
//! A packet is `{ gateway_id: [u8;16], sequence_no: u64 }` followed by
//! `{ sensor_id: u32, record_count: u16, record[record_count] }` groups.
//! Records are `{ timestamp_ms: u64, value: u32 }`, with one extra
//! value-type discriminator byte for event sensors. The response is
//! `{ sequence_no: u64, status: u8 }`. Framing beyond these bytes (CoAP,
//! HTTP, anything request/response shaped) is the transport's business.

use crate::sensors::ValueKind;
use crate::storage::sector::Record;
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

pub const PACKET_PREFIX_LEN: usize = 24;
pub const GROUP_HEADER_LEN: usize = 6;
pub const RESPONSE_LEN: usize = 9;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o: {0}")]
    Io(String),
    #[error("malformed response")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkStatus {
    Ok,
    Reject,
    ServerError,
}

impl UplinkStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            UplinkStatus::Ok => 0,
            UplinkStatus::Reject => 1,
            UplinkStatus::ServerError => 2,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(UplinkStatus::Ok),
            1 => Some(UplinkStatus::Reject),
            2 => Some(UplinkStatus::ServerError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UplinkResponse {
    pub sequence_no: u64,
    pub status: UplinkStatus,
}

/// One sensor's slice of a packet.
#[derive(Debug, Clone)]
pub struct PacketGroup {
    pub sensor_id: u32,
    pub value_kind: ValueKind,
    pub records: Vec<Record>,
}

impl PacketGroup {
    pub fn wire_len(&self) -> usize {
        GROUP_HEADER_LEN + self.records.len() * self.value_kind.wire_len()
    }
}

pub fn encode_packet(gateway_id: &Uuid, sequence_no: u64, groups: &[PacketGroup]) -> Vec<u8> {
    let body: usize = groups.iter().map(PacketGroup::wire_len).sum();
    let mut buf = Vec::with_capacity(PACKET_PREFIX_LEN + body);
    buf.extend_from_slice(gateway_id.as_bytes());
    buf.extend_from_slice(&sequence_no.to_le_bytes());
    for group in groups {
        buf.extend_from_slice(&group.sensor_id.to_le_bytes());
        buf.extend_from_slice(&(group.records.len() as u16).to_le_bytes());
        for record in &group.records {
            buf.extend_from_slice(&record.timestamp_ms.to_le_bytes());
            buf.extend_from_slice(&record.value.to_le_bytes());
            if group.value_kind == ValueKind::Event {
                buf.push(record.event_kind);
            }
        }
    }
    buf
}

#[derive(Debug)]
pub struct DecodedPacket {
    pub gateway_id: Uuid,
    pub sequence_no: u64,
    pub groups: Vec<(u32, Vec<Record>)>,
}

/// Parse a packet back into records. `kind_of` resolves each sensor's
/// declared value type; unknown sensors make the packet malformed.
pub fn decode_packet(
    bytes: &[u8],
    kind_of: impl Fn(u32) -> Option<ValueKind>,
) -> Result<DecodedPacket, TransportError> {
    if bytes.len() < PACKET_PREFIX_LEN {
        return Err(TransportError::Malformed);
    }
    let gateway_id = Uuid::from_bytes(bytes[0..16].try_into().unwrap());
    let sequence_no = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    let mut groups = Vec::new();
    let mut offset = PACKET_PREFIX_LEN;
    while offset < bytes.len() {
        if offset + GROUP_HEADER_LEN > bytes.len() {
            return Err(TransportError::Malformed);
        }
        let sensor_id = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        let record_count =
            u16::from_le_bytes(bytes[offset + 4..offset + 6].try_into().unwrap()) as usize;
        offset += GROUP_HEADER_LEN;
        let kind = kind_of(sensor_id).ok_or(TransportError::Malformed)?;
        let wire_len = kind.wire_len();
        let mut records = Vec::with_capacity(record_count);
        for _ in 0..record_count {
            if offset + wire_len > bytes.len() {
                return Err(TransportError::Malformed);
            }
            let timestamp_ms =
                u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
            let value = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            let event_kind = if kind == ValueKind::Event {
                bytes[offset + 12]
            } else {
                0
            };
            records.push(Record {
                timestamp_ms,
                value,
                event_kind,
            });
            offset += wire_len;
        }
        groups.push((sensor_id, records));
    }
    Ok(DecodedPacket {
        gateway_id,
        sequence_no,
        groups,
    })
}

pub fn encode_response(response: &UplinkResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RESPONSE_LEN);
    buf.extend_from_slice(&response.sequence_no.to_le_bytes());
    buf.push(response.status.as_u8());
    buf
}

pub fn decode_response(bytes: &[u8]) -> Result<UplinkResponse, TransportError> {
    if bytes.len() != RESPONSE_LEN {
        return Err(TransportError::Malformed);
    }
    let sequence_no = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let status = UplinkStatus::from_u8(bytes[8]).ok_or(TransportError::Malformed)?;
    Ok(UplinkResponse {
        sequence_no,
        status,
    })
}

/// Platform request/response seam the coordinator drains into. One call
/// per packet; the caller enforces the timeout.
pub trait Transport: Send + Sync {
    fn send(&self, packet: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, TransportError>>;
}

/// Reference transport: POST the packet bytes, read the response bytes.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, packet: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, TransportError>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let response = client
                .post(&endpoint)
                .body(packet)
                .send()
                .await
                .map_err(|err| TransportError::Io(err.to_string()))?;
            if !response.status().is_success() {
                return Err(TransportError::Io(format!(
                    "uplink endpoint returned {}",
                    response.status()
                )));
            }
            let body = response
                .bytes()
                .await
                .map_err(|err| TransportError::Io(err.to_string()))?;
            Ok(body.to_vec())
        })
    }
}
