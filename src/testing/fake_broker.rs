//! In-process MQTT 3.1.1 broker for exercising the rumqttc transport
//!
//! Speaks just enough of the protocol for a client lifecycle over real TCP:
//! CONNECT/CONNACK, SUBSCRIBE/SUBACK, PUBLISH with its QoS 1/2 handshakes,
//! PINGREQ and DISCONNECT. Every connection can be cut on demand to simulate
//! a lost link.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const PUBREL: u8 = 6;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// Subscription request seen by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedSubscription {
    /// 1-based index of the connection that sent it
    pub connection: usize,
    pub topic: String,
    pub qos: u8,
}

#[derive(Debug, Default)]
struct Recorded {
    connections: usize,
    disconnects: usize,
    connect_codes: VecDeque<u8>,
    subscriptions: Vec<ReceivedSubscription>,
    publishes: Vec<(String, Vec<u8>)>,
}

type Shared = Arc<Mutex<Recorded>>;

fn lock(shared: &Shared) -> MutexGuard<'_, Recorded> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Loopback broker bound to an ephemeral port
pub struct FakeBroker {
    port: u16,
    recorded: Shared,
    drop_tx: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let recorded = Shared::default();
        let (drop_tx, drop_rx) = watch::channel(0u64);

        let accept_task = tokio::spawn(accept_loop(listener, recorded.clone(), drop_rx));

        Ok(Self {
            port,
            recorded,
            drop_tx,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Answer the next CONNECT with `code` (0 accepts); unscripted connects are accepted
    pub fn push_connect_code(&self, code: u8) {
        lock(&self.recorded).connect_codes.push_back(code);
    }

    /// Close every open connection without a DISCONNECT
    pub fn drop_connections(&self) {
        self.drop_tx.send_modify(|generation| *generation += 1);
    }

    /// Number of CONNECT packets received
    pub fn connections(&self) -> usize {
        lock(&self.recorded).connections
    }

    /// Number of DISCONNECT packets received
    pub fn disconnects(&self) -> usize {
        lock(&self.recorded).disconnects
    }

    pub fn subscriptions(&self) -> Vec<ReceivedSubscription> {
        lock(&self.recorded).subscriptions.clone()
    }

    /// Topics subscribed on one connection, in arrival order
    pub fn subscriptions_on(&self, connection: usize) -> Vec<String> {
        lock(&self.recorded)
            .subscriptions
            .iter()
            .filter(|subscription| subscription.connection == connection)
            .map(|subscription| subscription.topic.clone())
            .collect()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.recorded).publishes.clone()
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn accept_loop(listener: TcpListener, recorded: Shared, drop_rx: watch::Receiver<u64>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Fake broker accepted connection");
                tokio::spawn(serve_connection(stream, recorded.clone(), drop_rx.clone()));
            }
            Err(e) => {
                debug!(error = %e, "Fake broker stopped accepting");
                return;
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    recorded: Shared,
    mut drop_rx: watch::Receiver<u64>,
) {
    // Only cuts requested after this connection was accepted apply to it
    let _ = drop_rx.borrow_and_update();
    let mut connection = 0;

    loop {
        let packet = tokio::select! {
            _ = drop_rx.changed() => {
                debug!(connection = connection, "Fake broker cutting connection");
                return;
            }
            packet = read_packet(&mut stream) => packet,
        };

        let Ok((header, body)) = packet else {
            return;
        };

        let reply = match header >> 4 {
            CONNECT => {
                let code = {
                    let mut recorded = lock(&recorded);
                    recorded.connections += 1;
                    connection = recorded.connections;
                    recorded.connect_codes.pop_front().unwrap_or(0)
                };
                if stream.write_all(&[0x20, 0x02, 0x00, code]).await.is_err() || code != 0 {
                    return;
                }
                continue;
            }
            SUBSCRIBE => {
                let Some((packet_id, filters)) = parse_subscribe(&body) else {
                    return;
                };
                let mut reply = vec![0x90];
                reply.extend(encode_remaining_length(2 + filters.len()));
                reply.extend_from_slice(&packet_id.to_be_bytes());
                reply.extend(filters.iter().map(|(_, qos)| (*qos).min(2)));

                lock(&recorded)
                    .subscriptions
                    .extend(filters.into_iter().map(|(topic, qos)| ReceivedSubscription {
                        connection,
                        topic,
                        qos,
                    }));
                reply
            }
            PUBLISH => {
                let qos = (header >> 1) & 0x03;
                let Some((topic, packet_id, payload)) = parse_publish(&body, qos) else {
                    return;
                };
                lock(&recorded).publishes.push((topic, payload));
                match (qos, packet_id) {
                    (1, Some(id)) => ack(0x40, id),
                    (2, Some(id)) => ack(0x50, id),
                    _ => continue,
                }
            }
            PUBREL => match body.get(..2) {
                Some(id) => ack(0x70, u16::from_be_bytes([id[0], id[1]])),
                None => return,
            },
            PINGREQ => vec![0xD0, 0x00],
            DISCONNECT => {
                lock(&recorded).disconnects += 1;
                return;
            }
            _ => continue,
        };

        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn ack(packet_type: u8, packet_id: u16) -> Vec<u8> {
    let [high, low] = packet_id.to_be_bytes();
    vec![packet_type, 0x02, high, low]
}

async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    for _ in 0..4 {
        let byte = stream.read_u8().await?;
        remaining += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            let mut body = vec![0u8; remaining];
            stream.read_exact(&mut body).await?;
            return Ok((header, body));
        }
        multiplier *= 128;
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "remaining length exceeds four bytes",
    ))
}

fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            return out;
        }
    }
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Option<u16> {
    let bytes = buf.get(*cursor..*cursor + 2)?;
    *cursor += 2;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Option<String> {
    let len = usize::from(read_u16(buf, cursor)?);
    let bytes = buf.get(*cursor..*cursor + len)?;
    *cursor += len;
    String::from_utf8(bytes.to_vec()).ok()
}

fn parse_subscribe(body: &[u8]) -> Option<(u16, Vec<(String, u8)>)> {
    let mut cursor = 0;
    let packet_id = read_u16(body, &mut cursor)?;

    let mut filters = Vec::new();
    while cursor < body.len() {
        let topic = read_string(body, &mut cursor)?;
        let qos = *body.get(cursor)?;
        cursor += 1;
        filters.push((topic, qos));
    }
    Some((packet_id, filters))
}

fn parse_publish(body: &[u8], qos: u8) -> Option<(String, Option<u16>, Vec<u8>)> {
    let mut cursor = 0;
    let topic = read_string(body, &mut cursor)?;
    let packet_id = if qos > 0 {
        Some(read_u16(body, &mut cursor)?)
    } else {
        None
    };
    Some((topic, packet_id, body.get(cursor..)?.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_encoding() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(16_383), vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_parse_subscribe() {
        let body = [0x00, 0x07, 0x00, 0x03, b'a', b'/', b'b', 0x01, 0x00, 0x01, b'#', 0x00];

        let (packet_id, filters) = parse_subscribe(&body).unwrap();

        assert_eq!(packet_id, 7);
        assert_eq!(
            filters,
            vec![("a/b".to_string(), 1), ("#".to_string(), 0)]
        );
    }

    #[test]
    fn test_parse_publish() {
        let body = [0x00, 0x01, b't', 0x00, 0x09, b'h', b'i'];
        assert_eq!(
            parse_publish(&body, 1),
            Some(("t".to_string(), Some(9), b"hi".to_vec()))
        );

        let body = [0x00, 0x01, b't', b'h', b'i'];
        assert_eq!(
            parse_publish(&body, 0),
            Some(("t".to_string(), None, b"hi".to_vec()))
        );

        assert_eq!(parse_publish(&[0x00, 0x05, b't'], 0), None);
    }

    #[tokio::test]
    async fn test_read_packet_from_bytes() {
        let mut wire: &[u8] = &[0xC0, 0x00, 0x82, 0x02, 0x00, 0x01];

        assert_eq!(read_packet(&mut wire).await.unwrap(), (0xC0, vec![]));
        assert_eq!(read_packet(&mut wire).await.unwrap(), (0x82, vec![0x00, 0x01]));
        assert!(read_packet(&mut wire).await.is_err());
    }
}
