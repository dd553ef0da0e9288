//! Forwarder client.
//!
//! Non-authoritative questions are proxied to the configured upstreams in
//! order: UDP first, retrying the same upstream over TCP when the answer
//! came back truncated. The first successful exchange wins. An empty
//! forwarder list means no recursion; a list whose first entry is `"!"`
//! means recursion is explicitly disabled.

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, Record, RecordType};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

const UDP_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_TIMEOUT: Duration = Duration::from_secs(4);
const MAX_UDP_RESPONSE: usize = 4096;

/// Forward one question to the configured upstreams.
pub async fn forward(name: &str, qtype: RecordType, forwarders: &[String]) -> Vec<Record> {
    if forwarders.is_empty() {
        return Vec::new();
    }
    if forwarders[0].trim() == "!" {
        // Recursion explicitly disabled.
        return Vec::new();
    }

    let Ok(qname) = Name::from_str(name) else {
        warn!(name, "unforwardable name");
        return Vec::new();
    };

    for server in forwarders {
        let server = normalize_server(server);
        match exchange_udp(&server, &qname, qtype).await {
            Ok(msg) if msg.truncated() => {
                debug!(server = %server, name, "truncated answer, retrying over TCP");
                match exchange_tcp(&server, &qname, qtype).await {
                    Ok(mut msg) => return msg.take_answers(),
                    Err(e) => warn!(server = %server, error = %e, "TCP forward failed"),
                }
            }
            Ok(mut msg) => return msg.take_answers(),
            Err(e) => warn!(server = %server, error = %e, "UDP forward failed"),
        }
    }
    Vec::new()
}

/// Ensure the upstream address carries a port.
fn normalize_server(server: &str) -> String {
    let server = server.trim();
    if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:53")
    }
}

fn build_query(name: &Name, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name.clone(), qtype));
    message
}

async fn exchange_udp(server: &str, name: &Name, qtype: RecordType) -> std::io::Result<Message> {
    let query = build_query(name, qtype);
    let bytes = query
        .to_vec()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(&bytes, server).await?;

    let mut buf = [0u8; MAX_UDP_RESPONSE];
    let exchange = async {
        loop {
            let (len, _) = socket.recv_from(&mut buf).await?;
            match Message::from_vec(&buf[..len]) {
                Ok(msg) if msg.id() == query.id() => return Ok(msg),
                Ok(_) => continue,
                Err(e) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
                }
            }
        }
    };
    tokio::time::timeout(UDP_TIMEOUT, exchange)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "UDP exchange timed out"))?
}

async fn exchange_tcp(server: &str, name: &Name, qtype: RecordType) -> std::io::Result<Message> {
    let query = build_query(name, qtype);
    let bytes = query
        .to_vec()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let exchange = async {
        let mut stream = TcpStream::connect(server).await?;
        stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        Message::from_vec(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    };
    tokio::time::timeout(TCP_TIMEOUT, exchange)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "TCP exchange timed out"))?
}

/// Split a stored forwarders value into its entries.
pub fn parse_forwarders(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_forwarders_no_recursion() {
        let answers = forward("example.com.", RecordType::A, &[]).await;
        assert!(answers.is_empty());
    }

    #[tokio::test]
    async fn test_bang_disables_recursion() {
        let forwarders = vec!["!".to_string(), "8.8.8.8:53".to_string()];
        let answers = forward("example.com.", RecordType::A, &forwarders).await;
        assert!(answers.is_empty());
    }

    #[test]
    fn test_normalize_server_appends_port() {
        assert_eq!(normalize_server("8.8.8.8"), "8.8.8.8:53");
        assert_eq!(normalize_server(" 8.8.8.8:5353 "), "8.8.8.8:5353");
    }

    #[test]
    fn test_parse_forwarders_comma_separated() {
        assert_eq!(
            parse_forwarders("8.8.8.8:53, 8.8.4.4:53"),
            vec!["8.8.8.8:53".to_string(), "8.8.4.4:53".to_string()]
        );
        assert!(parse_forwarders("").is_empty());
    }

    #[test]
    fn test_build_query_sets_recursion() {
        let name = Name::from_str("example.com.").unwrap();
        let msg = build_query(&name, RecordType::A);
        assert!(msg.recursion_desired());
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].query_type(), RecordType::A);
    }
}
