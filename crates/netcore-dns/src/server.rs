//! DNS front end.
//!
//! Binds UDP and TCP on port 53 and serves queries through the cache. Each
//! question in a request is resolved on its own task; answers are collected
//! back in question order. Replies are always marked authoritative, even
//! when the answer section was filled by a forwarder — that is the
//! long-standing observable behavior and downstreams depend on it.
//!
//! A TXT/IN query for `_wol.<host>` is a Wake-on-LAN trigger: the magic
//! packet is sent for `<host>` and the TXT answer reports "OKAY" or the
//! error text.

use async_trait::async_trait;
use hickory_proto::op::{Header, MessageType, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use netcore_wol::WolService;
use regex::Regex;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::DnsCache;
use crate::entry::Question;

const TCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request handler serving questions from the cache.
pub struct DnsHandler {
    cache: Arc<DnsCache>,
    wol: Option<Arc<WolService>>,
    wol_trigger: Regex,
}

impl DnsHandler {
    pub fn new(cache: Arc<DnsCache>, wol: Option<Arc<WolService>>) -> Self {
        Self {
            cache,
            wol,
            wol_trigger: Regex::new(r"^_wol\.").unwrap(),
        }
    }

    fn is_wol_trigger(&self, question: &Question) -> bool {
        question.qclass == DNSClass::IN
            && question.qtype == RecordType::TXT
            && self.wol_trigger.is_match(&question.name)
    }

    async fn serve_question(
        cache: Arc<DnsCache>,
        wol: Option<(Arc<WolService>, String)>,
        question: Question,
        start: Instant,
    ) -> Vec<Record> {
        let mut answers = Vec::new();

        if let Some((wol, hostname)) = wol {
            info!(hostname = %hostname, "wake-on-LAN requested");
            let status = match wol.wake_by_hostname(&hostname).await {
                Ok(()) => "OKAY".to_string(),
                Err(e) => e.to_string(),
            };
            if let Ok(name) = Name::from_str(&question.name) {
                answers.push(Record::from_rdata(
                    name,
                    0,
                    RData::TXT(TXT::new(vec![status])),
                ));
            }
        }

        if let Some(records) = cache.lookup(question, Some(start)).await {
            answers.extend(records);
        }
        answers
    }
}

#[async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        // Supposed responses sent to us are bogus.
        if request.header().message_type() == MessageType::Response {
            debug!(src = %request.src(), "dropping inbound response message");
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::FormErr);
            return header.into();
        }

        let start = Instant::now();

        // One task per question, collected in question order.
        let mut pending = Vec::new();
        for query in std::iter::once(request.query()) {
            let question = Question {
                name: query.name().to_string().to_lowercase(),
                qtype: query.query_type(),
                qclass: query.query_class(),
            };
            debug!(src = %request.src(), question = %question, "DNS query");

            let wol = if self.is_wol_trigger(&question) {
                self.wol.clone().map(|w| {
                    let hostname = self.wol_trigger.replace(&question.name, "").to_string();
                    (w, hostname)
                })
            } else {
                None
            };
            pending.push(tokio::spawn(Self::serve_question(
                self.cache.clone(),
                wol,
                question,
                start,
            )));
        }

        let mut answers: Vec<Record> = Vec::new();
        for task in pending {
            match task.await {
                Ok(records) => answers.extend(records),
                Err(e) => warn!(error = %e, "question task failed"),
            }
        }

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_response_code(if answers.is_empty() {
            ResponseCode::NXDomain
        } else {
            ResponseCode::NoError
        });

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "failed to send DNS response");
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

/// The netcore DNS server: UDP + TCP on one bind address.
pub struct DnsServer;

impl DnsServer {
    /// Bind the listeners and serve until the process exits or a listener
    /// fails.
    pub async fn start(bind_addr: SocketAddr, handler: DnsHandler) -> anyhow::Result<()> {
        let udp_socket = UdpSocket::bind(bind_addr).await?;
        let tcp_listener = TcpListener::bind(bind_addr).await?;

        info!(addr = %bind_addr, "DNS server listening (UDP + TCP)");

        let mut server = ServerFuture::new(handler);
        server.register_socket(udp_socket);
        server.register_listener(tcp_listener, TCP_REQUEST_TIMEOUT);

        server.block_until_done().await?;
        info!("DNS server stopped");
        Ok(())
    }
}
