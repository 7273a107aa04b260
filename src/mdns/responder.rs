//! Multicast DNS responder.
//!
//! Listens on the mDNS group (`224.0.0.251:5353`) and answers queries for
//! names present in the [`RecordTable`]:
//!
//! * **Owned names**: the answers for every question in the packet are
//!   merged into one authoritative response.
//! * **Anything else**: no response at all. That covers unknown names,
//!   responses and announcements from other hosts, and packets that do not
//!   parse. mDNS responders never send negative answers or errors.
//!
//! Replies are multicast to the group unless the querier asked for a
//! unicast response (QU bit) or is a legacy resolver querying from a port
//! other than 5353.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::{LowerName, Record};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::RecordTable;

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;
/// Largest packet mDNS allows over a jumbo-frame link.
const MAX_PACKET: usize = 9000;

/// A bound responder. The record table reports online from [`Responder::bind`]
/// until [`Responder::run`] returns.
pub struct Responder {
    socket: UdpSocket,
    table: Arc<RecordTable>,
}

impl Responder {
    pub fn bind(bind_addr: SocketAddr, table: Arc<RecordTable>) -> anyhow::Result<Self> {
        let socket = multicast_socket(bind_addr)?;
        info!("mDNS responder listening on {}", socket.local_addr()?);
        table.set_online(true);
        Ok(Self { socket, table })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let result = self.serve().await;
        self.table.set_online(false);
        result
    }

    async fn serve(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            let Some(reply) = reply(&self.table, &buf[..len], src).await else {
                continue;
            };
            let bytes = match reply.message.to_vec() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode mDNS response for {}: {}", src, e);
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&bytes, reply.destination).await {
                warn!("Failed to answer mDNS query from {}: {}", src, e);
            }
        }
    }
}

/// A response and where to send it.
#[derive(Debug)]
struct Reply {
    destination: SocketAddr,
    message: Message,
}

/// Builds the response to `packet`, or `None` when nothing should be sent.
async fn reply(table: &RecordTable, packet: &[u8], src: SocketAddr) -> Option<Reply> {
    let request = match Message::from_vec(packet) {
        Ok(request) => request,
        Err(e) => {
            debug!("Ignoring malformed packet from {}: {}", src, e);
            return None;
        }
    };
    // Announcements and answers from other hosts arrive on the same socket.
    if request.message_type() != MessageType::Query || request.op_code() != OpCode::Query {
        return None;
    }

    let mut answers: Vec<Record> = Vec::new();
    for query in request.queries() {
        let name = LowerName::new(query.name());
        for record in table.answers(&name, query.query_type()).await {
            if !answers.contains(&record) {
                answers.push(record);
            }
        }
    }
    if answers.is_empty() {
        return None;
    }

    let legacy = src.port() != MDNS_PORT;
    let unicast = legacy || request.queries().iter().any(|q| q.mdns_unicast_response());
    debug!(
        "Answering {} questions from {} with {} records ({})",
        request.queries().len(),
        src,
        answers.len(),
        if unicast { "unicast" } else { "multicast" }
    );

    let mut message = Message::new();
    message
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true);
    if legacy {
        // Legacy resolvers match the response on its id and question section.
        message.set_id(request.id());
        message.add_queries(request.queries().to_vec());
    }
    message.add_answers(answers);

    let destination = if unicast {
        src
    } else {
        SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP, MDNS_PORT))
    };
    Some(Reply {
        destination,
        message,
    })
}

fn multicast_socket(bind_addr: SocketAddr) -> io::Result<UdpSocket> {
    let SocketAddr::V4(addr) = bind_addr else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "mDNS responder needs an IPv4 bind address",
        ));
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Other responders (avahi, systemd-resolved) may share the port.
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.join_multicast_v4(&MDNS_GROUP, addr.ip())?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into())
}
