//! DNS wire queries over the pooled DoT channel (RFC 7858).

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dns::pool::DnsPool;
use crate::error::DnsError;
use crate::probe;

/// Resolves `host` over a fresh DoT channel from the pool. The record type
/// matching this host's connectivity is asked first; when it yields nothing
/// the other family is tried on the same channel.
pub(crate) async fn lookup(
    pool: &DnsPool,
    host: &str,
    first_fragment_len: u8,
) -> Result<Vec<IpAddr>, DnsError> {
    let mut name = Name::from_utf8(host)?;
    name.set_fqdn(true);

    let mut stream = pool.dial_dot(first_fragment_len).await?;

    let preferred = if probe::is_ipv6_available() {
        RecordType::AAAA
    } else {
        RecordType::A
    };
    let mut addrs = query(&mut stream, &name, preferred).await?;
    if addrs.is_empty() {
        let other = if preferred == RecordType::AAAA {
            RecordType::A
        } else {
            RecordType::AAAA
        };
        addrs = query(&mut stream, &name, other).await?;
    }
    if addrs.is_empty() {
        return Err(DnsError::NoDnsAvailable);
    }
    Ok(addrs)
}

/// One query/response exchange. Messages are framed with the 2-byte
/// big-endian length prefix shared by DNS-over-TCP and DoT.
async fn query<S>(stream: &mut S, name: &Name, rtype: RecordType) -> Result<Vec<IpAddr>, DnsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name.clone(), rtype));
    let wire = msg.to_vec()?;

    stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
    stream.write_all(&wire).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    stream.read_exact(&mut buf).await?;

    let response = Message::from_vec(&buf)?;
    Ok(response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;

    /// Answers one framed query on the server half of a duplex pipe.
    async fn answer_one<S>(stream: &mut S, addr: std::net::Ipv4Addr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut buf).await.unwrap();
        let request = Message::from_vec(&buf).unwrap();

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        if let Some(q) = request.queries().first() {
            response.add_query(q.clone());
            response.add_answer(Record::from_rdata(q.name().clone(), 300, RData::A(A(addr))));
        }
        let wire = response.to_vec().unwrap();
        stream
            .write_all(&(wire.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&wire).await.unwrap();
    }

    #[tokio::test]
    async fn query_roundtrip_extracts_addresses() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            answer_one(&mut server, std::net::Ipv4Addr::new(93, 184, 216, 34)).await;
        });

        let mut name = Name::from_utf8("example.com").unwrap();
        name.set_fqdn(true);
        let addrs = query(&mut client, &name, RecordType::A).await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        server_task.await.unwrap();
    }
}
