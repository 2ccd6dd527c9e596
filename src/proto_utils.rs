use hickory_proto::error::ProtoResult;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// DNS 头部长度 / Fixed DNS header length.
pub const HEADER_LEN: usize = 12;

/// 无 EDNS 时的 UDP 负载上限 / UDP payload limit without EDNS.
pub const MIN_UDP_PAYLOAD: usize = 512;

/// 从原始报文头部读取事务 ID，用于无法完整解析的请求。
pub fn read_tx_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

/// 为无法解析的报文构造 FORMERR，仅依赖头部 12 字节。
///
/// Returns `None` when the packet is too short to carry an id, or when it
/// already is a response (QR set) and must not be answered.
pub fn formerr_for_raw(packet: &[u8]) -> Option<Vec<u8>> {
    let tx_id = read_tx_id(packet)?;
    // Flags: QR(1) Opcode(4) AA(1) TC(1) RD(1) | RA(1) Z(3) RCODE(4)
    let flags_hi = packet[2];
    if flags_hi & 0x80 != 0 {
        return None;
    }
    let opcode_rd = flags_hi & 0x79;
    let mut out = vec![0u8; HEADER_LEN];
    out[0..2].copy_from_slice(&tx_id.to_be_bytes());
    out[2] = 0x80 | opcode_rd;
    out[3] = 0x80 | (u16::from(ResponseCode::FormErr) as u8 & 0x0F);
    Some(out)
}

/// 构造与请求绑定的错误响应（FORMERR / NXDOMAIN / SERVFAIL 等）。
pub fn error_response(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_checking_disabled(req.checking_disabled());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().iter().cloned());
    msg
}

/// Re-binds an upstream or cached response to the inbound request.
///
/// Id, opcode, RD/CD and the question section come from `req`; the result
/// code and record sections stay as the upstream produced them.
pub fn rebind(mut resp: Message, req: &Message) -> Message {
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_checking_disabled(req.checking_disabled());
    resp.set_recursion_available(true);
    resp.take_queries();
    resp.add_queries(req.queries().iter().cloned());
    resp
}

pub fn encode(msg: &Message) -> ProtoResult<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(out)
}

/// 客户端可接受的 UDP 负载上限 / UDP payload size the requester accepts.
pub fn udp_payload_limit(req: &Message) -> usize {
    match req.extensions() {
        Some(edns) => usize::from(edns.max_payload()).max(MIN_UDP_PAYLOAD),
        None => MIN_UDP_PAYLOAD,
    }
}

/// 超出 UDP 上限时返回置 TC 的截断响应，客户端应改走 TCP。
pub fn fit_udp(resp: &Message, encoded: Vec<u8>, limit: usize) -> ProtoResult<Vec<u8>> {
    if encoded.len() <= limit {
        return Ok(encoded);
    }
    let mut truncated = resp.truncate();
    truncated.add_queries(resp.queries().iter().cloned());
    truncated.set_truncated(true);
    encode(&truncated)
}

/// 读取一个 2 字节长度前缀的 DNS 报文（TCP / TLS 通用）。
///
/// `Ok(None)` means the peer closed the stream cleanly before a new frame.
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    if let Err(err) = stream.read_exact(&mut len_buf).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let frame_len = u16::from_be_bytes(len_buf) as usize;
    if frame_len == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "zero-length dns frame",
        ));
    }
    let mut buf = vec![0u8; frame_len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<S>(stream: &mut S, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "dns message exceeds 65535 bytes")
    })?;
    let mut out = Vec::with_capacity(2 + data.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    stream.write_all(&out).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Edns, Query};
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        msg
    }

    #[test]
    fn formerr_echoes_id_and_rd() {
        let raw = encode(&query(0xBEEF)).unwrap();
        let resp = formerr_for_raw(&raw).expect("formerr");
        let parsed = Message::from_vec(&resp).unwrap();
        assert_eq!(parsed.id(), 0xBEEF);
        assert_eq!(parsed.message_type(), MessageType::Response);
        assert_eq!(parsed.response_code(), ResponseCode::FormErr);
        assert!(parsed.recursion_desired());
    }

    #[test]
    fn formerr_skips_short_and_response_packets() {
        assert!(formerr_for_raw(&[0u8; 5]).is_none());
        let mut resp = query(1);
        resp.set_message_type(MessageType::Response);
        assert!(formerr_for_raw(&encode(&resp).unwrap()).is_none());
    }

    #[test]
    fn rebind_keeps_rcode_and_answers() {
        let req = query(77);
        let mut upstream = Message::new();
        upstream.set_id(9);
        upstream.set_message_type(MessageType::Response);
        upstream.set_response_code(ResponseCode::NXDomain);
        upstream.add_query(Query::query(Name::from_str("EXAMPLE.com.").unwrap(), RecordType::A));

        let bound = rebind(upstream, &req);
        assert_eq!(bound.id(), 77);
        assert_eq!(bound.response_code(), ResponseCode::NXDomain);
        assert!(bound.recursion_desired());
        assert_eq!(bound.queries(), req.queries());
    }

    #[test]
    fn error_response_mirrors_request() {
        let req = query(5);
        let resp = error_response(&req, ResponseCode::ServFail);
        assert_eq!(resp.id(), 5);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.queries().len(), 1);
        assert!(resp.answers().is_empty());
    }

    #[test]
    fn payload_limit_respects_edns() {
        let mut req = query(1);
        assert_eq!(udp_payload_limit(&req), MIN_UDP_PAYLOAD);
        let mut edns = Edns::new();
        edns.set_max_payload(4096);
        req.set_edns(edns);
        assert_eq!(udp_payload_limit(&req), 4096);
    }

    #[test]
    fn oversized_udp_reply_is_truncated() {
        let req = query(3);
        let mut resp = error_response(&req, ResponseCode::NoError);
        let name = Name::from_str("example.com.").unwrap();
        for _ in 0..10 {
            let txt = TXT::new(vec!["x".repeat(200)]);
            resp.add_answer(Record::from_rdata(name.clone(), 60, RData::TXT(txt)));
        }
        let encoded = encode(&resp).unwrap();
        assert!(encoded.len() > MIN_UDP_PAYLOAD);

        let fitted = fit_udp(&resp, encoded, MIN_UDP_PAYLOAD).unwrap();
        let parsed = Message::from_vec(&fitted).unwrap();
        assert!(parsed.truncated());
        assert!(parsed.answers().is_empty());
        assert_eq!(parsed.id(), 3);
        assert_eq!(parsed.queries().len(), 1);
    }

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
