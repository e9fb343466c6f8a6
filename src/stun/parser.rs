use crate::stun::message::*;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub struct Parser;

impl Parser {
    /// Decodes one UDP datagram as a STUN binding message
    ///
    /// Datagrams that are not well-formed binding requests or success
    /// responses are rejected with an error; the caller decides whether
    /// that means "corrupt" or just "not for us".
    pub fn unmarshal(buf: &[u8]) -> crate::Result<Message> {
        if buf.len() < HDR_LEN {
            return Err(StunError::TooShort.into());
        }

        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let magic = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if !Parser::validate(magic, msg_len) {
            return Err(StunError::Invalid.into());
        }
        if buf.len() < HDR_LEN + msg_len {
            return Err(StunError::TooShort.into());
        }

        let mut txn_id: TxnId = [0u8; TXN_ID_LEN];
        txn_id.copy_from_slice(&buf[8..HDR_LEN]);

        match MessageType::try_from(msg_type)? {
            MessageType::BindingRequest => {
                let mut req = BindingRequest::new(txn_id);
                Parser::walk_attributes(buf, msg_len, |attr_type, value| {
                    match attr_type {
                        ATTR_CHANGE_REQUEST => {
                            if value.len() >= 4 {
                                let flags =
                                    u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                                req.change_ip = flags & CHANGE_IP_FLAG != 0;
                                req.change_port = flags & CHANGE_PORT_FLAG != 0;
                            }
                        }
                        ATTR_SOFTWARE => {
                            req.software = Some(String::from_utf8_lossy(value).into_owned());
                        }
                        _ => {}
                    }
                    Ok(())
                })?;
                Ok(Message::Request(req))
            }

            MessageType::BindingResponse => {
                let mut reply = BindingReply {
                    txn_id,
                    ..Default::default()
                };
                Parser::walk_attributes(buf, msg_len, |attr_type, value| {
                    match attr_type {
                        ATTR_MAPPED_ADDRESS => {
                            reply.mapped = Some(Parser::parse_address(value, None)?);
                        }
                        ATTR_XOR_MAPPED_ADDRESS | ATTR_XOR_MAPPED_ADDRESS_LEGACY => {
                            reply.xor_mapped = Some(Parser::parse_address(value, Some(&txn_id))?);
                        }
                        ATTR_SOURCE_ADDRESS => {
                            reply.source = Some(Parser::parse_address(value, None)?);
                        }
                        ATTR_CHANGED_ADDRESS | ATTR_OTHER_ADDRESS => {
                            if reply.alternate.is_none() {
                                reply.alternate = Some(Parser::parse_address(value, None)?);
                            }
                        }
                        ATTR_SOFTWARE => {
                            reply.software = Some(String::from_utf8_lossy(value).into_owned());
                        }
                        _ => {}
                    }
                    Ok(())
                })?;
                Ok(Message::Reply(reply))
            }

            // Rejections carry nothing the discovery flow can use.
            MessageType::BindingErrorResponse => Err(StunError::Invalid.into()),
        }
    }

    fn validate(magic: u32, msg_len: usize) -> bool {
        if magic != MAGIC_COOKIE {
            return false;
        }
        // Attribute section is 32-bit aligned by definition.
        if msg_len % 4 != 0 {
            return false;
        }
        true
    }

    /// Walks the attribute list with 4-byte alignment, handing each
    /// (type, value) pair to the visitor
    fn walk_attributes<F>(buf: &[u8], msg_len: usize, mut visit: F) -> crate::Result<()>
    where
        F: FnMut(u16, &[u8]) -> crate::Result<()>,
    {
        let end = HDR_LEN + msg_len;
        let mut pos = HDR_LEN;
        while pos + 4 <= end {
            let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            let value_end = pos + 4 + attr_len;
            if value_end > end {
                return Err(StunError::TruncatedAttribute.into());
            }
            visit(attr_type, &buf[pos + 4..value_end])?;
            // Values are padded to the next 32-bit boundary.
            pos += 4 + ((attr_len + 3) & !3);
        }
        Ok(())
    }

    /// Decodes an address attribute value, undoing the XOR obfuscation
    /// when `xor_with` carries the message's transaction ID
    fn parse_address(value: &[u8], xor_with: Option<&TxnId>) -> crate::Result<SocketAddr> {
        if value.len() < 8 {
            return Err(StunError::TruncatedAttribute.into());
        }
        let family = value[1];
        let mut port = u16::from_be_bytes([value[2], value[3]]);
        if xor_with.is_some() {
            port ^= (MAGIC_COOKIE >> 16) as u16;
        }
        match family {
            FAMILY_IPV4 => {
                let mut raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
                if xor_with.is_some() {
                    raw ^= MAGIC_COOKIE;
                }
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
            }
            FAMILY_IPV6 => {
                if value.len() < 20 {
                    return Err(StunError::TruncatedAttribute.into());
                }
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&value[4..20]);
                if let Some(txn_id) = xor_with {
                    // IPv6 XORs against the cookie followed by the transaction ID.
                    let cookie = MAGIC_COOKIE.to_be_bytes();
                    for (i, b) in raw.iter_mut().enumerate() {
                        *b ^= if i < 4 { cookie[i] } else { txn_id[i - 4] };
                    }
                }
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(raw)), port))
            }
            other => Err(StunError::UnsupportedFamily(other).into()),
        }
    }

    /// Encodes a STUN binding message into a datagram
    pub fn marshal(msg: &Message) -> Vec<u8> {
        let mut attrs = BytesMut::with_capacity(64);
        let (msg_type, txn_id) = match msg {
            Message::Request(req) => {
                let flags = req.change_flags();
                if flags != 0 {
                    attrs.put_u16(ATTR_CHANGE_REQUEST);
                    attrs.put_u16(4);
                    attrs.put_u32(flags);
                }
                if let Some(software) = &req.software {
                    Parser::put_software(&mut attrs, software);
                }
                (MessageType::BindingRequest, &req.txn_id)
            }
            Message::Reply(reply) => {
                if let Some(addr) = &reply.xor_mapped {
                    Parser::put_address(&mut attrs, ATTR_XOR_MAPPED_ADDRESS, addr, Some(&reply.txn_id));
                }
                if let Some(addr) = &reply.mapped {
                    Parser::put_address(&mut attrs, ATTR_MAPPED_ADDRESS, addr, None);
                }
                if let Some(addr) = &reply.source {
                    Parser::put_address(&mut attrs, ATTR_SOURCE_ADDRESS, addr, None);
                }
                if let Some(addr) = &reply.alternate {
                    Parser::put_address(&mut attrs, ATTR_CHANGED_ADDRESS, addr, None);
                }
                if let Some(software) = &reply.software {
                    Parser::put_software(&mut attrs, software);
                }
                (MessageType::BindingResponse, &reply.txn_id)
            }
        };

        let mut buf = BytesMut::with_capacity(HDR_LEN + attrs.len());
        // type
        buf.put_u16(msg_type as u16);
        // length of the attribute section
        buf.put_u16(attrs.len() as u16);
        // magic cookie: 0x2112A442
        buf.put_u32(MAGIC_COOKIE);
        // transaction id
        buf.put_slice(txn_id);
        // attributes
        buf.put_slice(&attrs);
        buf.to_vec()
    }

    fn put_software(buf: &mut BytesMut, software: &str) {
        let raw = software.as_bytes();
        buf.put_u16(ATTR_SOFTWARE);
        buf.put_u16(raw.len() as u16);
        buf.put_slice(raw);
        // Pad the value out to the next 32-bit boundary.
        for _ in 0..(4 - raw.len() % 4) % 4 {
            buf.put_u8(0);
        }
    }

    fn put_address(buf: &mut BytesMut, attr_type: u16, addr: &SocketAddr, xor_with: Option<&TxnId>) {
        let mut port = addr.port();
        if xor_with.is_some() {
            port ^= (MAGIC_COOKIE >> 16) as u16;
        }
        match addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u16(attr_type);
                buf.put_u16(8);
                buf.put_u8(0);
                buf.put_u8(FAMILY_IPV4);
                buf.put_u16(port);
                let mut raw = u32::from(ip);
                if xor_with.is_some() {
                    raw ^= MAGIC_COOKIE;
                }
                buf.put_u32(raw);
            }
            IpAddr::V6(ip) => {
                buf.put_u16(attr_type);
                buf.put_u16(20);
                buf.put_u8(0);
                buf.put_u8(FAMILY_IPV6);
                buf.put_u16(port);
                let mut raw = ip.octets();
                if let Some(txn_id) = xor_with {
                    let cookie = MAGIC_COOKIE.to_be_bytes();
                    for (i, b) in raw.iter_mut().enumerate() {
                        *b ^= if i < 4 { cookie[i] } else { txn_id[i - 4] };
                    }
                }
                buf.put_slice(&raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(seed: u8) -> TxnId {
        let mut id = [0u8; TXN_ID_LEN];
        for (i, b) in id.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        id
    }

    #[test]
    fn test_plain_request_layout() {
        let req = BindingRequest::new(txn(7));
        let buf = Parser::marshal(&Message::Request(req));

        // No attributes: header only.
        assert_eq!(buf.len(), 20);
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 0x0001);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 0);
        assert_eq!(
            u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            MAGIC_COOKIE
        );
        assert_eq!(&buf[8..20], &txn(7)[..]);
    }

    #[test]
    fn test_change_request_flags_round_trip() {
        let mut req = BindingRequest::new(txn(1));
        req.change_ip = true;
        req.change_port = true;
        let buf = Parser::marshal(&Message::Request(req));

        // CHANGE-REQUEST attribute: type 0x0003, length 4, flags 0x06.
        assert_eq!(u16::from_be_bytes([buf[20], buf[21]]), 0x0003);
        assert_eq!(u16::from_be_bytes([buf[22], buf[23]]), 4);
        assert_eq!(u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]), 0x06);

        match Parser::unmarshal(&buf).expect("parse request") {
            Message::Request(parsed) => {
                assert!(parsed.change_ip);
                assert!(parsed.change_port);
                assert_eq!(parsed.txn_id, txn(1));
            }
            other => panic!("expected request, got {}", other),
        }
    }

    #[test]
    fn test_xor_mapped_decode_vector() {
        // 192.168.1.1:12345 behind the XOR encoding.
        let id = txn(3);
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x0101u16.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&id);
        buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.push(0);
        buf.push(FAMILY_IPV4);
        buf.extend_from_slice(&(12345u16 ^ 0x2112).to_be_bytes());
        buf.extend_from_slice(&(0xC0A80101u32 ^ MAGIC_COOKIE).to_be_bytes());

        match Parser::unmarshal(&buf).expect("parse reply") {
            Message::Reply(reply) => {
                let mapped = reply.reflexive().expect("mapped address");
                assert_eq!(mapped, "192.168.1.1:12345".parse().unwrap());
            }
            other => panic!("expected reply, got {}", other),
        }
    }

    #[test]
    fn test_reply_round_trip_prefers_xor() {
        let reply = BindingReply {
            txn_id: txn(9),
            mapped: Some("198.51.100.4:40000".parse().unwrap()),
            xor_mapped: Some("203.0.113.7:62001".parse().unwrap()),
            source: Some("203.0.113.1:3478".parse().unwrap()),
            alternate: Some("203.0.113.2:3479".parse().unwrap()),
            software: Some("test-server/1.0".to_string()),
        };
        let buf = Parser::marshal(&Message::Reply(reply));

        match Parser::unmarshal(&buf).expect("parse reply") {
            Message::Reply(parsed) => {
                assert_eq!(parsed.txn_id, txn(9));
                assert_eq!(parsed.reflexive(), Some("203.0.113.7:62001".parse().unwrap()));
                assert_eq!(parsed.mapped, Some("198.51.100.4:40000".parse().unwrap()));
                assert_eq!(parsed.source, Some("203.0.113.1:3478".parse().unwrap()));
                assert_eq!(parsed.alternate, Some("203.0.113.2:3479".parse().unwrap()));
                assert_eq!(parsed.software.as_deref(), Some("test-server/1.0"));
            }
            other => panic!("expected reply, got {}", other),
        }
    }

    #[test]
    fn test_mapped_address_fallback() {
        let reply = BindingReply {
            txn_id: txn(2),
            mapped: Some("198.51.100.4:40000".parse().unwrap()),
            ..Default::default()
        };
        let buf = Parser::marshal(&Message::Reply(reply));
        match Parser::unmarshal(&buf).expect("parse reply") {
            Message::Reply(parsed) => {
                assert_eq!(parsed.reflexive(), Some("198.51.100.4:40000".parse().unwrap()));
            }
            other => panic!("expected reply, got {}", other),
        }
    }

    #[test]
    fn test_software_attribute_round_trip_with_padding() {
        let mut req = BindingRequest::new(txn(5));
        // 14 bytes of value, so two bytes of padding keep the message aligned.
        req.software = Some("natprobe/0.0.1".to_string());
        req.change_port = true;
        let buf = Parser::marshal(&Message::Request(req));
        assert_eq!(buf.len() % 4, 0);

        match Parser::unmarshal(&buf).expect("parse request") {
            Message::Request(parsed) => {
                assert_eq!(parsed.software.as_deref(), Some("natprobe/0.0.1"));
                assert!(parsed.change_port);
                assert!(!parsed.change_ip);
            }
            other => panic!("expected request, got {}", other),
        }
    }

    #[test]
    fn test_ipv6_xor_round_trip() {
        let reply = BindingReply {
            txn_id: txn(11),
            xor_mapped: Some("[2001:db8::1]:8080".parse().unwrap()),
            ..Default::default()
        };
        let buf = Parser::marshal(&Message::Reply(reply));
        match Parser::unmarshal(&buf).expect("parse reply") {
            Message::Reply(parsed) => {
                assert_eq!(parsed.reflexive(), Some("[2001:db8::1]:8080".parse().unwrap()));
            }
            other => panic!("expected reply, got {}", other),
        }
    }

    #[test]
    fn test_rejects_short_and_foreign_datagrams() {
        assert!(Parser::unmarshal(&[]).is_err());
        assert!(Parser::unmarshal(&[0u8; 12]).is_err());

        // Right length, wrong magic.
        let mut buf = Parser::marshal(&Message::Request(BindingRequest::new(txn(0))));
        buf[4] = 0xFF;
        assert!(Parser::unmarshal(&buf).is_err());

        // Binding error response is rejected as unusable.
        let mut buf = Parser::marshal(&Message::Request(BindingRequest::new(txn(0))));
        buf[0] = 0x01;
        buf[1] = 0x11;
        assert!(Parser::unmarshal(&buf).is_err());
    }

    #[test]
    fn test_rejects_truncated_attribute() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x0101u16.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&txn(4));
        // Attribute claims 32 bytes of value but only 4 follow.
        buf.extend_from_slice(&ATTR_SOFTWARE.to_be_bytes());
        buf.extend_from_slice(&32u16.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        assert!(Parser::unmarshal(&buf).is_err());
    }
}
