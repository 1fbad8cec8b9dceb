use crate::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cluster::{Bck, Cksum, CksumType, Ns, Provider};
use std::io::Write;
use tokio_util::codec::{Decoder, Encoder};

pub const NO_PAYLOAD: u32 = u32::MAX;

// Top bit of the header length marks a compressed payload.
const COMPRESSED: u32 = 1 << 31;
// Defensive bound on header size; real headers are well under 4 KiB.
const MAX_HEADER: u32 = 1 << 20;

/// Object attributes carried with every transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjAttrs {
    pub size: i64,
    pub atime: i64,
    pub version: Option<String>,
    pub cksum: Option<Cksum>,
}

/// Frame header: object identity, attributes, and opaque bytes whose
/// meaning belongs to the registered receive handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub bck: Bck,
    pub obj_name: String,
    pub attrs: ObjAttrs,
    pub opaque: Bytes,
}

#[derive(Debug)]
pub struct Msg {
    pub header: Header,
    pub payload: Option<Bytes>,
}

/// The packed intra-cluster request that EC carries in `opaque`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntraReq {
    pub sender: String,
    pub action: u8,
    pub exists: bool,
}

impl IntraReq {
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.sender.len() + 4);
        put_str(&mut buf, &self.sender);
        buf.put_u8(self.action);
        buf.put_u8(self.exists as u8);
        buf.freeze()
    }

    pub fn unpack(mut raw: &[u8]) -> Result<IntraReq, Error> {
        let sender = take_str(&mut raw)?;
        if raw.len() < 2 {
            return Err(Error::Frame("short intra-request"));
        }
        let action = raw.get_u8();
        let exists = raw.get_u8() != 0;
        Ok(IntraReq {
            sender,
            action,
            exists,
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn take_str(raw: &mut &[u8]) -> Result<String, Error> {
    if raw.len() < 2 {
        return Err(Error::Frame("short string length"));
    }
    let len = raw.get_u16() as usize;
    if raw.len() < len {
        return Err(Error::Frame("short string body"));
    }
    let (s, rest) = raw.split_at(len);
    let s = std::str::from_utf8(s).map_err(|_| Error::Frame("non-utf8 string"))?;
    *raw = rest;
    Ok(s.to_string())
}

impl Header {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, self.bck.provider.as_str());
        put_str(buf, &self.bck.ns.uuid);
        put_str(buf, &self.bck.ns.name);
        put_str(buf, &self.bck.name);
        put_str(buf, &self.obj_name);

        buf.put_i64(self.attrs.size);
        buf.put_i64(self.attrs.atime);
        put_str(buf, self.attrs.version.as_deref().unwrap_or(""));
        match &self.attrs.cksum {
            Some(ck) => {
                put_str(buf, ck.ty.as_str());
                put_str(buf, &ck.value);
            }
            None => {
                put_str(buf, "");
                put_str(buf, "");
            }
        }

        buf.put_u32(self.opaque.len() as u32);
        buf.put_slice(&self.opaque);
    }

    fn decode(mut raw: &[u8]) -> Result<Header, Error> {
        let provider = Provider::parse(&take_str(&mut raw)?)
            .map_err(|_| Error::Frame("bad provider"))?;
        let ns = Ns {
            uuid: take_str(&mut raw)?,
            name: take_str(&mut raw)?,
        };
        let mut bck = Bck::new(take_str(&mut raw)?, provider);
        bck.ns = ns;
        let obj_name = take_str(&mut raw)?;

        if raw.len() < 16 {
            return Err(Error::Frame("short attributes"));
        }
        let size = raw.get_i64();
        let atime = raw.get_i64();
        let version = match take_str(&mut raw)? {
            v if v.is_empty() => None,
            v => Some(v),
        };
        let cksum_ty = take_str(&mut raw)?;
        let cksum_val = take_str(&mut raw)?;
        let cksum = if cksum_ty.is_empty() {
            None
        } else {
            let ty = match cksum_ty.as_str() {
                "xxhash" => CksumType::Xxhash,
                "md5" => CksumType::Md5,
                _ => CksumType::None,
            };
            Some(Cksum {
                ty,
                value: cksum_val,
            })
        };

        if raw.len() < 4 {
            return Err(Error::Frame("short opaque length"));
        }
        let olen = raw.get_u32() as usize;
        if raw.len() < olen {
            return Err(Error::Frame("short opaque body"));
        }
        let opaque = Bytes::copy_from_slice(&raw[..olen]);

        Ok(Header {
            bck,
            obj_name,
            attrs: ObjAttrs {
                size,
                atime,
                version,
                cksum,
            },
            opaque,
        })
    }
}

/// Frame encoder/decoder. Compression is negotiated per stream: the
/// sender sets it, the receiver detects it per frame from the flag bit.
#[derive(Debug, Default)]
pub struct FrameCodec {
    pub compress: bool,
}

impl Encoder<Msg> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), Error> {
        let mut header = BytesMut::with_capacity(256);
        msg.header.encode(&mut header);
        debug_assert!((header.len() as u32) < MAX_HEADER);

        let payload = match msg.payload {
            Some(p) if self.compress => {
                let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(p.len() / 2));
                enc.write_all(&p)?;
                let compressed = enc
                    .finish()
                    .map_err(|_| Error::Frame("lz4 compression failed"))?;
                Some((Bytes::from(compressed), true))
            }
            Some(p) => Some((p, false)),
            None => None,
        };

        let mut hlen = header.len() as u32;
        if matches!(payload, Some((_, true))) {
            hlen |= COMPRESSED;
        }
        dst.put_u32(hlen);
        dst.put_slice(&header);
        match payload {
            Some((p, _)) => {
                dst.put_u32(p.len() as u32);
                dst.put_slice(&p);
            }
            None => dst.put_u32(NO_PAYLOAD),
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Msg;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let hlen_raw = u32::from_be_bytes(src[..4].try_into().unwrap());
        let compressed = hlen_raw & COMPRESSED != 0;
        let hlen = (hlen_raw & !COMPRESSED) as usize;
        if hlen as u32 > MAX_HEADER {
            return Err(Error::Frame("oversized header"));
        }
        if src.len() < 4 + hlen + 4 {
            return Ok(None);
        }
        let plen = u32::from_be_bytes(src[4 + hlen..8 + hlen].try_into().unwrap());
        let body_len = if plen == NO_PAYLOAD { 0 } else { plen as usize };
        if src.len() < 8 + hlen + body_len {
            src.reserve(8 + hlen + body_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let header = Header::decode(&src[..hlen])?;
        src.advance(hlen + 4);

        let payload = if plen == NO_PAYLOAD {
            None
        } else {
            let raw = src.split_to(body_len).freeze();
            if compressed {
                let mut dec = lz4_flex::frame::FrameDecoder::new(raw.as_ref());
                let mut out = Vec::new();
                std::io::Read::read_to_end(&mut dec, &mut out)
                    .map_err(|e| Error::Io(e))?;
                Some(Bytes::from(out))
            } else {
                Some(raw)
            }
        };

        Ok(Some(Msg { header, payload }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(payload: Option<&[u8]>) -> Msg {
        Msg {
            header: Header {
                bck: Bck::ais("data"),
                obj_name: "dir/obj.bin".to_string(),
                attrs: ObjAttrs {
                    size: 1234,
                    atime: 987654321,
                    version: Some("3".to_string()),
                    cksum: Some(Cksum {
                        ty: CksumType::Xxhash,
                        value: "cafebabe".to_string(),
                    }),
                },
                opaque: IntraReq {
                    sender: "t01".to_string(),
                    action: 2,
                    exists: true,
                }
                .pack(),
            },
            payload: payload.map(Bytes::copy_from_slice),
        }
    }

    fn round_trip(codec: &mut FrameCodec, m: Msg) -> Msg {
        let mut buf = BytesMut::new();
        codec.encode(m, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn header_and_payload_round_trip() {
        let mut codec = FrameCodec { compress: false };
        let got = round_trip(&mut codec, msg(Some(b"slice-bytes")));

        assert_eq!(got.header, msg(Some(b"")).header);
        assert_eq!(got.payload.unwrap().as_ref(), b"slice-bytes");

        let req = IntraReq::unpack(&got.header.opaque).unwrap();
        assert_eq!(req.sender, "t01");
        assert_eq!(req.action, 2);
        assert!(req.exists);
    }

    #[test]
    fn no_payload_sentinel() {
        let mut codec = FrameCodec { compress: false };
        let got = round_trip(&mut codec, msg(None));
        assert!(got.payload.is_none());
    }

    #[test]
    fn compressed_payload_round_trip() {
        let mut codec = FrameCodec { compress: true };
        let body: Vec<u8> = std::iter::repeat(b"abcdefgh".as_slice())
            .take(1000)
            .flatten()
            .copied()
            .collect();
        let got = round_trip(&mut codec, msg(Some(&body)));
        assert_eq!(got.payload.unwrap().as_ref(), &body[..]);
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = FrameCodec { compress: false };
        let mut buf = BytesMut::new();
        codec.encode(msg(Some(b"payload")), &mut buf).unwrap();

        // Feed one byte at a time; the decoder must not produce a frame
        // until the last byte arrives.
        let total = buf.len();
        let mut partial = BytesMut::new();
        for (i, b) in buf.iter().enumerate() {
            partial.put_u8(*b);
            let out = codec.decode(&mut partial).unwrap();
            if i + 1 < total {
                assert!(out.is_none());
            } else {
                assert!(out.is_some());
            }
        }
    }
}
