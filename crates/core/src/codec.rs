//! Hit encodings used when hits are written to storage.

use std::collections::BTreeMap;
use std::convert::Infallible;

use chrono::{DateTime, Utc};
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

use crate::{Hit, Multimap, Request};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cbor encode: {0}")]
    CborEncode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    CborDecode(#[from] minicbor::decode::Error),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Pluggable encoder/decoder pair for hits at rest.
pub trait HitCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, hit: &Hit) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Hit, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl HitCodec for JsonCodec {
    fn name(&self) -> &'static str { "json" }

    fn encode(&self, hit: &Hit) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(hit)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Hit, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact CBOR encoding with short field keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl HitCodec for CborCodec {
    fn name(&self) -> &'static str { "cbor" }

    fn encode(&self, hit: &Hit) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(256);
        let mut enc = Encoder::new(&mut buf);
        encode_hit(&mut enc, hit)?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Hit, CodecError> {
        let mut dec = Decoder::new(bytes);
        decode_hit(&mut dec)
    }
}

type EncResult = Result<(), minicbor::encode::Error<Infallible>>;

fn encode_hit(enc: &mut Encoder<&mut Vec<u8>>, hit: &Hit) -> EncResult {
    enc.map(8)?;
    enc.str("i")?.str(&hit.id)?;
    enc.str("ci")?.str(&hit.client_id)?;
    enc.str("ai")?.str(&hit.authoritative_client_id)?;
    enc.str("pi")?.str(&hit.property_id)?;
    enc.str("uid")?;
    match &hit.user_id {
        Some(u) => enc.str(u)?,
        None => enc.null()?,
    };
    enc.str("en")?.str(&hit.event_name)?;
    enc.str("md")?.map(hit.metadata.len() as u64)?;
    for (k, v) in &hit.metadata {
        enc.str(k)?.str(v)?;
    }
    enc.str("sa")?;
    encode_request(enc, &hit.request)
}

fn encode_request(enc: &mut Encoder<&mut Vec<u8>>, req: &Request) -> EncResult {
    enc.map(8)?;
    enc.str("m")?.str(&req.method)?;
    enc.str("h")?.str(&req.host)?;
    enc.str("p")?.str(&req.path)?;
    enc.str("ip")?.str(&req.ip)?;
    enc.str("he")?;
    encode_multimap(enc, &req.headers)?;
    enc.str("qp")?;
    encode_multimap(enc, &req.query)?;
    enc.str("bd")?.bytes(&req.body)?;
    let t = req.server_received_time;
    enc.str("srt")?.array(2)?.i64(t.timestamp())?.u32(t.timestamp_subsec_nanos())?;
    Ok(())
}

fn encode_multimap(enc: &mut Encoder<&mut Vec<u8>>, m: &Multimap) -> EncResult {
    enc.map(m.len() as u64)?;
    for (k, values) in m {
        enc.str(k)?.array(values.len() as u64)?;
        for v in values {
            enc.str(v)?;
        }
    }
    Ok(())
}

fn definite(len: Option<u64>, field: &'static str) -> Result<u64, CodecError> {
    len.ok_or(CodecError::InvalidField { field, reason: "indefinite length".into() })
}

fn decode_hit(dec: &mut Decoder<'_>) -> Result<Hit, CodecError> {
    let len = definite(dec.map()?, "hit")?;
    let mut hit = Hit::default();
    for _ in 0..len {
        match dec.str()? {
            "i" => hit.id = dec.str()?.to_string(),
            "ci" => hit.client_id = dec.str()?.to_string(),
            "ai" => hit.authoritative_client_id = dec.str()?.to_string(),
            "pi" => hit.property_id = dec.str()?.to_string(),
            "uid" => {
                hit.user_id = if dec.datatype()? == Type::Null {
                    dec.null()?;
                    None
                } else {
                    Some(dec.str()?.to_string())
                };
            }
            "en" => hit.event_name = dec.str()?.to_string(),
            "md" => {
                let n = definite(dec.map()?, "md")?;
                let mut md = BTreeMap::new();
                for _ in 0..n {
                    let k = dec.str()?.to_string();
                    md.insert(k, dec.str()?.to_string());
                }
                hit.metadata = md;
            }
            "sa" => hit.request = decode_request(dec)?,
            _ => dec.skip()?,
        }
    }
    Ok(hit)
}

fn decode_request(dec: &mut Decoder<'_>) -> Result<Request, CodecError> {
    let len = definite(dec.map()?, "sa")?;
    let mut req = Request::default();
    for _ in 0..len {
        match dec.str()? {
            "m" => req.method = dec.str()?.to_string(),
            "h" => req.host = dec.str()?.to_string(),
            "p" => req.path = dec.str()?.to_string(),
            "ip" => req.ip = dec.str()?.to_string(),
            "he" => req.headers = decode_multimap(dec, "he")?,
            "qp" => req.query = decode_multimap(dec, "qp")?,
            "bd" => req.body = dec.bytes()?.to_vec(),
            "srt" => {
                if definite(dec.array()?, "srt")? != 2 {
                    return Err(CodecError::InvalidField { field: "srt", reason: "expected [secs, nanos]".into() });
                }
                let secs = dec.i64()?;
                let nanos = dec.u32()?;
                req.server_received_time = DateTime::<Utc>::from_timestamp(secs, nanos)
                    .ok_or(CodecError::InvalidField { field: "srt", reason: format!("out of range: {secs}.{nanos}") })?;
            }
            _ => dec.skip()?,
        }
    }
    Ok(req)
}

fn decode_multimap(dec: &mut Decoder<'_>, field: &'static str) -> Result<Multimap, CodecError> {
    let n = definite(dec.map()?, field)?;
    let mut out = Multimap::new();
    for _ in 0..n {
        let k = dec.str()?.to_string();
        let count = definite(dec.array()?, field)?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(dec.str()?.to_string());
        }
        out.insert(k, values);
    }
    Ok(out)
}
