use std::net::IpAddr;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query as Question, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

use crate::engine::Decision;
use crate::proto_utils::Query;

/// Turns a local decision into response bytes. `None` means nothing is sent.
pub trait ResponseSynthesizer: Send + Sync {
    fn synthesize(&self, query: &Query, decision: &Decision) -> anyhow::Result<Option<Bytes>>;
}

/// Encodes answers with hickory-proto.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireSynthesizer;

impl ResponseSynthesizer for WireSynthesizer {
    fn synthesize(&self, query: &Query, decision: &Decision) -> anyhow::Result<Option<Bytes>> {
        match decision {
            Decision::Spoof { addrs, ttl, .. } => {
                let name = question_name(query)?;
                let answers = spoof_answers(&name, query.qtype, addrs, *ttl);
                build_response(query, name, ResponseCode::NoError, answers).map(Some)
            }
            Decision::Static { rcode, .. } => {
                build_response(query, question_name(query)?, *rcode, Vec::new()).map(Some)
            }
            // forwarded queries are answered by the upstream
            Decision::Drop { .. } | Decision::Forward { .. } => Ok(None),
        }
    }
}

fn question_name(query: &Query) -> anyhow::Result<Name> {
    Name::from_bytes(query.qname_wire()).context("decode question name")
}

/// Records of the family the question asks for; ANY gets both.
fn spoof_answers(name: &Name, qtype: RecordType, addrs: &[IpAddr], ttl: u32) -> Vec<Record> {
    let want_v4 = matches!(qtype, RecordType::A | RecordType::ANY);
    let want_v6 = matches!(qtype, RecordType::AAAA | RecordType::ANY);
    addrs
        .iter()
        .filter_map(|addr| {
            let rdata = match addr {
                IpAddr::V4(v4) if want_v4 => RData::A(A(*v4)),
                IpAddr::V6(v6) if want_v6 => RData::AAAA(AAAA(*v6)),
                _ => return None,
            };
            Some(Record::from_rdata(name.clone(), ttl, rdata))
        })
        .collect()
}

#[inline]
fn build_response(
    query: &Query,
    name: Name,
    rcode: ResponseCode,
    answers: Vec<Record>,
) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(query.tx_id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(query.recursion_desired);
    msg.set_recursion_available(query.recursion_desired);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);

    let mut question = Question::new();
    question.set_name(name);
    question.set_query_type(query.qtype);
    question.set_query_class(query.qclass);
    msg.add_query(question);
    msg.add_answers(answers);

    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}
