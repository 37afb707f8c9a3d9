//! Minimal DNS wire codec.
//!
//! The proxy never rewrites upstream payloads, so this codec only does two
//! things: pull the first question's QNAME/QTYPE out of a client query, and
//! synthesize an NXDOMAIN response for blocked names by patching the query's
//! own header and question bytes. Question sections carry no compression
//! pointers, which keeps the QNAME decode a plain label walk.

use hickory_proto::rr::RecordType;

/// Fixed DNS header size.
pub const HEADER_LEN: usize = 12;

/// Maximum label length per RFC 1035.
const MAX_LABEL_LEN: usize = 63;

/// Extract the first question from a raw DNS query.
///
/// Returns the QNAME (labels joined with `.`, no trailing dot) and the QTYPE
/// mapped to its IANA record type for logging. Returns `None` on malformed
/// input: short messages, labels that overrun the buffer, compression
/// pointers in the question section, non-UTF-8 labels, or an empty QNAME.
/// Callers treat `None` with a message of at least [`HEADER_LEN`] bytes as a
/// parse error for metrics purposes.
#[must_use]
pub fn parse_query(data: &[u8]) -> Option<(String, RecordType)> {
    if data.len() < HEADER_LEN + 1 {
        return None;
    }

    let mut pos = HEADER_LEN;
    let mut labels: Vec<&str> = Vec::new();

    loop {
        let len = *data.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len > MAX_LABEL_LEN {
            // Includes compression pointers (0xC0); not valid in a question.
            return None;
        }
        pos += 1;
        let label = data.get(pos..pos + len)?;
        labels.push(std::str::from_utf8(label).ok()?);
        pos += len;
    }

    if labels.is_empty() {
        return None;
    }

    // QTYPE and QCLASS must both be present for a complete question.
    if pos + 4 > data.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);

    Some((labels.join("."), RecordType::from(qtype)))
}

/// Synthesize an NXDOMAIN response for a query.
///
/// The response reuses the query's header (ID and flags preserved, QR set,
/// RCODE set to 3) and its question section verbatim. Answer, authority and
/// additional counts are cleared and no records follow the question, in
/// particular no EDNS0 OPT record, even if the query carried one.
///
/// Returns `None` if the question section cannot be delimited.
#[must_use]
pub fn nxdomain_response(query: &[u8]) -> Option<Vec<u8>> {
    let question_end = question_end(query)?;

    let mut response = query[..question_end].to_vec();
    response[2] |= 0x80; // QR = response
    response[3] = (response[3] & 0xF0) | 0x03; // RCODE = NXDOMAIN
    response[6] = 0; // ANCOUNT
    response[7] = 0;
    response[8] = 0; // NSCOUNT
    response[9] = 0;
    response[10] = 0; // ARCOUNT
    response[11] = 0;

    Some(response)
}

/// Offset one past the first question (QNAME + QTYPE + QCLASS).
fn question_end(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_LEN + 1 {
        return None;
    }

    let mut pos = HEADER_LEN;
    loop {
        let len = *data.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            return None;
        }
        pos += len;
        if pos > data.len() {
            return None;
        }
    }

    let end = pos + 4;
    if end > data.len() {
        return None;
    }
    Some(end)
}
